//! Namespaced debug channels with lazy message production.
//!
//! Namespaces use `:` as separator and patterns may use `*` per segment;
//! a trailing `*` matches any remaining depth (`pool:*` enables
//! `pool:dispatch:retry`). A call on a disabled channel returns before the
//! message thunk runs, so it performs no formatting and no allocation.
//!
//! Records flow to a pluggable [`LogSink`]; the default sink forwards to
//! the `log` facade with the namespace as the record target, so the usual
//! `env_logger`-style consumers pick them up.

use std::sync::Arc;

pub use log::Level;

/// Destination for enabled debug records.
pub trait LogSink: Send + Sync + 'static {
    fn write(&self, namespace: &str, level: Level, message: &str);
}

/// Forwards to the `log` facade with the namespace as dynamic target.
pub struct FacadeSink;

impl LogSink for FacadeSink {
    fn write(&self, namespace: &str, level: Level, message: &str) {
        log::logger().log(
            &log::Record::builder()
                .args(format_args!("{message}"))
                .level(level)
                .target(namespace)
                .build(),
        );
    }
}

struct DebugLogInner {
    patterns: Vec<String>,
    sink: Arc<dyn LogSink>,
}

/// Channel registry. Instantiated by the embedder and passed down; there
/// is no process-global state.
#[derive(Clone)]
pub struct DebugLog {
    inner: Arc<DebugLogInner>,
}

impl DebugLog {
    pub fn new(patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::with_sink(patterns, Arc::new(FacadeSink))
    }

    pub fn with_sink(
        patterns: impl IntoIterator<Item = impl Into<String>>,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            inner: Arc::new(DebugLogInner {
                patterns: patterns.into_iter().map(Into::into).collect(),
                sink,
            }),
        }
    }

    /// All channels disabled.
    pub fn disabled() -> Self {
        Self::new(Vec::<String>::new())
    }

    pub fn enabled(&self, namespace: &str) -> bool {
        self.inner
            .patterns
            .iter()
            .any(|pattern| matches_namespace(pattern, namespace))
    }

    /// Create a channel; enablement is computed once, here, so the per-call
    /// cost of a disabled channel is a single branch.
    pub fn channel(&self, namespace: impl Into<String>) -> DebugChannel {
        let namespace = namespace.into();
        DebugChannel {
            enabled: self.enabled(&namespace),
            namespace,
            sink: self.inner.sink.clone(),
        }
    }
}

/// One named log channel.
#[derive(Clone)]
pub struct DebugChannel {
    namespace: String,
    enabled: bool,
    sink: Arc<dyn LogSink>,
}

impl DebugChannel {
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Emit at an explicit level. `message` is only evaluated when the
    /// channel is enabled.
    pub fn log<F>(&self, level: Level, message: F)
    where
        F: FnOnce() -> String,
    {
        if !self.enabled {
            return;
        }
        self.sink.write(&self.namespace, level, &message());
    }

    pub fn debug<F>(&self, message: F)
    where
        F: FnOnce() -> String,
    {
        self.log(Level::Debug, message);
    }

    pub fn warn<F>(&self, message: F)
    where
        F: FnOnce() -> String,
    {
        self.log(Level::Warn, message);
    }
}

/// Segment-wise wildcard match. A trailing `*` segment swallows any
/// remaining namespace depth.
fn matches_namespace(pattern: &str, namespace: &str) -> bool {
    let mut pattern_segments = pattern.split(':').peekable();
    let mut namespace_segments = namespace.split(':');

    loop {
        match (pattern_segments.next(), namespace_segments.next()) {
            (None, None) => return true,
            // Trailing wildcard matches zero or more remaining segments.
            (Some("*"), _) if pattern_segments.peek().is_none() => return true,
            (Some("*"), Some(_)) => continue,
            (Some(expected), Some(actual)) if expected == actual => continue,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingSink {
        records: Mutex<Vec<(String, String)>>,
    }

    impl LogSink for RecordingSink {
        fn write(&self, namespace: &str, _level: Level, message: &str) {
            self.records
                .lock()
                .expect("sink lock")
                .push((namespace.to_string(), message.to_string()));
        }
    }

    #[test]
    fn pattern_matching() {
        assert!(matches_namespace("pool:dispatch", "pool:dispatch"));
        assert!(matches_namespace("pool:*", "pool:dispatch"));
        assert!(matches_namespace("pool:*", "pool:dispatch:retry"));
        assert!(matches_namespace("*", "anything"));
        assert!(matches_namespace("*:dispatch", "pool:dispatch"));
        assert!(!matches_namespace("pool:dispatch", "pool:scaler"));
        assert!(!matches_namespace("pool", "pool:dispatch"));
        assert!(!matches_namespace("*:dispatch", "pool:scaler"));
    }

    #[test]
    fn disabled_channel_never_evaluates_message() {
        let log = DebugLog::disabled();
        let channel = log.channel("pool:dispatch");
        let mut evaluated = false;
        channel.debug(|| {
            evaluated = true;
            String::from("should not run")
        });
        assert!(!evaluated);
    }

    #[test]
    fn enabled_channel_reaches_sink() {
        let sink = Arc::new(RecordingSink {
            records: Mutex::new(Vec::new()),
        });
        let log = DebugLog::with_sink(["pool:*"], sink.clone());
        log.channel("pool:worker").debug(|| "spawned".to_string());
        log.channel("scaler").debug(|| "ignored".to_string());

        let records = sink.records.lock().expect("sink lock");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, "pool:worker");
        assert_eq!(records[0].1, "spawned");
    }
}

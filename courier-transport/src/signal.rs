//! Background error signal.
//!
//! Fire-and-forget work (event handlers, detached response sends) has no
//! caller to return an error to. Those failures are reported to an
//! [`ErrorSink`] instead of being silently dropped or crashing the task.
//!
//! Sessions and servers take a sink at construction time; anything without
//! that context falls back to the process-wide sink, which tests may
//! replace with [`set_process_sink`].

use std::sync::{Arc, OnceLock, PoisonError, RwLock};

/// Observer for errors raised by background tasks.
pub trait ErrorSink: Send + Sync {
    /// Called once per background failure. Must not panic.
    fn background_error(&self, context: &str, error: &(dyn std::error::Error + Send + Sync));
}

/// The default sink: logs at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ErrorSink for LogSink {
    fn background_error(&self, context: &str, error: &(dyn std::error::Error + Send + Sync)) {
        tracing::error!(context, %error, "background task failed");
    }
}

static PROCESS_SINK: RwLock<Option<Arc<dyn ErrorSink>>> = RwLock::new(None);

/// Replace the process-wide sink.
pub fn set_process_sink(sink: Arc<dyn ErrorSink>) {
    *PROCESS_SINK
        .write()
        .unwrap_or_else(PoisonError::into_inner) = Some(sink);
}

/// The process-wide sink; [`LogSink`] unless replaced.
pub fn process_sink() -> Arc<dyn ErrorSink> {
    static DEFAULT: OnceLock<Arc<LogSink>> = OnceLock::new();
    let guard = PROCESS_SINK.read().unwrap_or_else(PoisonError::into_inner);
    match guard.as_ref() {
        Some(sink) => Arc::clone(sink),
        None => {
            let default: &Arc<LogSink> = DEFAULT.get_or_init(|| Arc::new(LogSink));
            let sink: Arc<dyn ErrorSink> = Arc::clone(default) as Arc<dyn ErrorSink>;
            sink
        }
    }
}

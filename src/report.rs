//! User-facing problem reporting.
//!
//! Every error that reaches the public API is logged through the `log` facade
//! and, if the application installed one, handed to a [`ReportCallback`].

use std::fmt;
use std::sync::Arc;

use crate::error::{RenderError, RenderResult};

/// How serious a reported event is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReportSeverity {
    Verbose,
    Info,
    /// Something works but is slow.
    Performance,
    Warning,
    /// The call failed but rendering can continue.
    NonCriticalError,
    /// The frame or resource is lost.
    CriticalError,
    /// The device is gone; nothing more can be rendered.
    DeviceLost,
}

impl ReportSeverity {
    pub fn log_level(&self) -> log::Level {
        match self {
            ReportSeverity::Verbose => log::Level::Trace,
            ReportSeverity::Info => log::Level::Info,
            ReportSeverity::Performance | ReportSeverity::Warning => log::Level::Warn,
            ReportSeverity::NonCriticalError
            | ReportSeverity::CriticalError
            | ReportSeverity::DeviceLost => log::Level::Error,
        }
    }
}

/// Application hook for reported problems.
pub type ReportCallback = Arc<dyn Fn(ReportSeverity, &str) + Send + Sync>;

/// Logs reports and forwards them to the application callback.
#[derive(Clone, Default)]
pub struct Reporter {
    callback: Option<ReportCallback>,
}

impl Reporter {
    pub fn new(callback: Option<ReportCallback>) -> Self {
        Self { callback }
    }

    pub fn report(&self, severity: ReportSeverity, message: impl AsRef<str>) {
        let message = message.as_ref();
        log::log!(severity.log_level(), "{}", message);
        if let Some(callback) = &self.callback {
            callback(severity, message);
        }
    }

    pub fn report_error(&self, error: &RenderError) {
        self.report(error.severity(), error.to_string());
    }

    /// Report `result` if it is an error, then hand it back unchanged.
    pub fn check<T>(&self, result: RenderResult<T>) -> RenderResult<T> {
        if let Err(error) = &result {
            self.report_error(error);
        }
        result
    }
}

impl fmt::Debug for Reporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reporter")
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

static_assertions::assert_impl_all!(Reporter: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_callback_receives_reports() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let reporter = Reporter::new(Some(Arc::new(move |severity, message: &str| {
            sink.lock().push((severity, message.to_string()));
        })));

        reporter.report(ReportSeverity::Info, "hello");
        let result: RenderResult<()> = Err(RenderError::protocol("twice"));
        assert!(reporter.check(result).is_err());

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], (ReportSeverity::Info, "hello".to_string()));
        assert_eq!(seen[1].0, ReportSeverity::NonCriticalError);
    }

    #[test]
    fn test_check_passes_ok_through_silently() {
        let reporter = Reporter::default();
        assert_eq!(reporter.check(Ok(5)), Ok(5));
    }

    #[test]
    fn test_severity_ordering() {
        assert!(ReportSeverity::Warning < ReportSeverity::CriticalError);
        assert_eq!(ReportSeverity::DeviceLost.log_level(), log::Level::Error);
    }
}

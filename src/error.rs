//! Renderer error type.

use std::time::Duration;

use thiserror::Error;

use crate::backend::BackendError;
use crate::render_target::RenderTargetId;
use crate::report::ReportSeverity;

/// Renderer error
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RenderError {
    #[error("Device error: {0}")]
    Device(#[from] BackendError),
    #[error("Presentation chain is stale")]
    Stale,
    #[error("Presentation chain is still stale after a rebuild")]
    StaleAfterRebuild,
    #[error("Frame did not finish within {0:?}")]
    FrameTimeout(Duration),
    #[error("Render target has been released")]
    Released,
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("Call out of order: {0}")]
    Protocol(String),
    #[error("Render target {0:?} depends on itself")]
    DependencyCycle(RenderTargetId),
    #[error("Render target dependency chain is deeper than {0}")]
    DependencyTooDeep(usize),
    #[error("Render target render was aborted this frame")]
    Aborted,
    #[error("Resource data is not ready")]
    NotReady,
}

/// How a caller is expected to react to a [`RenderError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// The frame or target is abandoned.
    Fatal,
    /// Handled internally by rebuilding the presentation chain once.
    RecoverableStale,
    /// The call was made in the wrong state; it had no effect.
    Protocol,
    /// A resource is still loading; a fallback is used instead.
    ResourceNotReady,
}

impl RenderError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RenderError::Device(_)
            | RenderError::StaleAfterRebuild
            | RenderError::FrameTimeout(_)
            | RenderError::Released
            | RenderError::InvalidParameter(_) => ErrorClass::Fatal,
            RenderError::Stale => ErrorClass::RecoverableStale,
            RenderError::Protocol(_)
            | RenderError::DependencyCycle(_)
            | RenderError::DependencyTooDeep(_)
            | RenderError::Aborted => ErrorClass::Protocol,
            RenderError::NotReady => ErrorClass::ResourceNotReady,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }

    /// Severity used when this error is reported to the user.
    pub fn severity(&self) -> ReportSeverity {
        match self {
            RenderError::Device(BackendError::DeviceLost) => ReportSeverity::DeviceLost,
            RenderError::Device(BackendError::OutOfMemory) => ReportSeverity::CriticalError,
            error => match error.class() {
                ErrorClass::Fatal => ReportSeverity::CriticalError,
                ErrorClass::RecoverableStale => ReportSeverity::Warning,
                ErrorClass::Protocol => ReportSeverity::NonCriticalError,
                ErrorClass::ResourceNotReady => ReportSeverity::Verbose,
            },
        }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        RenderError::Protocol(message.into())
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        RenderError::InvalidParameter(message.into())
    }
}

pub type RenderResult<T> = Result<T, RenderError>;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Return code for a successful operation.
pub const SUCCESS_CODE: &str = "0x00000000";
/// Return code when every node was already at the requested state.
pub const NO_ACTION_REQUIRED_CODE: &str = "0x0301003D";

/// Closed set of failure codes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    PatchOperationFailed,
    InternalException,
    InsufficientSpace,
    UnzipError,
    ToolMissingOnLaunchNode,
    SessionAlreadyActive,
    PayloadCopyError,
    ConsoleReadTimeout,
    ToolCommandFailed,
    InsufficientLaunchNodes,
    ConnectFailed,
    InactiveImageUnavailable,
    LaunchNodeIsTarget,
    ChecksumValidationFailed,
    InvalidTargetVersion,
    HeartbeatFailure,
    VersionMismatchDuringRollback,
    RetryExecutionFailed,
    PostchecksFailed,
    ParallelCheckTimedOut,
    CrsServicesDown,
    StaleMountDetected,
    PdbDegraded,
    VmLifecycleFailed,
}

impl ErrorCode {
    /// Hexadecimal code reported to the request tracker.
    pub fn hex(self) -> &'static str {
        match self {
            Self::PatchOperationFailed => "0x03010000",
            Self::InternalException => "0x0301000A",
            Self::InsufficientSpace => "0x03010035",
            Self::UnzipError => "0x03010036",
            Self::ToolMissingOnLaunchNode => "0x0301003A",
            Self::SessionAlreadyActive => "0x0301003B",
            Self::PayloadCopyError => "0x0301003C",
            Self::ConsoleReadTimeout => "0x03010044",
            Self::ToolCommandFailed => "0x03010045",
            Self::InsufficientLaunchNodes => "0x03010046",
            Self::ConnectFailed => "0x03010055",
            Self::InactiveImageUnavailable => "0x03010056",
            Self::LaunchNodeIsTarget => "0x0301005B",
            Self::ChecksumValidationFailed => "0x0301005D",
            Self::InvalidTargetVersion => "0x03010071",
            Self::HeartbeatFailure => "0x03020000",
            Self::VersionMismatchDuringRollback => "0x03030003",
            Self::RetryExecutionFailed => "0x0303000D",
            Self::PostchecksFailed => "0x03030011",
            Self::ParallelCheckTimedOut => "0x03030029",
            Self::CrsServicesDown => "0x0305000F",
            Self::StaleMountDetected => "0x03050011",
            Self::PdbDegraded => "0x0305001D",
            Self::VmLifecycleFailed => "0x0307000F",
        }
    }

    /// Catch-all codes that must not replace a more specific recorded error.
    pub fn is_generic(self) -> bool {
        matches!(self, Self::PatchOperationFailed | Self::InternalException)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hex())
    }
}

/// A domain failure with an operator-facing suggestion.
///
/// Travels inside `anyhow::Error`; recover it with
/// `err.downcast_ref::<PatchError>()` at the operation boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("[{code}] {message}")]
pub struct PatchError {
    pub code: ErrorCode,
    pub message: String,
    pub suggestion: String,
}

impl PatchError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            code,
            suggestion: message.clone(),
            message,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = suggestion.into();
        self
    }

    /// Extract the domain error from an `anyhow` chain, falling back to
    /// `InternalException` for anything unexpected.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        match err.chain().find_map(|e| e.downcast_ref::<PatchError>()) {
            Some(pe) => pe.clone(),
            None => PatchError::new(ErrorCode::InternalException, format!("{:#}", err))
                .with_suggestion("Unexpected failure; review the orchestrator log for details"),
        }
    }
}

/// Shorthand for building an `anyhow::Error` that carries a `PatchError`.
pub fn patch_error(code: ErrorCode, message: impl Into<String>) -> anyhow::Error {
    PatchError::new(code, message).into()
}

/// Holds the most specific error recorded during a run.
#[derive(Debug, Default, Clone)]
pub struct ErrorSlot {
    recorded: Option<PatchError>,
}

impl ErrorSlot {
    /// Record an error. The first specific code wins; generic codes only
    /// replace other generic codes.
    pub fn record(&mut self, err: PatchError) {
        if self.recorded.as_ref().is_some_and(|e| !e.code.is_generic()) {
            return;
        }
        self.recorded = Some(err);
    }

    pub fn get(&self) -> Option<&PatchError> {
        self.recorded.as_ref()
    }

    pub fn take(&mut self) -> Option<PatchError> {
        self.recorded.take()
    }
}

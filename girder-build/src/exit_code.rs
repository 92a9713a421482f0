//! Process exit codes
//!
//! The distinguished codes the front-end maps outcomes to.

/// Exit code vocabulary of the tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    /// The build succeeded, but some may-fail actions produced failed
    /// artifacts.
    FailedArtifacts = 1,
    AnalysisFailed = 2,
    ConfigurationError = 3,
    InfrastructureFailure = 4,
}

impl ExitCode {
    pub fn code(&self) -> i32 {
        *self as i32
    }
}

use thiserror::Error;

/// A stage definition that cannot be executed as configured.
///
/// These errors are raised by the coordinator before a stage is dispatched to any worker.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A required parameter is missing or empty.
    #[error("stage `{stage}`: missing required parameter `{parameter}`")]
    Missing {
        /// Name of the offending stage.
        stage: String,
        /// Name of the parameter.
        parameter: &'static str,
    },

    /// A parameter has a value outside of its valid range.
    #[error("stage `{stage}`: invalid value for `{parameter}`: {reason}")]
    Invalid {
        /// Name of the offending stage.
        stage: String,
        /// Name of the parameter.
        parameter: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

/// Result type for stage validation.
pub type ConfigResult<T> = Result<T, ConfigError>;

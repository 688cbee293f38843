/// Errors produced by the `hvagent-core` crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CoreError {
    /// A version string could not be parsed as `major.minor.micro`.
    #[error("invalid version '{raw}': {reason}")]
    InvalidVersion { raw: String, reason: String },

    /// An instance spec field failed validation.
    #[error("instance spec validation failed for field '{field}': {reason}")]
    InvalidInstance { field: String, reason: String },

    /// A string did not name a known enum variant.
    #[error("unknown {kind} '{value}'")]
    UnknownVariant { kind: &'static str, value: String },
}

//! Settings error types.

use thiserror::Error;

/// Errors that can occur when loading or validating settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Failed to read the settings file from disk.
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    /// The file is not valid JSON, or does not match the settings schema.
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// The merged settings failed validation. Every failed check is listed.
    #[error("invalid settings: {}", .0.join("; "))]
    Invalid(Vec<&'static str>),
}

impl SettingsError {
    /// Failed checks, empty unless this is [`SettingsError::Invalid`].
    pub fn problems(&self) -> &[&'static str] {
        match self {
            Self::Invalid(problems) => problems,
            _ => &[],
        }
    }
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;

use thiserror::Error;

/// Errors raised while splitting, parsing, extracting or writing records.
///
/// The record-level variants (`MalformedRecord`, `MissingIdentifier`,
/// `MissingRequiredField`, `UnknownKey`) cause a single record to be skipped.
/// The rest abort the run.
#[derive(Error, Debug)]
pub enum MeltError {
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    #[error("record has no <UID> identifier")]
    MissingIdentifier,

    #[error("{wos_id}: missing required field {field}")]
    MissingRequiredField { wos_id: String, field: String },

    #[error("{wos_id}: unrecognized {kind} key '{key}'")]
    UnknownKey {
        wos_id: String,
        kind: &'static str,
        key: String,
    },

    #[error("invalid table catalog: {0}")]
    Catalog(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MeltError {
    pub(crate) fn malformed(reason: impl std::fmt::Display) -> Self {
        MeltError::MalformedRecord(reason.to_string())
    }

    pub(crate) fn missing(wos_id: &str, field: impl Into<String>) -> Self {
        MeltError::MissingRequiredField {
            wos_id: wos_id.to_string(),
            field: field.into(),
        }
    }

    /// True when the error only invalidates the record being melted.
    pub fn is_record_error(&self) -> bool {
        matches!(
            self,
            MeltError::MalformedRecord(_)
                | MeltError::MissingIdentifier
                | MeltError::MissingRequiredField { .. }
                | MeltError::UnknownKey { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, MeltError>;

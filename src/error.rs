// Error taxonomy shared by every pipeline stage.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// A circuit or driver named by the caller is absent from its lookup table.
    #[error("{kind} not found: {key}")]
    ReferenceNotFound { kind: &'static str, key: String },

    /// A well-formed query matched zero rows.
    #[error("no data: {context}")]
    NoData { context: String },

    /// An input table or feature set lacks an expected column.
    #[error("schema mismatch in {table}: {message}")]
    SchemaMismatch { table: String, message: String },

    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("CSV error in {path}: {source}")]
    Csv { path: String, source: csv::Error },

    #[error("model artifact error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("zip archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("invalid parameter `{name}`: {message}")]
    InvalidParameter { name: &'static str, message: String },
}

impl PipelineError {
    pub fn not_found(kind: &'static str, key: impl Into<String>) -> Self {
        PipelineError::ReferenceNotFound {
            kind,
            key: key.into(),
        }
    }

    pub fn no_data(context: impl Into<String>) -> Self {
        PipelineError::NoData {
            context: context.into(),
        }
    }

    pub fn schema(table: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::SchemaMismatch {
            table: table.into(),
            message: message.into(),
        }
    }

    pub fn invalid(name: &'static str, message: impl Into<String>) -> Self {
        PipelineError::InvalidParameter {
            name,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_missing_reference() {
        let err = PipelineError::not_found("circuit", "Marina Bay");
        assert_eq!(err.to_string(), "circuit not found: Marina Bay");
    }

    #[test]
    fn io_failures_name_the_path() {
        let err = PipelineError::Io {
            path: PathBuf::from("weather.csv"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        };
        assert!(err.to_string().contains("weather.csv"));
    }
}

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// Why a class label could not be split into make and model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LabelError {
    #[error("cannot parse make/model")]
    TooFewTokens,

    #[error("cannot extract model name")]
    NoModelTokens,
}

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("failed to read dataset: {0}")]
    Csv(#[from] csv::Error),

    #[error("dataset is missing required column: {0}")]
    MissingColumn(String),

    #[error("conflicting eligibility for {make} {model} at row {row}")]
    ConflictingDuplicate {
        make: String,
        model: String,
        row: usize,
    },
}

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("Invalid image: {0}")]
    Decode(#[from] image::ImageError),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid image URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to fetch image from URL: {0}")]
    Request(#[from] reqwest::Error),

    #[error("URL does not point to an image (content-type: {0})")]
    NotAnImage(String),

    #[error("Image file too large (max {})", format_limit(*.limit))]
    TooLarge { limit: usize },
}

/// Human size for a byte cap: whole MB when at least 1 MiB, else KB, else bytes.
pub fn format_limit(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = 1024 * KB;
    if bytes >= MB {
        format!("{}MB", bytes / MB)
    } else if bytes >= KB {
        format!("{}KB", bytes / KB)
    } else {
        format!("{} bytes", bytes)
    }
}

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("input tensor has {got} values, expected {expected}")]
    InputShape { got: usize, expected: usize },

    #[error("unexpected model output shape: {0:?}")]
    OutputShape(Vec<i64>),

    #[error("model returned an empty probability vector")]
    EmptyOutput,

    #[error("model backend error: {0}")]
    Backend(String),
}

#[cfg(feature = "torch")]
impl From<tch::TchError> for OracleError {
    fn from(e: tch::TchError) -> Self {
        OracleError::Backend(e.to_string())
    }
}

/// Readiness failures surfaced by [`crate::state::AppContext`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("Model is still loading, try again shortly")]
    Loading,

    #[error("Model failed to load: {0}")]
    Failed(String),

    #[error("invalid readiness transition from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    NotReady(#[from] StateError),

    #[error("Prediction failed: {0}")]
    Inference(String),
}

impl From<PreprocessError> for ApiError {
    fn from(e: PreprocessError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl From<FetchError> for ApiError {
    fn from(e: FetchError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl From<OracleError> for ApiError {
    fn from(e: OracleError) -> Self {
        ApiError::Inference(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let detail = self.to_string();
        let (status, body) = match &self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, json!({ "detail": detail })),
            ApiError::NotReady(StateError::Failed(_)) => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "detail": detail, "status": "failed" }),
            ),
            ApiError::NotReady(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "detail": detail, "status": "loading" }),
            ),
            ApiError::Inference(_) => {
                tracing::error!("{}", detail);
                (StatusCode::INTERNAL_SERVER_ERROR, json!({ "detail": detail }))
            }
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_below_a_megabyte_are_not_rounded_to_zero() {
        assert_eq!(format_limit(10 * 1024 * 1024), "10MB");
        assert_eq!(format_limit(5 * 1024 * 1024 + 1), "5MB");
        assert_eq!(format_limit(1024), "1KB");
        assert_eq!(format_limit(512 * 1024), "512KB");
        assert_eq!(format_limit(16), "16 bytes");
        assert_eq!(
            FetchError::TooLarge { limit: 16 }.to_string(),
            "Image file too large (max 16 bytes)"
        );
    }
}

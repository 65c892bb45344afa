use axum::{
    extract::{
        multipart::MultipartRejection, rejection::JsonRejection, DefaultBodyLimit, Multipart,
        State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;

use crate::error::{format_limit, ApiError};
use crate::prediction::{self, PredictionResult};
use crate::state::{AppContext, Phase, Readiness, Resources};
use crate::types::{ClassEntry, EligibleCar, EligibleCars, ImageUrlRequest, ModelInfoOut, ServiceSummary};

pub const SERVICE_NAME: &str = "CleanCar Classifier API";

/// Room for multipart boundaries and part headers on top of the image itself.
const MULTIPART_SLACK: usize = 64 * 1024;

const UPLOAD_FIELDS: [&str; 2] = ["file", "image"];

pub fn router(ctx: AppContext) -> Router {
    let body_limit = ctx.config().max_upload_bytes + MULTIPART_SLACK;
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/predict", post(predict))
        .route("/predict-url", post(predict_url))
        .route("/model-info", get(model_info))
        .route("/classes", get(classes))
        .route("/eligible-cars", get(eligible_cars))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(ctx)
}

// ---------- Liveness / readiness ----------

async fn root(State(ctx): State<AppContext>) -> Json<ServiceSummary> {
    let readiness = ctx.readiness();
    let (status, counts) = match &readiness {
        Readiness::Ready(r) => (
            "running",
            Some((
                r.vocabulary.len(),
                r.service.table().stats().eligible,
                r.service.table().stats().rows,
            )),
        ),
        other => (other.phase().as_str(), None),
    };
    let (num_classes, eligible_count, csv_entries) = counts.unwrap_or_default();

    Json(ServiceSummary {
        service: SERVICE_NAME,
        status,
        model_loaded: counts.is_some(),
        num_classes,
        eligible_count,
        csv_entries,
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn health(State(ctx): State<AppContext>) -> impl IntoResponse {
    match ctx.readiness() {
        Readiness::Ready(r) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "model_loaded": true,
                "num_classes": r.vocabulary.len(),
                "eligibility_entries": r.service.table().len(),
            })),
        ),
        Readiness::Failed(reason) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": Phase::Failed.as_str(), "model_loaded": false, "error": reason })),
        ),
        other => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": other.phase().as_str(), "model_loaded": false })),
        ),
    }
}

// ---------- Prediction ----------

async fn predict(
    State(ctx): State<AppContext>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<PredictionResult>, ApiError> {
    let resources = ctx.resources()?;
    let mut multipart = multipart.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let limit = ctx.config().max_upload_bytes;

    let mut upload = None;
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?
    {
        if !field.name().is_some_and(|n| UPLOAD_FIELDS.contains(&n)) {
            continue;
        }

        let content_type = field.content_type().unwrap_or("");
        if !content_type.starts_with("image/") {
            return Err(ApiError::BadRequest(
                "File must be an image (JPG, PNG, etc.)".to_string(),
            ));
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?
        {
            if bytes.len() + chunk.len() > limit {
                return Err(ApiError::BadRequest(format!(
                    "Image file too large (max {})",
                    format_limit(limit)
                )));
            }
            bytes.extend_from_slice(&chunk);
        }
        upload = Some(bytes);
        break;
    }

    let bytes = upload.ok_or_else(|| ApiError::BadRequest("No image file provided".to_string()))?;
    tracing::info!("received upload of {} bytes", bytes.len());
    classify(&ctx, resources, bytes).await.map(Json)
}

async fn predict_url(
    State(ctx): State<AppContext>,
    body: Result<Json<ImageUrlRequest>, JsonRejection>,
) -> Result<Json<PredictionResult>, ApiError> {
    let resources = ctx.resources()?;
    let Json(req) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    tracing::info!("fetching image from URL: {}", req.url);
    let fetched = ctx.fetcher().fetch(&req.url).await.map_err(|e| {
        tracing::warn!("fetch failed for {}: {}", req.url, e);
        e
    })?;
    tracing::info!(
        "classifying {} bytes of {} from URL",
        fetched.bytes.len(),
        fetched.content_type
    );
    classify(&ctx, resources, fetched.bytes).await.map(Json)
}

async fn classify(
    ctx: &AppContext,
    resources: Arc<Resources>,
    bytes: Vec<u8>,
) -> Result<PredictionResult, ApiError> {
    let log_stats = ctx.config().log_tensor_stats;
    tokio::task::spawn_blocking(move || run_inference(&resources, &bytes, log_stats))
        .await
        .map_err(|e| ApiError::Inference(format!("inference task failed: {}", e)))?
}

fn run_inference(
    resources: &Resources,
    bytes: &[u8],
    log_stats: bool,
) -> Result<PredictionResult, ApiError> {
    let tensor = resources.preprocessor.process(bytes)?;

    // Debug signal so we can confirm the input is not degenerate
    if log_stats {
        let s = tensor.stats();
        tracing::info!(
            "tensor shape={:?} len={} mean={:.3} std={:.3} min={:.3} max={:.3}",
            tensor.shape,
            s.len,
            s.mean,
            s.std,
            s.min,
            s.max
        );
    }

    let probs = resources.oracle.predict(&tensor)?;
    let result = prediction::resolve(&probs, &resources.vocabulary, &resources.service)?;

    tracing::info!("Prediction: {} ({:.1}% confidence)", result.name, result.confidence);
    tracing::info!("Eligibility: {}", result.eligibility_reason);
    Ok(result)
}

// ---------- Metadata / listings ----------

async fn model_info(State(ctx): State<AppContext>) -> Result<Json<ModelInfoOut>, ApiError> {
    let r = ctx.resources()?;
    let stats = r.service.table().stats();
    Ok(Json(ModelInfoOut {
        num_classes: r.vocabulary.len(),
        eligible_count: stats.eligible,
        csv_entries: stats.rows,
        model_type: r.info.model_type.clone(),
        input_size: [r.info.input_size, r.info.input_size, 3],
        has_class_names: !r.vocabulary.is_empty(),
        has_eligibility_map: r.info.has_eligibility_map,
        has_csv_data: r.info.csv_path.exists(),
        duplicate_rows: stats.duplicate_rows,
        model_path: r.info.model_path.display().to_string(),
        csv_path: r.info.csv_path.display().to_string(),
    }))
}

async fn classes(State(ctx): State<AppContext>) -> Result<Json<Vec<ClassEntry>>, ApiError> {
    let r = ctx.resources()?;
    let out = r
        .vocabulary
        .names()
        .iter()
        .enumerate()
        .map(|(index, name)| ClassEntry {
            index,
            name: name.clone(),
            eligible: r.class_eligible(index),
        })
        .collect();
    Ok(Json(out))
}

async fn eligible_cars(State(ctx): State<AppContext>) -> Result<Json<EligibleCars>, ApiError> {
    let r = ctx.resources()?;
    let cars: Vec<EligibleCar> = r
        .vocabulary
        .names()
        .iter()
        .enumerate()
        .filter(|(index, _)| r.class_eligible(*index))
        .map(|(index, name)| EligibleCar {
            index,
            name: name.clone(),
        })
        .collect();
    Ok(Json(EligibleCars {
        count: cars.len(),
        cars,
    }))
}

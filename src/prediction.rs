use serde::Serialize;

use crate::eligibility::EligibilityService;
use crate::error::OracleError;
use crate::labels::LabelVocabulary;

/// Response body of `/predict` and `/predict-url`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionResult {
    pub name: String,
    pub qualified: bool,
    pub confidence: f64,
    pub class_index: usize,
    pub eligibility_reason: String,
}

/// Index and probability of the highest-scoring class. NaNs never win.
pub fn argmax(probs: &[f32]) -> Option<(usize, f32)> {
    probs
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, p)| !p.is_nan())
        .fold(None, |best, (i, p)| match best {
            Some((_, bp)) if bp >= p => best,
            _ => Some((i, p)),
        })
}

/// Probability → percent, rounded to one decimal.
pub fn confidence_percent(p: f32) -> f64 {
    (p as f64 * 100.0 * 10.0).round() / 10.0
}

/// Pick the top class, name it, and attach the eligibility verdict.
pub fn resolve(
    probs: &[f32],
    vocabulary: &LabelVocabulary,
    service: &EligibilityService,
) -> Result<PredictionResult, OracleError> {
    let (class_index, p) = argmax(probs).ok_or(OracleError::EmptyOutput)?;
    let name = vocabulary.name(class_index).ok_or_else(|| {
        OracleError::Backend(format!(
            "class index {} out of range for {} labels",
            class_index,
            vocabulary.len()
        ))
    })?;

    let verdict = service.check(name);
    Ok(PredictionResult {
        name: name.to_string(),
        qualified: verdict.qualified,
        confidence: confidence_percent(p),
        class_index,
        eligibility_reason: verdict.reason,
    })
}

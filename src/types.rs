use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct ImageUrlRequest {
    pub url: String,
}

/// `GET /` body. Counts are zero until the service is ready.
#[derive(Debug, Serialize)]
pub struct ServiceSummary {
    pub service: &'static str,
    pub status: &'static str,
    pub model_loaded: bool,
    pub num_classes: usize,
    pub eligible_count: usize,
    pub csv_entries: usize,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ModelInfoOut {
    pub num_classes: usize,
    pub eligible_count: usize,
    pub csv_entries: usize,
    pub model_type: String,
    pub input_size: [u32; 3],
    pub has_class_names: bool,
    pub has_eligibility_map: bool,
    pub has_csv_data: bool,
    pub duplicate_rows: usize,
    pub model_path: String,
    pub csv_path: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ClassEntry {
    pub index: usize,
    pub name: String,
    pub eligible: bool,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct EligibleCar {
    pub index: usize,
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EligibleCars {
    pub count: usize,
    pub cars: Vec<EligibleCar>,
}

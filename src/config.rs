use serde::Deserialize;
use std::{fs, path::PathBuf, time::Duration};

use crate::eligibility::DEFAULT_ELIGIBILITY_COLUMN;
use crate::error::ConfigError;

pub const MAX_UPLOAD_BYTES: usize = 5 * 1024 * 1024;
pub const MAX_URL_BYTES: usize = 10 * 1024 * 1024;

const MODEL_DIR_CANDIDATES: [&str; 2] = ["clean_car_tax_break_final_model", "model"];

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServiceConfig {
    pub port: u16,
    pub model_dir: Option<PathBuf>,
    pub model_file: String,
    pub dataset_path: PathBuf,
    pub eligibility_column: String,
    pub max_upload_bytes: usize,
    pub max_url_bytes: usize,
    pub fetch_timeout_secs: u64,
    /// Takes precedence over `fetch_timeout_secs` when set.
    pub fetch_timeout_ms: Option<u64>,
    /// Route `/predict-url` downloads through `HTTP(S)_PROXY` when set.
    pub fetch_use_system_proxy: bool,
    pub reject_conflicting_duplicates: bool,
    pub log_tensor_stats: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            model_dir: None,
            model_file: "clean_car_eligibility_model.pt".to_string(),
            dataset_path: PathBuf::from("clean_vehicle_dataset_2015_2025.csv"),
            eligibility_column: DEFAULT_ELIGIBILITY_COLUMN.to_string(),
            max_upload_bytes: MAX_UPLOAD_BYTES,
            max_url_bytes: MAX_URL_BYTES,
            fetch_timeout_secs: 10,
            fetch_timeout_ms: None,
            fetch_use_system_proxy: true,
            reject_conflicting_duplicates: false,
            log_tensor_stats: false,
        }
    }
}

impl ServiceConfig {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&data)?)
    }

    /// `CONFIG_PATH` JSON (if set) with environment overrides on top.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let base = match std::env::var("CONFIG_PATH") {
            Ok(p) => Self::load(&p)?,
            Err(_) => Self::default(),
        };
        base.with_overrides(|k| std::env::var(k).ok())
    }

    pub fn with_overrides<F>(mut self, get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = get("PORT") {
            self.port = parse_value("PORT", &v)?;
        }
        if let Some(v) = get("MODEL_DIR") {
            self.model_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = get("MODEL_FILE") {
            self.model_file = v;
        }
        if let Some(v) = get("DATASET_PATH") {
            self.dataset_path = PathBuf::from(v);
        }
        if let Some(v) = get("ELIGIBILITY_COLUMN") {
            self.eligibility_column = v;
        }
        if let Some(v) = get("MAX_UPLOAD_BYTES") {
            self.max_upload_bytes = parse_value("MAX_UPLOAD_BYTES", &v)?;
        }
        if let Some(v) = get("MAX_URL_BYTES") {
            self.max_url_bytes = parse_value("MAX_URL_BYTES", &v)?;
        }
        if let Some(v) = get("FETCH_TIMEOUT_SECS") {
            self.fetch_timeout_secs = parse_value("FETCH_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("FETCH_TIMEOUT_MS") {
            self.fetch_timeout_ms = Some(parse_value("FETCH_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = get("FETCH_USE_SYSTEM_PROXY") {
            self.fetch_use_system_proxy = parse_flag("FETCH_USE_SYSTEM_PROXY", &v)?;
        }
        if let Some(v) = get("REJECT_CONFLICTING_DUPLICATES") {
            self.reject_conflicting_duplicates = parse_flag("REJECT_CONFLICTING_DUPLICATES", &v)?;
        }
        if let Some(v) = get("LOG_PRED") {
            self.log_tensor_stats = v == "1";
        }

        // a zero timeout makes reqwest fail every fetch immediately
        if self.fetch_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "FETCH_TIMEOUT_SECS",
                value: "0".to_string(),
            });
        }
        if self.fetch_timeout_ms == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "FETCH_TIMEOUT_MS",
                value: "0".to_string(),
            });
        }
        Ok(self)
    }

    pub fn fetch_timeout(&self) -> Duration {
        match self.fetch_timeout_ms {
            Some(ms) => Duration::from_millis(ms),
            None => Duration::from_secs(self.fetch_timeout_secs),
        }
    }

    /// Explicit `model_dir`, else the first candidate directory that exists.
    pub fn resolve_model_dir(&self) -> PathBuf {
        if let Some(dir) = &self.model_dir {
            return dir.clone();
        }

        let mut candidates: Vec<PathBuf> = MODEL_DIR_CANDIDATES.iter().map(PathBuf::from).collect();
        if let Ok(mut p) = std::env::current_exe() {
            p.pop(); // exe dir
            p.push("model");
            candidates.push(p);
        }

        for c in &candidates {
            if c.is_dir() {
                return c.clone();
            }
        }

        // Fallback to the first candidate; loading will report what is missing
        PathBuf::from(MODEL_DIR_CANDIDATES[0])
    }
}

fn parse_value<T: std::str::FromStr>(key: &'static str, v: &str) -> Result<T, ConfigError> {
    v.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: v.to_string(),
    })
}

fn parse_flag(key: &'static str, v: &str) -> Result<bool, ConfigError> {
    match v.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: v.to_string(),
        }),
    }
}

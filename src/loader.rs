use anyhow::{bail, Context, Result};
use std::{path::Path, sync::Arc};

use crate::config::ServiceConfig;
use crate::eligibility::{EligibilityService, EligibilityTable, TableOptions};
use crate::labels::LabelVocabulary;
use crate::oracle::{ModelMeta, Oracle};
use crate::preprocess::{ImageTensor, Preprocessor};
use crate::state::{AppContext, ModelInfo, Resources};

pub const CLASS_NAMES_FILE: &str = "class_names.json";
pub const ELIGIBILITY_MAP_FILE: &str = "eligibility_map.json";
pub const MODEL_CONFIG_FILE: &str = "model_config.json";

pub fn load_table(cfg: &ServiceConfig) -> Result<EligibilityTable> {
    let table = EligibilityTable::from_path(
        &cfg.dataset_path,
        TableOptions {
            eligibility_column: Some(cfg.eligibility_column.as_str()),
            reject_conflicting_duplicates: cfg.reject_conflicting_duplicates,
        },
    )
    .with_context(|| format!("failed to load dataset {}", cfg.dataset_path.display()))?;

    let stats = table.stats();
    tracing::info!(
        "built eligibility lookup: rows={} entries={} eligible={} duplicates={}",
        stats.rows,
        stats.entries,
        stats.eligible,
        stats.duplicate_rows
    );
    Ok(table)
}

/// Build [`Resources`] around an already constructed oracle.
pub fn assemble(
    cfg: &ServiceConfig,
    model_dir: &Path,
    oracle: Arc<dyn Oracle>,
    meta: &ModelMeta,
) -> Result<Resources> {
    let map_path = model_dir.join(ELIGIBILITY_MAP_FILE);
    let vocabulary = LabelVocabulary::load(&model_dir.join(CLASS_NAMES_FILE), &map_path)?;
    tracing::info!("loaded {} class names", vocabulary.len());

    if oracle.num_classes() != vocabulary.len() {
        bail!(
            "model outputs {} classes but class_names.json lists {}",
            oracle.num_classes(),
            vocabulary.len()
        );
    }

    let preprocessor = Preprocessor::new(meta.input_size, meta.layout());

    // Warmup to make sure the first request does not pay for lazy init
    oracle
        .predict(&ImageTensor::zeros(meta.input_size, meta.layout()))
        .context("warmup forward failed")?;
    tracing::info!("warmup forward ok");

    let table = load_table(cfg)?;
    let info = ModelInfo {
        model_type: meta.model_type.clone(),
        input_size: meta.input_size,
        model_path: model_dir.join(&cfg.model_file),
        csv_path: cfg.dataset_path.clone(),
        has_eligibility_map: vocabulary.flags().is_some(),
    };

    let resources = Resources::new(
        oracle,
        vocabulary,
        EligibilityService::new(table),
        preprocessor,
        info,
    );
    tracing::info!(
        "model ready: {} classes, {} eligible",
        resources.vocabulary.len(),
        resources.eligible_class_count()
    );
    Ok(resources)
}

#[cfg(feature = "torch")]
fn load_oracle(model_path: &Path, meta: &ModelMeta) -> Result<Arc<dyn Oracle>> {
    let path = model_path
        .to_str()
        .with_context(|| format!("model path is not valid UTF-8: {}", model_path.display()))?;
    let oracle = crate::oracle::TorchOracle::load(path, meta)?;
    Ok(Arc::new(oracle))
}

#[cfg(not(feature = "torch"))]
fn load_oracle(model_path: &Path, _meta: &ModelMeta) -> Result<Arc<dyn Oracle>> {
    bail!(
        "cannot load {}: built without the `torch` feature",
        model_path.display()
    )
}

/// Load every artifact named by `cfg`.
pub fn load_resources(cfg: &ServiceConfig) -> Result<Resources> {
    let model_dir = cfg.resolve_model_dir();
    let model_path = model_dir.join(&cfg.model_file);
    tracing::info!("loading model from {}", model_path.display());
    if !model_path.exists() {
        bail!("model file not found: {}", model_path.display());
    }

    let meta = ModelMeta::load_or_default(&model_dir.join(MODEL_CONFIG_FILE))?;
    let oracle = load_oracle(&model_path, &meta)?;
    assemble(cfg, &model_dir, oracle, &meta)
}

/// Drive `ctx` through `Loading` to `Ready` or `Failed` using `load`.
///
/// The load runs on the blocking pool so the server answers liveness probes
/// while it is in progress.
pub async fn run_startup<F>(ctx: AppContext, load: F) -> Result<()>
where
    F: FnOnce(&ServiceConfig) -> Result<Resources> + Send + 'static,
{
    ctx.begin_loading()?;

    let cfg = ctx.config().clone();
    let outcome = match tokio::task::spawn_blocking(move || load(&cfg)).await {
        Ok(res) => res,
        Err(join_err) => Err(anyhow::anyhow!("loader task panicked: {}", join_err)),
    };

    match outcome {
        Ok(resources) => {
            ctx.mark_ready(resources)?;
            tracing::info!("service ready");
        }
        Err(e) => {
            tracing::error!("startup load failed: {:#}", e);
            ctx.mark_failed(format!("{:#}", e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OracleError;
    use crate::state::Phase;
    use std::fs;

    struct Flat(usize);

    impl Oracle for Flat {
        fn predict(&self, _input: &ImageTensor) -> Result<Vec<f32>, OracleError> {
            Ok(vec![0.5; self.0])
        }

        fn num_classes(&self) -> usize {
            self.0
        }
    }

    fn fixture_dir() -> (tempfile::TempDir, ServiceConfig) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CLASS_NAMES_FILE),
            r#"["Tesla Model S Sedan 2012", "BMW M3 Coupe 2012"]"#,
        )
        .unwrap();
        let csv = dir.path().join("vehicles.csv");
        fs::write(&csv, "Make,Model,Eligible_CC4A_DCAP\nTesla,Model S,Yes\nBMW,M3,No\n").unwrap();
        let cfg = ServiceConfig {
            model_dir: Some(dir.path().to_path_buf()),
            dataset_path: csv,
            ..Default::default()
        };
        (dir, cfg)
    }

    #[test]
    fn assemble_derives_class_flags() {
        let (dir, cfg) = fixture_dir();
        let r = assemble(&cfg, dir.path(), Arc::new(Flat(2)), &ModelMeta::default()).unwrap();
        assert!(r.class_eligible(0));
        assert!(!r.class_eligible(1));
        assert!(!r.info.has_eligibility_map);
        assert_eq!(r.service.table().stats().entries, 2);
    }

    #[test]
    fn assemble_prefers_bit_vector() {
        let (dir, cfg) = fixture_dir();
        fs::write(dir.path().join(ELIGIBILITY_MAP_FILE), "[0, 1]").unwrap();
        let r = assemble(&cfg, dir.path(), Arc::new(Flat(2)), &ModelMeta::default()).unwrap();
        assert!(!r.class_eligible(0));
        assert!(r.class_eligible(1));
        assert!(r.info.has_eligibility_map);
    }

    #[test]
    fn class_count_mismatch_fails() {
        let (dir, cfg) = fixture_dir();
        let err = assemble(&cfg, dir.path(), Arc::new(Flat(3)), &ModelMeta::default()).unwrap_err();
        assert!(err.to_string().contains("3 classes"));
    }

    #[test]
    fn missing_dataset_fails() {
        let (dir, mut cfg) = fixture_dir();
        cfg.dataset_path = dir.path().join("missing.csv");
        assert!(assemble(&cfg, dir.path(), Arc::new(Flat(2)), &ModelMeta::default()).is_err());
    }

    #[test]
    fn missing_model_file_fails() {
        let (_dir, cfg) = fixture_dir();
        let err = load_resources(&cfg).unwrap_err();
        assert!(err.to_string().contains("model file not found"));
    }

    #[tokio::test]
    async fn startup_failure_marks_failed() {
        let ctx = AppContext::new(ServiceConfig::default()).unwrap();
        run_startup(ctx.clone(), |_| Err(anyhow::anyhow!("no dataset"))).await.unwrap();
        assert_eq!(ctx.phase(), Phase::Failed);
        assert!(run_startup(ctx.clone(), |_| Err(anyhow::anyhow!("again"))).await.is_err());
    }

    #[tokio::test]
    async fn startup_success_marks_ready() {
        let (dir, cfg) = fixture_dir();
        let ctx = AppContext::new(cfg).unwrap();
        let model_dir = dir.path().to_path_buf();
        run_startup(ctx.clone(), move |cfg| {
            assemble(cfg, &model_dir, Arc::new(Flat(2)), &ModelMeta::default())
        })
        .await
        .unwrap();
        assert_eq!(ctx.phase(), Phase::Ready);
    }
}

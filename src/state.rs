//! Application context and the load-once readiness state machine.
//!
//! `NotLoaded -> Loading -> Ready | Failed`. No transition leaves `Ready` or
//! `Failed`; a failed process is recovered by restarting it.

use parking_lot::RwLock;
use std::{fmt, path::PathBuf, sync::Arc};

use crate::config::ServiceConfig;
use crate::eligibility::EligibilityService;
use crate::error::{FetchError, StateError};
use crate::fetch::ImageFetcher;
use crate::labels::LabelVocabulary;
use crate::oracle::Oracle;
use crate::preprocess::Preprocessor;

/// Static facts about the loaded artifacts, reported by `/model-info`.
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub model_type: String,
    pub input_size: u32,
    pub model_path: PathBuf,
    pub csv_path: PathBuf,
    pub has_eligibility_map: bool,
}

/// Everything a prediction needs. Read-only once built.
pub struct Resources {
    pub oracle: Arc<dyn Oracle>,
    pub vocabulary: LabelVocabulary,
    pub service: EligibilityService,
    pub preprocessor: Preprocessor,
    pub info: ModelInfo,
    class_eligibility: Vec<bool>,
}

impl Resources {
    pub fn new(
        oracle: Arc<dyn Oracle>,
        vocabulary: LabelVocabulary,
        service: EligibilityService,
        preprocessor: Preprocessor,
        info: ModelInfo,
    ) -> Self {
        // without a bit vector, derive each class flag from the dataset
        let class_eligibility = match vocabulary.flags() {
            Some(flags) => flags.to_vec(),
            None => vocabulary
                .names()
                .iter()
                .map(|n| service.check(n).qualified)
                .collect(),
        };
        Self {
            oracle,
            vocabulary,
            service,
            preprocessor,
            info,
            class_eligibility,
        }
    }

    pub fn class_eligible(&self, index: usize) -> bool {
        self.class_eligibility.get(index).copied().unwrap_or(false)
    }

    pub fn eligible_class_count(&self) -> usize {
        self.class_eligibility.iter().filter(|e| **e).count()
    }
}

impl fmt::Debug for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resources")
            .field("num_classes", &self.vocabulary.len())
            .field("table_entries", &self.service.table().len())
            .field("info", &self.info)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    NotLoaded,
    Loading,
    Ready,
    Failed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::NotLoaded => "not_loaded",
            Phase::Loading => "loading",
            Phase::Ready => "ready",
            Phase::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Readiness {
    NotLoaded,
    Loading,
    Ready(Arc<Resources>),
    Failed(String),
}

impl Readiness {
    pub fn phase(&self) -> Phase {
        match self {
            Readiness::NotLoaded => Phase::NotLoaded,
            Readiness::Loading => Phase::Loading,
            Readiness::Ready(_) => Phase::Ready,
            Readiness::Failed(_) => Phase::Failed,
        }
    }
}

/// Shared, cheaply clonable handle injected into every handler.
#[derive(Clone)]
pub struct AppContext {
    readiness: Arc<RwLock<Readiness>>,
    config: Arc<ServiceConfig>,
    fetcher: ImageFetcher,
}

impl AppContext {
    pub fn new(config: ServiceConfig) -> Result<Self, FetchError> {
        let fetcher = ImageFetcher::from_config(&config)?;
        Ok(Self {
            readiness: Arc::new(RwLock::new(Readiness::NotLoaded)),
            config: Arc::new(config),
            fetcher,
        })
    }

    /// Context that is already `Ready` with the given resources.
    pub fn with_resources(config: ServiceConfig, resources: Resources) -> Result<Self, FetchError> {
        let ctx = Self::new(config)?;
        *ctx.readiness.write() = Readiness::Ready(Arc::new(resources));
        Ok(ctx)
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn fetcher(&self) -> &ImageFetcher {
        &self.fetcher
    }

    pub fn readiness(&self) -> Readiness {
        self.readiness.read().clone()
    }

    pub fn phase(&self) -> Phase {
        self.readiness.read().phase()
    }

    /// Loaded resources, or the reason they are unavailable.
    pub fn resources(&self) -> Result<Arc<Resources>, StateError> {
        match &*self.readiness.read() {
            Readiness::Ready(r) => Ok(Arc::clone(r)),
            Readiness::Failed(reason) => Err(StateError::Failed(reason.clone())),
            Readiness::NotLoaded | Readiness::Loading => Err(StateError::Loading),
        }
    }

    pub fn begin_loading(&self) -> Result<(), StateError> {
        let mut guard = self.readiness.write();
        match &*guard {
            Readiness::NotLoaded => {
                *guard = Readiness::Loading;
                Ok(())
            }
            other => Err(StateError::InvalidTransition {
                from: other.phase().as_str(),
                to: Phase::Loading.as_str(),
            }),
        }
    }

    pub fn mark_ready(&self, resources: Resources) -> Result<(), StateError> {
        self.complete(Readiness::Ready(Arc::new(resources)))
    }

    pub fn mark_failed(&self, reason: impl Into<String>) -> Result<(), StateError> {
        self.complete(Readiness::Failed(reason.into()))
    }

    fn complete(&self, next: Readiness) -> Result<(), StateError> {
        let mut guard = self.readiness.write();
        if guard.phase() != Phase::Loading {
            return Err(StateError::InvalidTransition {
                from: guard.phase().as_str(),
                to: next.phase().as_str(),
            });
        }
        *guard = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eligibility::EligibilityTable;
    use crate::error::OracleError;
    use crate::preprocess::ImageTensor;

    struct Uniform(usize);

    impl Oracle for Uniform {
        fn predict(&self, _input: &ImageTensor) -> Result<Vec<f32>, OracleError> {
            Ok(vec![1.0 / self.0 as f32; self.0])
        }

        fn num_classes(&self) -> usize {
            self.0
        }
    }

    fn resources() -> Resources {
        let vocab = LabelVocabulary::new(vec!["Tesla Model S Sedan 2012".into()], None).unwrap();
        Resources::new(
            Arc::new(Uniform(1)),
            vocab,
            EligibilityService::new(EligibilityTable::default()),
            Preprocessor::default(),
            ModelInfo {
                model_type: "test".into(),
                input_size: 224,
                model_path: PathBuf::from("model.pt"),
                csv_path: PathBuf::from("data.csv"),
                has_eligibility_map: false,
            },
        )
    }

    fn ctx() -> AppContext {
        AppContext::new(ServiceConfig::default()).unwrap()
    }

    #[test]
    fn starts_not_loaded_and_reports_loading() {
        let ctx = ctx();
        assert_eq!(ctx.phase(), Phase::NotLoaded);
        assert_eq!(ctx.resources().unwrap_err(), StateError::Loading);
        ctx.begin_loading().unwrap();
        assert_eq!(ctx.phase(), Phase::Loading);
        assert_eq!(ctx.resources().unwrap_err(), StateError::Loading);
    }

    #[test]
    fn loading_to_ready() {
        let ctx = ctx();
        ctx.begin_loading().unwrap();
        ctx.mark_ready(resources()).unwrap();
        assert_eq!(ctx.phase(), Phase::Ready);
        assert_eq!(ctx.resources().unwrap().vocabulary.len(), 1);
    }

    #[test]
    fn loading_to_failed_is_permanent() {
        let ctx = ctx();
        ctx.begin_loading().unwrap();
        ctx.mark_failed("missing model").unwrap();
        assert_eq!(
            ctx.resources().unwrap_err(),
            StateError::Failed("missing model".into())
        );
        assert!(ctx.begin_loading().is_err());
        assert!(ctx.mark_ready(resources()).is_err());
        assert_eq!(ctx.phase(), Phase::Failed);
    }

    #[test]
    fn ready_cannot_reload_or_fail() {
        let ctx = ctx();
        ctx.begin_loading().unwrap();
        ctx.mark_ready(resources()).unwrap();
        assert!(matches!(
            ctx.begin_loading(),
            Err(StateError::InvalidTransition { from: "ready", to: "loading" })
        ));
        assert!(ctx.mark_failed("late").is_err());
        assert_eq!(ctx.phase(), Phase::Ready);
    }

    #[test]
    fn completion_requires_loading() {
        let ctx = ctx();
        assert!(ctx.mark_ready(resources()).is_err());
        assert_eq!(ctx.phase(), Phase::NotLoaded);
    }

    #[test]
    fn clones_share_state() {
        let ctx = ctx();
        let other = ctx.clone();
        ctx.begin_loading().unwrap();
        assert_eq!(other.phase(), Phase::Loading);
    }

    #[test]
    fn class_flags_derive_from_table_without_bit_vector() {
        let r = resources();
        // empty table: nothing is eligible
        assert!(!r.class_eligible(0));
        assert_eq!(r.eligible_class_count(), 0);
        assert!(!r.class_eligible(99));
    }
}

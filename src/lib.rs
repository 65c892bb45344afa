//! Car photo classifier with clean-vehicle incentive eligibility lookup.

pub mod api;
pub mod config;
pub mod eligibility;
pub mod error;
pub mod fetch;
pub mod labels;
pub mod loader;
pub mod oracle;
pub mod prediction;
pub mod preprocess;
pub mod state;
pub mod types;

pub use config::ServiceConfig;
pub use state::AppContext;

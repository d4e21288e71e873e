pub mod settings;

pub use settings::{Config, NetworkEndpoint, PriceDenomination, TrackedProgram};

use crate::error::PriceFeedError;
use std::sync::Arc;

/// Loads `.env` (if present), reads the environment and validates the result.
pub fn load_config() -> Result<Arc<Config>, PriceFeedError> {
    dotenv::dotenv().ok();

    let config = Config::from_env();
    config.validate()?;
    config.log_settings();

    Ok(Arc::new(config))
}

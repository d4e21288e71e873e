pub mod aggregation;
pub mod config;
pub mod decoder;
pub mod error;
pub mod oracle;
pub mod pipeline; // composition of the long-lived services
pub mod pricing;
pub mod publisher;
pub mod store;
pub mod stream;
pub mod types;
pub mod utils;

pub use error::{PriceFeedError, Result};
pub use pipeline::Pipeline;
pub use types::{LatestPrice, OhlcvPoint, PriceSource, PriceUpdate, Resolution};

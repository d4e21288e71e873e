//! Periodic USD pricing of traded tokens through an HTTP price API.

pub mod client;
pub mod fetcher;

pub use client::{JupiterPriceClient, OracleClient};
pub use fetcher::{BatchPriceFetcher, CycleReport, FetcherSettings};

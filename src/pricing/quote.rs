use log::warn;
use std::sync::atomic::{AtomicU64, Ordering};

pub const MIN_QUOTE_USD: f64 = 0.01;
pub const MAX_QUOTE_USD: f64 = 1_000.0;
/// Largest accepted relative move between two consecutive quote prices.
pub const MAX_QUOTE_JUMP: f64 = 0.25;

/// Last accepted USD price of the quote asset. Stored as f64 bits, zero means
/// unknown.
#[derive(Debug, Default)]
pub struct QuoteUsdPrice {
    bits: AtomicU64,
}

impl QuoteUsdPrice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<f64> {
        let value = f64::from_bits(self.bits.load(Ordering::Acquire));
        (value > 0.0).then_some(value)
    }

    /// Stores `price` if it is in bounds and not a suspicious jump from the
    /// previous value. Returns whether it was accepted.
    pub fn update(&self, price: f64) -> bool {
        if !price.is_finite() || !(MIN_QUOTE_USD..=MAX_QUOTE_USD).contains(&price) {
            warn!("Rejecting quote USD price {} outside [{}, {}]", price, MIN_QUOTE_USD, MAX_QUOTE_USD);
            return false;
        }
        if let Some(previous) = self.get() {
            let change = (price - previous).abs() / previous;
            if change > MAX_QUOTE_JUMP {
                warn!(
                    "Rejecting quote USD price {} ({:.1}% move from {})",
                    price,
                    change * 100.0,
                    previous
                );
                return false;
            }
        }
        self.bits.store(price.to_bits(), Ordering::Release);
        true
    }
}

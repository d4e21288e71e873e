//! Venue pricing formulas and the stream-side calculator.

pub mod coverage;
pub mod quote;
pub mod registry;

pub use coverage::StreamCoverage;
pub use quote::QuoteUsdPrice;
pub use registry::{TokenMeta, TokenRegistry};

use crate::config::PriceDenomination;
use crate::decoder::{AmmPoolState, BondingCurveState, DecodedEvent};
use crate::error::CalcError;
use crate::types::{PriceSource, PriceUpdate, TradeSide};
use dashmap::DashMap;
use solana_sdk::pubkey::Pubkey;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// How long per-account reserves and stream coverage outlive their last
/// notification.
pub const DEFAULT_STREAM_STATE_TTL: Duration = Duration::from_secs(15 * 60);

fn pow10(decimals: u8) -> Result<u64, CalcError> {
    10u64.checked_pow(decimals as u32).ok_or(CalcError::Overflow("decimal unit"))
}

fn ensure_price(price: f64) -> Result<f64, CalcError> {
    if price.is_finite() && price > 0.0 {
        Ok(price)
    } else {
        Err(CalcError::InvalidPrice(price))
    }
}

/// Marginal price of one whole token on the curve, in whole quote units.
///
/// `effective = real + virtual`, `k = effective * supply`,
/// `price = k / (supply - unit) - effective`, all in u128 before the final
/// division by the quote unit.
pub fn bonding_curve_price(
    real_reserve: u64,
    virtual_reserve: u64,
    supply: u64,
    token_decimals: u8,
    quote_decimals: u8,
) -> Result<f64, CalcError> {
    let effective = real_reserve
        .checked_add(virtual_reserve)
        .ok_or(CalcError::Overflow("effective reserve"))?;
    if effective == 0 {
        return Err(CalcError::ZeroReserve { side: "quote" });
    }
    if supply == 0 {
        return Err(CalcError::ZeroReserve { side: "token" });
    }
    let unit = pow10(token_decimals)?;
    if supply <= unit {
        return Err(CalcError::SupplyBelowUnit { supply, unit });
    }

    let effective = effective as u128;
    let k = effective * supply as u128;
    let after = k / (supply - unit) as u128;
    let delta = after
        .checked_sub(effective)
        .ok_or(CalcError::Overflow("price delta"))?;

    ensure_price(delta as f64 / pow10(quote_decimals)? as f64)
}

/// Price of `pricing_mint` in units of the other side of the pool.
pub fn amm_pool_price(state: &AmmPoolState, quote_mint: &Pubkey) -> Result<(Pubkey, f64), CalcError> {
    if state.base_reserve == 0 {
        return Err(CalcError::ZeroReserve { side: "base" });
    }
    if state.quote_reserve == 0 {
        return Err(CalcError::ZeroReserve { side: "quote" });
    }
    let base = state.base_reserve as f64 / pow10(state.base_decimals)? as f64;
    let quote = state.quote_reserve as f64 / pow10(state.quote_decimals)? as f64;

    if state.base_mint == *quote_mint && state.quote_mint != *quote_mint {
        Ok((state.quote_mint, ensure_price(base / quote)?))
    } else {
        Ok((state.base_mint, ensure_price(quote / base)?))
    }
}

/// `price * supply / 10^decimals`, or `None` when the supply is unknown.
pub fn market_cap(price: f64, total_supply: Option<u64>, decimals: u8) -> Option<f64> {
    let supply = total_supply?;
    let unit = pow10(decimals).ok()? as f64;
    let cap = price * (supply as f64 / unit);
    cap.is_finite().then_some(cap)
}

/// Turns decoded stream events into [`PriceUpdate`]s.
///
/// Remembers the last quote-side reserve per account so that consecutive
/// notifications yield a traded volume and side. Entries idle for longer than
/// the state TTL are dropped by [`PriceCalculator::prune_stale`].
pub struct PriceCalculator {
    tokens: Arc<TokenRegistry>,
    quote_mint: Pubkey,
    quote_decimals: u8,
    denomination: PriceDenomination,
    quote_usd: Arc<QuoteUsdPrice>,
    last_reserves: DashMap<String, (u64, Instant)>,
    coverage: Arc<StreamCoverage>,
}

impl PriceCalculator {
    pub fn new(
        tokens: Arc<TokenRegistry>,
        quote_mint: Pubkey,
        quote_decimals: u8,
        denomination: PriceDenomination,
        quote_usd: Arc<QuoteUsdPrice>,
    ) -> Self {
        Self {
            tokens,
            quote_mint,
            quote_decimals,
            denomination,
            quote_usd,
            last_reserves: DashMap::new(),
            coverage: Arc::new(StreamCoverage::new(DEFAULT_STREAM_STATE_TTL)),
        }
    }

    pub fn with_state_ttl(mut self, ttl: Duration) -> Self {
        self.coverage = Arc::new(StreamCoverage::new(ttl));
        self
    }

    /// Mints this calculator has priced, shared with the oracle fetcher.
    pub fn coverage(&self) -> Arc<StreamCoverage> {
        self.coverage.clone()
    }

    /// Drops reserve history and coverage for accounts and mints idle past
    /// the TTL. Returns `(accounts, mints)` removed.
    pub fn prune_stale(&self) -> (usize, usize) {
        let ttl = self.coverage.ttl();
        let before = self.last_reserves.len();
        self.last_reserves.retain(|_, (_, seen)| seen.elapsed() <= ttl);
        (before - self.last_reserves.len(), self.coverage.prune())
    }

    pub fn tracked_accounts(&self) -> usize {
        self.last_reserves.len()
    }

    pub fn calculate(
        &self,
        account: &str,
        event: &DecodedEvent,
        lamports: Option<u64>,
        timestamp_ms: i64,
    ) -> Result<PriceUpdate, CalcError> {
        let (mint, price, cap, quote_reserve) = match event {
            DecodedEvent::BondingCurve(state) => self.price_curve(state, lamports.unwrap_or(0))?,
            DecodedEvent::AmmPool(state) => self.price_pool(state)?,
            DecodedEvent::Unknown { .. } => return Err(CalcError::NotPriced),
        };

        let (volume, side) = match quote_reserve {
            Some(reserve) => self.trade_from_reserve(account, reserve),
            None => (0.0, None),
        };

        let multiplier = match self.denomination {
            PriceDenomination::Quote => 1.0,
            PriceDenomination::Usd => self.quote_usd.get().ok_or(CalcError::NotPriced)?,
        };

        let price = ensure_price(price * multiplier)?;
        self.coverage.record(&mint.to_string());
        Ok(PriceUpdate::new(mint.to_string(), price, timestamp_ms, PriceSource::Stream)
            .with_volume(volume * multiplier, side)
            .with_market_cap(cap.map(|c| c * multiplier)))
    }

    fn price_curve(
        &self,
        state: &BondingCurveState,
        real_reserve: u64,
    ) -> Result<(Pubkey, f64, Option<f64>, Option<u64>), CalcError> {
        let meta = self.tokens.get(&state.mint.to_string());
        let price = bonding_curve_price(
            real_reserve,
            state.virtual_reserve,
            state.token_reserve,
            meta.decimals,
            self.quote_decimals,
        )?;
        let cap = market_cap(price, meta.total_supply, meta.decimals);
        Ok((state.mint, price, cap, Some(real_reserve)))
    }

    fn price_pool(&self, state: &AmmPoolState) -> Result<(Pubkey, f64, Option<f64>, Option<u64>), CalcError> {
        let (mint, price) = amm_pool_price(state, &self.quote_mint)?;
        let (decimals, quote_reserve) = if mint == state.base_mint {
            (state.base_decimals, (state.quote_mint == self.quote_mint).then_some(state.quote_reserve))
        } else {
            (state.quote_decimals, Some(state.base_reserve))
        };
        let meta = self.tokens.get(&mint.to_string());
        let cap = market_cap(price, meta.total_supply, decimals);
        Ok((mint, price, cap, quote_reserve))
    }

    /// Quote-side reserve delta since the previous notification for `account`.
    fn trade_from_reserve(&self, account: &str, reserve: u64) -> (f64, Option<TradeSide>) {
        let previous = self
            .last_reserves
            .insert(account.to_string(), (reserve, Instant::now()))
            .map(|(previous, _)| previous);
        let Some(previous) = previous else {
            return (0.0, None);
        };
        let unit = pow10(self.quote_decimals).unwrap_or(1) as f64;
        match reserve.cmp(&previous) {
            std::cmp::Ordering::Greater => ((reserve - previous) as f64 / unit, Some(TradeSide::Buy)),
            std::cmp::Ordering::Less => ((previous - reserve) as f64 / unit, Some(TradeSide::Sell)),
            std::cmp::Ordering::Equal => (0.0, None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::str::FromStr;

    const LAMPORTS: u64 = 1_000_000_000;

    fn wsol() -> Pubkey {
        Pubkey::from_str(crate::config::settings::WRAPPED_SOL_MINT).unwrap()
    }

    fn calculator(denomination: PriceDenomination) -> (PriceCalculator, Arc<TokenRegistry>, Arc<QuoteUsdPrice>) {
        let tokens = Arc::new(TokenRegistry::new(6));
        let quote_usd = Arc::new(QuoteUsdPrice::new());
        let calc = PriceCalculator::new(tokens.clone(), wsol(), 9, denomination, quote_usd.clone());
        (calc, tokens, quote_usd)
    }

    #[test]
    fn test_curve_price_thirty_sol_virtual() {
        // 30 SOL virtual, nothing real, 1000 tokens at 9 decimals
        let price = bonding_curve_price(0, 30 * LAMPORTS, 1_000 * LAMPORTS, 9, 9).unwrap();
        assert_eq!(format!("{:.6}", price), "0.030030");
        assert_approx_eq!(price, 30.0 / 999.0, 1e-9);
    }

    #[test]
    fn test_curve_edge_cases_rejected() {
        assert!(matches!(bonding_curve_price(0, 0, 1_000, 0, 9), Err(CalcError::ZeroReserve { .. })));
        assert!(matches!(bonding_curve_price(0, LAMPORTS, 0, 6, 9), Err(CalcError::ZeroReserve { .. })));
        assert!(matches!(
            bonding_curve_price(0, LAMPORTS, 1_000_000, 6, 9),
            Err(CalcError::SupplyBelowUnit { .. })
        ));
        // tiny reserves truncate to zero in integer math
        assert!(matches!(bonding_curve_price(1, 0, u64::MAX, 0, 9), Err(CalcError::InvalidPrice(_))));
    }

    #[test]
    fn test_pool_price_and_reciprocal() {
        let token = Pubkey::new_from_array([7; 32]);
        let mut state = AmmPoolState {
            discriminator: [0; 8],
            base_vault: Pubkey::new_from_array([1; 32]),
            quote_vault: Pubkey::new_from_array([2; 32]),
            base_mint: token,
            quote_mint: wsol(),
            base_decimals: 6,
            quote_decimals: 9,
            base_reserve: 2_000_000 * 1_000_000,
            quote_reserve: 50 * LAMPORTS,
        };
        let (mint, price) = amm_pool_price(&state, &wsol()).unwrap();
        assert_eq!(mint, token);
        assert_approx_eq!(price, 50.0 / 2_000_000.0, 1e-15);

        // same pool with sides swapped prices the same token
        std::mem::swap(&mut state.base_mint, &mut state.quote_mint);
        std::mem::swap(&mut state.base_decimals, &mut state.quote_decimals);
        std::mem::swap(&mut state.base_reserve, &mut state.quote_reserve);
        let (mint, swapped) = amm_pool_price(&state, &wsol()).unwrap();
        assert_eq!(mint, token);
        assert_approx_eq!(swapped, price, 1e-15);

        state.base_reserve = 0;
        assert!(matches!(amm_pool_price(&state, &wsol()), Err(CalcError::ZeroReserve { .. })));
    }

    #[test]
    fn test_market_cap_absent_without_supply() {
        assert_eq!(market_cap(0.5, None, 6), None);
        assert_approx_eq!(market_cap(0.5, Some(1_000_000_000_000_000), 6).unwrap(), 500_000_000.0, 1e-6);
    }

    #[test]
    fn test_calculator_tracks_volume_and_side() {
        let (calc, tokens, _) = calculator(PriceDenomination::Quote);
        let mint = Pubkey::new_from_array([3; 32]);
        tokens.insert(mint.to_string(), TokenMeta { decimals: 6, total_supply: Some(1_000_000_000_000_000) });
        let event = DecodedEvent::BondingCurve(BondingCurveState {
            discriminator: [0; 8],
            mint,
            virtual_reserve: 30 * LAMPORTS,
            token_reserve: 800_000_000_000_000,
        });

        let first = calc.calculate("curve", &event, Some(LAMPORTS), 1_000).unwrap();
        assert_eq!(first.token_key, mint.to_string());
        assert_eq!(first.side, None);
        assert_eq!(first.volume, 0.0);
        assert!(first.market_cap.is_some());
        assert!(first.is_valid());

        let second = calc.calculate("curve", &event, Some(3 * LAMPORTS), 2_000).unwrap();
        assert_eq!(second.side, Some(TradeSide::Buy));
        assert_approx_eq!(second.volume, 2.0, 1e-12);
        assert!(second.price > first.price);

        let third = calc.calculate("curve", &event, Some(LAMPORTS / 2), 3_000).unwrap();
        assert_eq!(third.side, Some(TradeSide::Sell));
        assert_approx_eq!(third.volume, 2.5, 1e-12);
    }

    #[test]
    fn test_usd_denomination_waits_for_quote_price() {
        let (calc, _, quote_usd) = calculator(PriceDenomination::Usd);
        let event = DecodedEvent::BondingCurve(BondingCurveState {
            discriminator: [0; 8],
            mint: Pubkey::new_from_array([4; 32]),
            virtual_reserve: 30 * LAMPORTS,
            token_reserve: 1_000_000_000_000,
        });
        assert_eq!(calc.calculate("a", &event, Some(0), 0), Err(CalcError::NotPriced));
        assert!(quote_usd.update(100.0));
        let quote_only = bonding_curve_price(0, 30 * LAMPORTS, 1_000_000_000_000, 6, 9).unwrap();
        let update = calc.calculate("a", &event, Some(0), 0).unwrap();
        assert_approx_eq!(update.price, quote_only * 100.0, 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_accounts_are_pruned() {
        let (calc, _, _) = calculator(PriceDenomination::Quote);
        let calc = calc.with_state_ttl(Duration::from_secs(60));
        let curve = |byte: u8| {
            DecodedEvent::BondingCurve(BondingCurveState {
                discriminator: [0; 8],
                mint: Pubkey::new_from_array([byte; 32]),
                virtual_reserve: 30 * LAMPORTS,
                token_reserve: 1_000_000_000_000,
            })
        };
        calc.calculate("old", &curve(5), Some(LAMPORTS), 0).unwrap();
        tokio::time::advance(Duration::from_secs(45)).await;
        calc.calculate("fresh", &curve(6), Some(LAMPORTS), 0).unwrap();
        assert_eq!(calc.tracked_accounts(), 2);
        assert!(calc.coverage().is_covered(&Pubkey::new_from_array([5; 32]).to_string()));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(calc.prune_stale(), (1, 1));
        assert_eq!(calc.tracked_accounts(), 1);
        assert!(!calc.coverage().is_covered(&Pubkey::new_from_array([5; 32]).to_string()));
        assert!(calc.coverage().is_covered(&Pubkey::new_from_array([6; 32]).to_string()));

        // a pruned account starts over without a trade
        let again = calc.calculate("old", &curve(5), Some(3 * LAMPORTS), 0).unwrap();
        assert_eq!(again.side, None);
    }

    #[test]
    fn test_unknown_event_not_priced() {
        let (calc, _, _) = calculator(PriceDenomination::Quote);
        let event = DecodedEvent::Unknown { discriminator: None };
        assert_eq!(calc.calculate("x", &event, None, 0), Err(CalcError::NotPriced));
    }
}

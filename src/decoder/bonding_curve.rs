// Bonding-curve account layout:
//   [0..8)   discriminator
//   [8..40)  token mint
//   [40..48) virtual quote reserve (u64 LE, lamports)
//   [48..56) token reserve held by the curve (u64 LE, base units)
// The real quote reserve is the account's own lamport balance.

use super::layout::{self, DISCRIMINATOR_LEN, PUBKEY_LEN};
use crate::error::DecodeError;
use solana_sdk::pubkey::Pubkey;

pub const LAYOUT: &str = "bonding-curve";
pub const MINT_OFFSET: usize = DISCRIMINATOR_LEN;
pub const VIRTUAL_RESERVE_OFFSET: usize = MINT_OFFSET + PUBKEY_LEN;
pub const TOKEN_RESERVE_OFFSET: usize = VIRTUAL_RESERVE_OFFSET + 8;
pub const MIN_LEN: usize = TOKEN_RESERVE_OFFSET + 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BondingCurveState {
    pub discriminator: [u8; 8],
    pub mint: Pubkey,
    pub virtual_reserve: u64,
    pub token_reserve: u64,
}

pub fn decode(data: &[u8]) -> Result<BondingCurveState, DecodeError> {
    layout::ensure_len(LAYOUT, data, MIN_LEN)?;
    let discriminator = layout::discriminator(data).ok_or(DecodeError::TooShort {
        layout: LAYOUT,
        expected: MIN_LEN,
        actual: data.len(),
    })?;

    Ok(BondingCurveState {
        discriminator,
        mint: layout::read_pubkey(data, MINT_OFFSET, "mint")?,
        virtual_reserve: layout::read_u64_le(data, VIRTUAL_RESERVE_OFFSET, LAYOUT)?,
        token_reserve: layout::read_u64_le(data, TOKEN_RESERVE_OFFSET, LAYOUT)?,
    })
}

/// Serializes a state back into the account layout. Used by fixtures.
pub fn encode(state: &BondingCurveState) -> Vec<u8> {
    let mut data = Vec::with_capacity(MIN_LEN);
    data.extend_from_slice(&state.discriminator);
    data.extend_from_slice(state.mint.as_ref());
    data.extend_from_slice(&state.virtual_reserve.to_le_bytes());
    data.extend_from_slice(&state.token_reserve.to_le_bytes());
    data
}

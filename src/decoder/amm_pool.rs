use super::layout::{self, DISCRIMINATOR_LEN, PUBKEY_LEN};
use crate::error::DecodeError;
use solana_sdk::pubkey::Pubkey;

pub const LAYOUT: &str = "amm-pool";

pub const BASE_VAULT_OFFSET: usize = DISCRIMINATOR_LEN;
pub const QUOTE_VAULT_OFFSET: usize = BASE_VAULT_OFFSET + PUBKEY_LEN;
pub const BASE_MINT_OFFSET: usize = QUOTE_VAULT_OFFSET + PUBKEY_LEN;
pub const QUOTE_MINT_OFFSET: usize = BASE_MINT_OFFSET + PUBKEY_LEN;
pub const BASE_DECIMALS_OFFSET: usize = QUOTE_MINT_OFFSET + PUBKEY_LEN;
pub const QUOTE_DECIMALS_OFFSET: usize = BASE_DECIMALS_OFFSET + 1;
pub const BASE_RESERVE_OFFSET: usize = QUOTE_DECIMALS_OFFSET + 1;
pub const QUOTE_RESERVE_OFFSET: usize = BASE_RESERVE_OFFSET + 8;
pub const MIN_LEN: usize = QUOTE_RESERVE_OFFSET + 8;

/// Constant-product pool state with both vault balances inline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmmPoolState {
    pub discriminator: [u8; 8],
    pub base_vault: Pubkey,
    pub quote_vault: Pubkey,
    pub base_mint: Pubkey,
    pub quote_mint: Pubkey,
    pub base_decimals: u8,
    pub quote_decimals: u8,
    pub base_reserve: u64,
    pub quote_reserve: u64,
}

pub fn decode(data: &[u8]) -> Result<AmmPoolState, DecodeError> {
    layout::ensure_len(LAYOUT, data, MIN_LEN)?;
    let discriminator = layout::discriminator(data).ok_or(DecodeError::TooShort {
        layout: LAYOUT,
        expected: MIN_LEN,
        actual: data.len(),
    })?;

    Ok(AmmPoolState {
        discriminator,
        base_vault: layout::read_pubkey(data, BASE_VAULT_OFFSET, "base_vault")?,
        quote_vault: layout::read_pubkey(data, QUOTE_VAULT_OFFSET, "quote_vault")?,
        base_mint: layout::read_pubkey(data, BASE_MINT_OFFSET, "base_mint")?,
        quote_mint: layout::read_pubkey(data, QUOTE_MINT_OFFSET, "quote_mint")?,
        base_decimals: layout::read_u8(data, BASE_DECIMALS_OFFSET, LAYOUT)?,
        quote_decimals: layout::read_u8(data, QUOTE_DECIMALS_OFFSET, LAYOUT)?,
        base_reserve: layout::read_u64_le(data, BASE_RESERVE_OFFSET, LAYOUT)?,
        quote_reserve: layout::read_u64_le(data, QUOTE_RESERVE_OFFSET, LAYOUT)?,
    })
}

pub fn encode(state: &AmmPoolState) -> Vec<u8> {
    let mut data = Vec::with_capacity(MIN_LEN);
    data.extend_from_slice(&state.discriminator);
    data.extend_from_slice(state.base_vault.as_ref());
    data.extend_from_slice(state.quote_vault.as_ref());
    data.extend_from_slice(state.base_mint.as_ref());
    data.extend_from_slice(state.quote_mint.as_ref());
    data.push(state.base_decimals);
    data.push(state.quote_decimals);
    data.extend_from_slice(&state.base_reserve.to_le_bytes());
    data.extend_from_slice(&state.quote_reserve.to_le_bytes());
    data
}

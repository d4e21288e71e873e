//! Pure decoding of raw account buffers into typed venue events.
//!
//! Dispatch is a single exhaustive match over [`ProgramKind`]; the same bytes
//! and kind always yield the same [`DecodedEvent`] or the same [`DecodeError`].

pub mod amm_pool;
pub mod bonding_curve;
pub mod layout;

pub use amm_pool::AmmPoolState;
pub use bonding_curve::BondingCurveState;

use crate::error::DecodeError;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramKind {
    BondingCurve,
    AmmPool,
    Unknown,
}

impl fmt::Display for ProgramKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgramKind::BondingCurve => write!(f, "bonding-curve"),
            ProgramKind::AmmPool => write!(f, "amm-pool"),
            ProgramKind::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedEvent {
    BondingCurve(BondingCurveState),
    AmmPool(AmmPoolState),
    Unknown { discriminator: Option<[u8; 8]> },
}

impl DecodedEvent {
    pub fn kind(&self) -> ProgramKind {
        match self {
            DecodedEvent::BondingCurve(_) => ProgramKind::BondingCurve,
            DecodedEvent::AmmPool(_) => ProgramKind::AmmPool,
            DecodedEvent::Unknown { .. } => ProgramKind::Unknown,
        }
    }
}

pub fn decode(kind: ProgramKind, data: &[u8]) -> Result<DecodedEvent, DecodeError> {
    match kind {
        ProgramKind::BondingCurve => bonding_curve::decode(data).map(DecodedEvent::BondingCurve),
        ProgramKind::AmmPool => amm_pool::decode(data).map(DecodedEvent::AmmPool),
        ProgramKind::Unknown => Ok(DecodedEvent::Unknown {
            discriminator: layout::discriminator(data),
        }),
    }
}

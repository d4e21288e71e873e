use crate::error::DecodeError;
use solana_sdk::pubkey::Pubkey;

pub const DISCRIMINATOR_LEN: usize = 8;
pub const PUBKEY_LEN: usize = 32;

pub fn ensure_len(layout: &'static str, data: &[u8], expected: usize) -> Result<(), DecodeError> {
    if data.len() < expected {
        return Err(DecodeError::TooShort {
            layout,
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

pub fn discriminator(data: &[u8]) -> Option<[u8; DISCRIMINATOR_LEN]> {
    data.get(..DISCRIMINATOR_LEN).and_then(|bytes| bytes.try_into().ok())
}

pub fn read_pubkey(data: &[u8], offset: usize, field: &'static str) -> Result<Pubkey, DecodeError> {
    let slice = data.get(offset..offset + PUBKEY_LEN).unwrap_or(&data[data.len().min(offset)..]);
    let bytes: [u8; PUBKEY_LEN] = slice
        .try_into()
        .map_err(|_| DecodeError::MalformedPubkey { field, actual: slice.len() })?;
    Ok(Pubkey::new_from_array(bytes))
}

pub fn read_u64_le(data: &[u8], offset: usize, layout: &'static str) -> Result<u64, DecodeError> {
    data.get(offset..offset + 8)
        .and_then(|bytes| bytes.try_into().ok())
        .map(u64::from_le_bytes)
        .ok_or(DecodeError::TooShort {
            layout,
            expected: offset + 8,
            actual: data.len(),
        })
}

pub fn read_u8(data: &[u8], offset: usize, layout: &'static str) -> Result<u8, DecodeError> {
    data.get(offset).copied().ok_or(DecodeError::TooShort {
        layout,
        expected: offset + 1,
        actual: data.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_pubkey_slice_is_malformed() {
        let data = [7u8; 40];
        assert!(read_pubkey(&data, 8, "mint").is_ok());
        assert_eq!(
            read_pubkey(&data, 20, "mint"),
            Err(DecodeError::MalformedPubkey { field: "mint", actual: 20 })
        );
        assert_eq!(
            read_pubkey(&data, 64, "mint"),
            Err(DecodeError::MalformedPubkey { field: "mint", actual: 0 })
        );
    }

    #[test]
    fn test_read_u64_little_endian() {
        let mut data = vec![0u8; 16];
        data[8..16].copy_from_slice(&30_000_000_000u64.to_le_bytes());
        assert_eq!(read_u64_le(&data, 8, "test").unwrap(), 30_000_000_000);
        assert!(read_u64_le(&data, 9, "test").is_err());
    }
}

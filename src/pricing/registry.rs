use dashmap::DashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenMeta {
    pub decimals: u8,
    /// Raw supply in base units, when known.
    pub total_supply: Option<u64>,
}

/// Per-mint metadata shared by the calculator and the oracle fetcher.
#[derive(Debug)]
pub struct TokenRegistry {
    tokens: DashMap<String, TokenMeta>,
    default_decimals: u8,
}

impl TokenRegistry {
    pub fn new(default_decimals: u8) -> Self {
        Self {
            tokens: DashMap::new(),
            default_decimals,
        }
    }

    /// Metadata for `mint`, falling back to the default decimals and an
    /// unknown supply.
    pub fn get(&self, mint: &str) -> TokenMeta {
        self.tokens.get(mint).map(|entry| *entry.value()).unwrap_or(TokenMeta {
            decimals: self.default_decimals,
            total_supply: None,
        })
    }

    pub fn insert(&self, mint: impl Into<String>, meta: TokenMeta) {
        self.tokens.insert(mint.into(), meta);
    }

    pub fn extend(&self, entries: impl IntoIterator<Item = (String, TokenMeta)>) {
        for (mint, meta) in entries {
            self.tokens.insert(mint, meta);
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

use thiserror::Error;

/// Failure to turn a raw account buffer into a typed event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("buffer too short for {layout} layout: expected at least {expected} bytes, got {actual}")]
    TooShort {
        layout: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("malformed pubkey field `{field}`: expected 32 bytes, got {actual}")]
    MalformedPubkey { field: &'static str, actual: usize },
}

/// Reasons a decoded event produced no price signal.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CalcError {
    #[error("zero reserve on {side} side")]
    ZeroReserve { side: &'static str },

    #[error("token reserve {supply} does not exceed one unit ({unit})")]
    SupplyBelowUnit { supply: u64, unit: u64 },

    #[error("arithmetic overflow in {0}")]
    Overflow(&'static str),

    #[error("non-positive or non-finite price: {0}")]
    InvalidPrice(f64),

    #[error("event carries no price information")]
    NotPriced,
}

#[derive(Debug, Clone, Error)]
pub enum PriceFeedError {
    /// HTTP / socket level connectivity problems
    #[error("Network Error: {0}")]
    NetworkError(String),

    /// Upstream provider websocket problems
    #[error("WebSocket Error: {0}")]
    WebSocketError(String),

    /// Operation exceeded its deadline
    #[error("Timeout Error: {0}")]
    TimeoutError(String),

    #[error("Decode Error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Calculation Error: {0}")]
    Calculation(#[from] CalcError),

    /// JSON / envelope parsing errors
    #[error("Parse Error: {0}")]
    ParseError(String),

    /// Store unreachable, pool exhausted, connection dropped
    #[error("Store Unavailable: {0}")]
    StoreUnavailable(String),

    /// Store refused the data (constraint / data exception)
    #[error("Store Rejected: {0}")]
    StoreRejected(String),

    /// Redis latest-price cache errors
    #[error("Cache Error: {0}")]
    CacheError(String),

    /// Subscriber connection could not accept a frame
    #[error("Publish Error: {0}")]
    PublishError(String),

    #[error("Config Error: {0}")]
    ConfigError(String),
}

impl From<serde_json::Error> for PriceFeedError {
    fn from(err: serde_json::Error) -> Self {
        PriceFeedError::ParseError(format!("JSON serialization/deserialization error: {}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for PriceFeedError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        PriceFeedError::WebSocketError(err.to_string())
    }
}

impl From<reqwest::Error> for PriceFeedError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PriceFeedError::TimeoutError(err.to_string())
        } else if err.is_decode() {
            PriceFeedError::ParseError(err.to_string())
        } else {
            PriceFeedError::NetworkError(err.to_string())
        }
    }
}

impl From<redis::RedisError> for PriceFeedError {
    fn from(err: redis::RedisError) -> Self {
        PriceFeedError::CacheError(err.to_string())
    }
}

impl From<sqlx::Error> for PriceFeedError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => {
                // SQLSTATE class 22 (data exception) and 23 (integrity violation)
                // will fail again on retry.
                let permanent = db_err
                    .code()
                    .map(|code| code.starts_with("22") || code.starts_with("23"))
                    .unwrap_or(false);
                if permanent {
                    PriceFeedError::StoreRejected(err.to_string())
                } else {
                    PriceFeedError::StoreUnavailable(err.to_string())
                }
            }
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::TypeNotFound { .. }
            | sqlx::Error::Decode(_) => PriceFeedError::StoreRejected(err.to_string()),
            _ => PriceFeedError::StoreUnavailable(err.to_string()),
        }
    }
}

impl PriceFeedError {
    /// Whether the failed operation can succeed if attempted again later.
    pub fn is_recoverable(&self) -> bool {
        match self {
            PriceFeedError::NetworkError(_) => true,
            PriceFeedError::WebSocketError(_) => true,
            PriceFeedError::TimeoutError(_) => true,
            PriceFeedError::Decode(_) => false, // same bytes, same result
            PriceFeedError::Calculation(_) => false,
            PriceFeedError::ParseError(_) => false,
            PriceFeedError::StoreUnavailable(_) => true,
            PriceFeedError::StoreRejected(_) => false, // malformed data, never retry
            PriceFeedError::CacheError(_) => true,
            PriceFeedError::PublishError(_) => false, // connection is torn down instead
            PriceFeedError::ConfigError(_) => false,
        }
    }

    pub fn categorize(&self) -> ErrorCategory {
        match self {
            PriceFeedError::NetworkError(_) | PriceFeedError::TimeoutError(_) => ErrorCategory::Network,
            PriceFeedError::WebSocketError(_) => ErrorCategory::DataFeed,
            PriceFeedError::Decode(_) | PriceFeedError::ParseError(_) => ErrorCategory::Data,
            PriceFeedError::Calculation(_) => ErrorCategory::Calculation,
            PriceFeedError::StoreUnavailable(_)
            | PriceFeedError::StoreRejected(_)
            | PriceFeedError::CacheError(_) => ErrorCategory::Persistence,
            PriceFeedError::PublishError(_) => ErrorCategory::Delivery,
            PriceFeedError::ConfigError(_) => ErrorCategory::Configuration,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Network,
    DataFeed,
    Data,
    Calculation,
    Persistence,
    Delivery,
    Configuration,
}

pub type Result<T> = std::result::Result<T, PriceFeedError>;

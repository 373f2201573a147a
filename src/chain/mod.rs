//! Reading the write history of shared tables out of the data chains.
//!
//! Each adapter that implements reading from a specific blockchain implements
//! the [ChainSource] trait. New chains are supported by providing a new
//! implementation, the monitor itself only ever sees [RawEvent]s.

pub mod ethereum;

use std::fmt;

use jsonrpc::simple_http;

/// Method signature hash of the `put` function of the TrustDBle contract
pub const PUT_SELECTOR: &str = "db82ecc3";

/// Method signature hash of the `remove` function of the TrustDBle contract
pub const REMOVE_SELECTOR: &str = "95bc2673";

/// A selector is the leading 4 bytes of the transaction payload
pub const SELECTOR_HEX_LEN: usize = 8;

/// What a relevant on-chain transaction did to its table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Put,
    Remove,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Put => "PUT",
            OperationKind::Remove => "REMOVE",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One relevant transaction as pulled off a chain, payload still encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    /// The contract the transaction was sent to, identifying the shared table
    pub contract_address: String,
    /// Timestamp of the containing block, unix seconds
    pub timestamp: u64,
    /// Who sent the transaction
    pub editor: String,
    pub tx_id: String,
    pub kind: OperationKind,
    pub block_number: u64,
    /// Hex payload with the selector stripped
    pub payload: String,
}

/// An error happened talking to a chain node. Never fatal: the monitor skips
/// the chain for the current cycle and retries on the next one.
#[derive(Debug)]
pub enum ChainError {
    /// The node cannot be queried (network, latency, protocol, ..)
    Unavailable(jsonrpc::Error),
    /// The node answered something we can't make sense of
    InvalidResponse(String),
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ChainError::Unavailable(e) => write!(f, "Chain node unavailable: {}", e),
            ChainError::InvalidResponse(e) => write!(f, "Invalid chain node response: {}", e),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<simple_http::Error> for ChainError {
    fn from(e: simple_http::Error) -> Self {
        Self::Unavailable(jsonrpc::Error::Transport(Box::new(e)))
    }
}

/// Interface of a general blockchain adapter.
pub trait ChainSource {
    /// Current height of the chain
    fn latest_block_number(&self) -> Result<u64, ChainError>;

    /// Scan blocks `from_block..=to_block` for transactions calling the
    /// TrustDBle contract functions, in ascending block order and in
    /// transaction order within a block.
    fn read_history(&self, from_block: u64, to_block: u64) -> Result<Vec<RawEvent>, ChainError>;
}

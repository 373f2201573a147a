//! Read history of blocks and transactions from an Ethereum data chain.
//!
//! The TrustDBle contract follows a key-value-store semantic with a `put` and
//! a `remove` function. We recognize the calls by the method signature hash
//! leading the transaction input and never need contract ABI decoding beyond
//! that.

use crate::chain::{
    ChainError, ChainSource, OperationKind, RawEvent, PUT_SELECTOR, REMOVE_SELECTOR,
    SELECTOR_HEX_LEN,
};

use std::time::Duration;

use jsonrpc::{
    arg,
    client::Client,
    simple_http::SimpleHttpTransport,
};
use serde_json::Value as Json;

// If the node takes more than 3 minutes to answer one of our queries, fail.
const RPC_SOCKET_TIMEOUT: u64 = 180;

macro_rules! params {
    ($($param:expr),* $(,)?) => {
        [
            $(
                arg($param),
            )*
        ]
    };
}

pub struct EthereumAdapter {
    client: Client,
}

impl EthereumAdapter {
    pub fn new(network_url: &str) -> Result<EthereumAdapter, ChainError> {
        let client = Client::with_transport(
            SimpleHttpTransport::builder()
                .url(network_url)
                .map_err(ChainError::from)?
                .timeout(Duration::from_secs(RPC_SOCKET_TIMEOUT))
                .build(),
        );

        Ok(EthereumAdapter { client })
    }

    fn make_request(
        &self,
        method: &str,
        params: &[Box<serde_json::value::RawValue>],
    ) -> Result<Json, ChainError> {
        let req = self.client.build_request(method, params);
        log::trace!("Sending to chain node: {:#?}", req);
        match self.client.send_request(req) {
            Ok(resp) => {
                let res: Json = resp.result().map_err(ChainError::Unavailable)?;
                log::trace!("Got from chain node: {:#?}", res);

                Ok(res)
            }
            Err(e) => Err(ChainError::Unavailable(e)),
        }
    }

    /// Fetch one block with its full transaction objects. None if the node
    /// doesn't know a block at this height.
    fn block_with_transactions(&self, height: u64) -> Result<Option<Json>, ChainError> {
        let res = self.make_request(
            "eth_getBlockByNumber",
            &params!(format!("{:#x}", height), true),
        )?;

        if res.is_null() {
            return Ok(None);
        }
        Ok(Some(res))
    }

    /// Scan one block for transactions calling the contract functions we
    /// care about.
    fn extract_events_from_block(&self, block: &Json) -> Result<Vec<RawEvent>, ChainError> {
        let block_number = json_quantity(block, "number")?;
        let timestamp = json_quantity(block, "timestamp")?;
        let transactions = block
            .get("transactions")
            .and_then(|txs| txs.as_array())
            .ok_or_else(|| {
                ChainError::InvalidResponse(format!(
                    "No transaction list in block {}",
                    block_number
                ))
            })?;

        let mut events = Vec::new();
        for tx in transactions {
            // Contract creations have no 'to' address and can't be ours
            let to = match tx.get("to").and_then(|to| to.as_str()) {
                Some(to) => to,
                None => {
                    log::info!(
                        "Skipping transaction from block {}. No relevant contract address",
                        block_number
                    );
                    continue;
                }
            };
            let input = json_str(tx, "input")?;
            let input = input.strip_prefix("0x").unwrap_or(input);

            let kind = match input.get(..SELECTOR_HEX_LEN) {
                Some(PUT_SELECTOR) => OperationKind::Put,
                Some(REMOVE_SELECTOR) => OperationKind::Remove,
                _ => {
                    log::info!(
                        "Skipping transaction of block {}. No relevant contract function signature",
                        block_number
                    );
                    continue;
                }
            };

            events.push(RawEvent {
                contract_address: to.to_string(),
                timestamp,
                editor: json_str(tx, "from")?.to_string(),
                tx_id: json_str(tx, "hash")?.to_string(),
                kind,
                block_number,
                payload: input[SELECTOR_HEX_LEN..].to_string(),
            });
        }

        Ok(events)
    }
}

impl ChainSource for EthereumAdapter {
    fn latest_block_number(&self) -> Result<u64, ChainError> {
        let res = self.make_request("eth_blockNumber", &[])?;
        parse_quantity(&res)
            .ok_or_else(|| ChainError::InvalidResponse(format!("Bad eth_blockNumber: {}", res)))
    }

    fn read_history(&self, from_block: u64, to_block: u64) -> Result<Vec<RawEvent>, ChainError> {
        let mut history = Vec::new();

        for height in from_block..=to_block {
            let block = match self.block_with_transactions(height)? {
                Some(block) => block,
                None => continue,
            };
            history.extend(self.extract_events_from_block(&block)?);
        }

        Ok(history)
    }
}

// Ethereum JSON-RPC encodes all quantities as "0x"-prefixed hex strings
fn parse_quantity(value: &Json) -> Option<u64> {
    let s = value.as_str()?;
    u64::from_str_radix(s.strip_prefix("0x").unwrap_or(s), 16).ok()
}

fn json_quantity(object: &Json, field: &str) -> Result<u64, ChainError> {
    object
        .get(field)
        .and_then(parse_quantity)
        .ok_or_else(|| ChainError::InvalidResponse(format!("Bad or missing '{}' field", field)))
}

fn json_str<'a>(object: &'a Json, field: &str) -> Result<&'a str, ChainError> {
    object
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ChainError::InvalidResponse(format!("Bad or missing '{}' field", field)))
}

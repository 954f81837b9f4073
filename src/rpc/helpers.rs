//! Conversions between EVM JSON-RPC hex quantities and heights, plus block
//! extraction from `eth_getBlockByNumber` responses.

use super::chain::BlockWrapper;
use super::client::RpcError;
use anyhow::Result;
use serde_json::Value;

/// Parses a `0x`-prefixed hex quantity such as `"0x1b4"`.
pub fn parse_hex_quantity(value: &str) -> Result<u64> {
    let trimmed = value.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .filter(|digits| !digits.is_empty())
        .ok_or_else(|| RpcError::InvalidQuantity {
            value: value.to_owned(),
        })?;
    u64::from_str_radix(digits, 16).map_err(|_| {
        RpcError::InvalidQuantity {
            value: value.to_owned(),
        }
        .into()
    })
}

pub fn to_hex_quantity(height: u64) -> String {
    format!("{height:#x}")
}

/// Builds a [`BlockWrapper`] from a full block object. A `null` result means the node does
/// not have the block yet.
pub fn block_from_value(height: u64, body: Value) -> Result<BlockWrapper> {
    if body.is_null() {
        return Err(RpcError::MissingBlock { height }.into());
    }
    let hash = body
        .get("hash")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    Ok(BlockWrapper { height, hash, body })
}

/// Reads the `number` field of a block object.
pub fn block_number(body: &Value) -> Result<u64> {
    let raw = body
        .get("number")
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::InvalidQuantity {
            value: body.get("number").map(Value::to_string).unwrap_or_default(),
        })?;
    parse_hex_quantity(raw)
}

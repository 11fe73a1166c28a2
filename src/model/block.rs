use super::amount::{decimal, RawAmount};
use crate::error::{IndexerError, IndexerResult};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const POS_MODULE: &str = "pos";
pub const REGISTER_VALIDATOR: &str = "registerValidator";
pub const CHANGE_COMMISSION: &str = "changeCommission";
pub const STAKE: &str = "stake";

/// Block exactly as returned by the node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBlock {
    pub header: RawBlockHeader,
    #[serde(default)]
    pub transactions: Vec<RawTransaction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBlockHeader {
    pub height: u64,
    pub id: String,
    #[serde(default)]
    pub previous_block_id: String,
    pub generator_address: String,
    pub timestamp: u64,
    #[serde(default)]
    pub reward: RawAmount,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTransaction {
    pub id: String,
    pub module: String,
    pub command: String,
    pub sender_address: String,
    #[serde(default)]
    pub fee: RawAmount,
    #[serde(default)]
    pub params: Value,
}

/// Canonical block row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub height: u64,
    pub id: String,
    pub previous_block_id: String,
    pub generator_address: String,
    pub timestamp: u64,
    #[serde(with = "decimal")]
    pub reward: BigUint,
    pub number_of_transactions: u32,
    /// Derived from the finalized height at read time; never persisted as truth.
    pub is_final: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    pub block_id: String,
    pub height: u64,
    pub index: u32,
    pub module: String,
    pub command: String,
    pub sender_address: String,
    #[serde(with = "decimal")]
    pub fee: BigUint,
    pub params: Value,
}

/// A canonical block together with its transactions.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedBlock {
    pub block: Block,
    pub transactions: Vec<Transaction>,
}

/// Outcome of persisting a block at its height.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockWrite {
    /// Height was empty.
    Inserted,
    /// Same height and id were already stored.
    Unchanged,
    /// A different block occupied the height and was cascaded out.
    Replaced(IndexedBlock),
}

/// Payload of a normalized `newBlock` signal.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedBlock {
    pub indexed: IndexedBlock,
    pub write: BlockWrite,
}

impl RawBlock {
    pub fn height(&self) -> u64 {
        self.header.height
    }

    /// Converts node fields into the canonical shape.
    pub fn normalize(&self) -> IndexerResult<(Block, Vec<Transaction>)> {
        let header = &self.header;
        let id = normalize_id("id", &header.id)?;
        let previous_block_id = normalize_id("previousBlockId", &header.previous_block_id)?;
        let generator_address = header.generator_address.trim().to_owned();
        if generator_address.is_empty() {
            return Err(IndexerError::validation(
                "generatorAddress",
                "must not be empty",
            ));
        }
        let number_of_transactions = u32::try_from(self.transactions.len()).map_err(|_| {
            IndexerError::validation("transactions", "too many transactions in one block")
        })?;

        let block = Block {
            height: header.height,
            id: id.clone(),
            previous_block_id,
            generator_address,
            timestamp: header.timestamp,
            reward: header.reward.to_biguint("reward")?,
            number_of_transactions,
            is_final: false,
        };

        let transactions = self
            .transactions
            .iter()
            .zip(0u32..)
            .map(|(raw, index)| {
                Ok(Transaction {
                    id: normalize_id("transaction.id", &raw.id)?,
                    block_id: id.clone(),
                    height: header.height,
                    index,
                    module: raw.module.clone(),
                    command: raw.command.clone(),
                    sender_address: raw.sender_address.trim().to_owned(),
                    fee: raw.fee.to_biguint("transaction.fee")?,
                    params: raw.params.clone(),
                })
            })
            .collect::<IndexerResult<Vec<_>>>()?;

        Ok((block, transactions))
    }
}

/// Decodes a hex id (optionally `0x`-prefixed, any case) and re-encodes it lowercase.
/// An empty input stays empty, which is how genesis reports its parent.
pub fn normalize_id(field: &'static str, value: &str) -> IndexerResult<String> {
    let trimmed = value.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if digits.is_empty() {
        return Ok(String::new());
    }
    let bytes = hex::decode(digits).map_err(|err| IndexerError::validation(field, err.to_string()))?;
    Ok(hex::encode(bytes))
}

impl Transaction {
    pub fn is_validator_registration(&self) -> bool {
        self.module == POS_MODULE && self.command == REGISTER_VALIDATOR
    }

    /// Validator addresses whose registration, commission, or stake this transaction changes.
    pub fn touched_validators(&self) -> Vec<String> {
        if self.module != POS_MODULE {
            return Vec::new();
        }
        match self.command.as_str() {
            REGISTER_VALIDATOR | CHANGE_COMMISSION => vec![self.sender_address.clone()],
            STAKE => self
                .params
                .get("stakes")
                .and_then(Value::as_array)
                .map(|stakes| {
                    stakes
                        .iter()
                        .filter_map(|stake| stake.get("validatorAddress"))
                        .filter_map(Value::as_str)
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }
}

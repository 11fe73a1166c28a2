use crate::error::{IndexerError, IndexerResult};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Amount as delivered by the node: either a decimal string or a JSON integer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawAmount {
    Text(String),
    Number(u64),
}

impl Default for RawAmount {
    fn default() -> Self {
        RawAmount::Number(0)
    }
}

impl From<u64> for RawAmount {
    fn from(value: u64) -> Self {
        RawAmount::Number(value)
    }
}

impl From<&str> for RawAmount {
    fn from(value: &str) -> Self {
        RawAmount::Text(value.to_owned())
    }
}

impl RawAmount {
    /// Parses the amount losslessly, rejecting signs, fractions, and garbage.
    pub fn to_biguint(&self, field: &'static str) -> IndexerResult<BigUint> {
        match self {
            RawAmount::Number(value) => Ok(BigUint::from(*value)),
            RawAmount::Text(text) => parse_decimal(field, text),
        }
    }
}

pub fn parse_decimal(field: &'static str, text: &str) -> IndexerResult<BigUint> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(BigUint::default());
    }
    if !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(IndexerError::validation(
            field,
            format!("'{trimmed}' is not an unsigned decimal integer"),
        ));
    }
    BigUint::from_str(trimmed).map_err(|err| IndexerError::validation(field, err.to_string()))
}

/// Serde adapter rendering [`BigUint`] as a decimal string.
pub mod decimal {
    use num_bigint::BigUint;
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::str::FromStr;

    pub fn serialize<S: Serializer>(value: &BigUint, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_str_radix(10))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigUint, D::Error> {
        let text = String::deserialize(deserializer)?;
        BigUint::from_str(text.trim()).map_err(de::Error::custom)
    }
}

use super::amount::{decimal, RawAmount};
use crate::error::{IndexerError, IndexerResult};
use num_bigint::BigUint;
use num_traits::{CheckedSub, Zero};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidatorStatus {
    Active,
    Standby,
    Banned,
    Punished,
    Ineligible,
}

impl ValidatorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidatorStatus::Active => "active",
            ValidatorStatus::Standby => "standby",
            ValidatorStatus::Banned => "banned",
            ValidatorStatus::Punished => "punished",
            ValidatorStatus::Ineligible => "ineligible",
        }
    }
}

impl fmt::Display for ValidatorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValidatorStatus {
    type Err = IndexerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(ValidatorStatus::Active),
            "standby" => Ok(ValidatorStatus::Standby),
            "banned" => Ok(ValidatorStatus::Banned),
            "punished" => Ok(ValidatorStatus::Punished),
            "ineligible" => Ok(ValidatorStatus::Ineligible),
            other => Err(IndexerError::validation(
                "status",
                format!("unknown validator status '{other}'"),
            )),
        }
    }
}

/// Heights during which a validator is punished, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PunishmentWindow {
    pub start: u64,
    pub end: u64,
}

impl PunishmentWindow {
    pub fn contains(&self, height: u64) -> bool {
        self.start <= height && height <= self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Validator {
    pub address: String,
    pub name: String,
    #[serde(with = "decimal")]
    pub weight: BigUint,
    pub is_banned: bool,
    pub punishment_periods: Vec<PunishmentWindow>,
    pub produced_blocks: u64,
    #[serde(with = "decimal")]
    pub rewards: BigUint,
    pub rank: u32,
    pub status: ValidatorStatus,
}

impl Validator {
    pub fn new(address: impl Into<String>, name: impl Into<String>, weight: BigUint) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
            weight,
            is_banned: false,
            punishment_periods: Vec::new(),
            produced_blocks: 0,
            rewards: BigUint::default(),
            rank: 0,
            status: ValidatorStatus::Ineligible,
        }
    }

    pub fn is_punished_at(&self, height: u64) -> bool {
        self.punishment_periods
            .iter()
            .any(|window| window.contains(height))
    }

    /// Overwrites the block counters with the store's tally. Returns whether they changed.
    pub fn sync_counters(&mut self, tally: &GeneratorTally) -> bool {
        if self.produced_blocks == tally.produced_blocks && self.rewards == tally.rewards {
            return false;
        }
        self.produced_blocks = tally.produced_blocks;
        self.rewards = tally.rewards.clone();
        true
    }
}

/// Blocks produced and rewards earned by one generator, as recorded by the
/// store alongside the blocks themselves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeneratorTally {
    pub produced_blocks: u64,
    pub rewards: BigUint,
}

impl GeneratorTally {
    pub fn credit(&mut self, reward: &BigUint) {
        self.produced_blocks += 1;
        self.rewards += reward;
    }

    /// Never underflows.
    pub fn debit(&mut self, reward: &BigUint) {
        self.produced_blocks = self.produced_blocks.saturating_sub(1);
        self.rewards = self
            .rewards
            .checked_sub(reward)
            .unwrap_or_else(BigUint::zero);
    }

    pub fn is_empty(&self) -> bool {
        self.produced_blocks == 0 && self.rewards.is_zero()
    }
}

/// Ranking order: weight descending, then address ascending byte-wise.
pub fn ranking_order(a: &Validator, b: &Validator) -> Ordering {
    b.weight
        .cmp(&a.weight)
        .then_with(|| a.address.as_bytes().cmp(b.address.as_bytes()))
}

/// Validator as reported by the node, without locally derived counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeValidator {
    pub address: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "validatorWeight", default)]
    pub weight: RawAmount,
    #[serde(default)]
    pub is_banned: bool,
    #[serde(default)]
    pub punishment_periods: Vec<PunishmentWindow>,
}

impl NodeValidator {
    pub fn into_validator(self) -> IndexerResult<Validator> {
        let mut validator = Validator::new(self.address.clone(), "", BigUint::default());
        self.merge_into(&mut validator)?;
        Ok(validator)
    }

    /// Overwrites node-owned fields while keeping produced blocks and rewards.
    /// Returns whether the weight changed.
    pub fn merge_into(self, validator: &mut Validator) -> IndexerResult<bool> {
        let weight = self.weight.to_biguint("validatorWeight")?;
        let weight_changed = validator.weight != weight;
        validator.address = self.address;
        validator.name = self.name;
        validator.weight = weight;
        validator.is_banned = self.is_banned;
        validator.punishment_periods = self.punishment_periods;
        Ok(weight_changed)
    }
}

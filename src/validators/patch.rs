use crate::model::IndexedBlock;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Apply,
    Revert,
}

/// Validator-side effect of applying or reverting one block. Block counters
/// are not carried here; they are read back from the store's generator tally.
#[derive(Debug, Clone)]
pub(crate) struct BlockPatch {
    pub direction: Direction,
    pub generator: String,
    /// Addresses whose node-owned fields must be refetched.
    pub touched: BTreeSet<String>,
    /// Addresses registered by this block.
    pub registrations: BTreeSet<String>,
}

impl BlockPatch {
    pub fn new(block: &IndexedBlock, direction: Direction) -> Self {
        let mut touched = BTreeSet::new();
        let mut registrations = BTreeSet::new();
        for transaction in &block.transactions {
            if transaction.is_validator_registration() {
                registrations.insert(transaction.sender_address.clone());
            }
            touched.extend(transaction.touched_validators());
        }
        Self {
            direction,
            generator: block.block.generator_address.clone(),
            touched,
            registrations,
        }
    }

    /// Registrations undone by a revert; these leave the cache without a node lookup.
    pub fn unregistered(&self) -> impl Iterator<Item = &String> {
        self.registrations
            .iter()
            .filter(move |_| self.direction == Direction::Revert)
    }

    /// Keeps only the generator, for a block whose write was already announced.
    pub fn counters_only(mut self) -> Self {
        self.touched.clear();
        self.registrations.clear();
        self
    }
}

use crate::model::{Validator, ValidatorStatus};
use num_bigint::BigUint;
use std::collections::HashSet;

/// Chain facts a status depends on.
#[derive(Debug, Clone)]
pub struct StatusContext<'a> {
    pub height: u64,
    pub active: HashSet<&'a str>,
    pub min_eligible_weight: &'a BigUint,
}

impl<'a> StatusContext<'a> {
    /// Only the first `active_set_size` generators count as active.
    pub fn new(
        height: u64,
        generators: &'a [String],
        active_set_size: usize,
        min_eligible_weight: &'a BigUint,
    ) -> Self {
        Self {
            height,
            active: generators
                .iter()
                .take(active_set_size)
                .map(String::as_str)
                .collect(),
            min_eligible_weight,
        }
    }
}

/// First match wins: banned, punished, active, standby, ineligible.
pub fn compute_status(validator: &Validator, context: &StatusContext<'_>) -> ValidatorStatus {
    if validator.is_banned {
        ValidatorStatus::Banned
    } else if validator.is_punished_at(context.height) {
        ValidatorStatus::Punished
    } else if context.active.contains(validator.address.as_str()) {
        ValidatorStatus::Active
    } else if &validator.weight >= context.min_eligible_weight {
        ValidatorStatus::Standby
    } else {
        ValidatorStatus::Ineligible
    }
}

pub fn apply_statuses(validators: &mut [Validator], context: &StatusContext<'_>) {
    for validator in validators {
        validator.status = compute_status(validator, context);
    }
}

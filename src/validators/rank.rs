use crate::model::{ranking_order, Validator};

/// Orders by weight descending then address ascending, and assigns ranks `1..=len`.
pub fn compute_rank(validators: &mut [Validator]) {
    validators.sort_by(ranking_order);
    for (rank, validator) in (1u32..).zip(validators.iter_mut()) {
        validator.rank = rank;
    }
}

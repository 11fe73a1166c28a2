use crate::error::{IndexerError, IndexerResult};
use crate::model::{Validator, ValidatorStatus};
use crate::store::query::{validate_limit, DEFAULT_PAGE_LIMIT};
use crate::store::{Page, SortDirection};
use std::cmp::Ordering;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidatorSortField {
    Rank,
    Weight,
    Name,
}

/// Validator ordering, parsed from `field:direction` (e.g. `rank:asc`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatorSort {
    pub field: ValidatorSortField,
    pub direction: SortDirection,
}

impl Default for ValidatorSort {
    fn default() -> Self {
        Self {
            field: ValidatorSortField::Rank,
            direction: SortDirection::Asc,
        }
    }
}

impl FromStr for ValidatorSort {
    type Err = IndexerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (field, direction) = value.split_once(':').unwrap_or((value, "asc"));
        let field = match field {
            "rank" => ValidatorSortField::Rank,
            "weight" | "validatorWeight" => ValidatorSortField::Weight,
            "name" => ValidatorSortField::Name,
            other => {
                return Err(IndexerError::validation(
                    "sort",
                    format!("validators cannot be sorted by '{other}'"),
                ))
            }
        };
        Ok(Self {
            field,
            direction: direction.parse()?,
        })
    }
}

/// Filters and pagination for validator listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorQuery {
    pub address: Option<String>,
    pub name: Option<String>,
    /// Any of the listed statuses; empty means no status filter.
    pub statuses: Vec<ValidatorStatus>,
    pub sort: ValidatorSort,
    pub limit: usize,
    pub offset: usize,
}

impl Default for ValidatorQuery {
    fn default() -> Self {
        Self {
            address: None,
            name: None,
            statuses: Vec::new(),
            sort: ValidatorSort::default(),
            limit: DEFAULT_PAGE_LIMIT,
            offset: 0,
        }
    }
}

impl ValidatorQuery {
    pub fn validate(&self) -> IndexerResult<()> {
        validate_limit(self.limit)
    }

    pub fn matches(&self, validator: &Validator) -> bool {
        self.address
            .as_deref()
            .map_or(true, |address| validator.address == address)
            && self
                .name
                .as_deref()
                .map_or(true, |name| validator.name == name)
            && (self.statuses.is_empty() || self.statuses.contains(&validator.status))
    }

    fn compare(&self, a: &Validator, b: &Validator) -> Ordering {
        let ordering = match self.sort.field {
            ValidatorSortField::Rank => a.rank.cmp(&b.rank),
            ValidatorSortField::Weight => a
                .weight
                .cmp(&b.weight)
                .then_with(|| b.address.cmp(&a.address)),
            ValidatorSortField::Name => a.name.cmp(&b.name).then_with(|| a.address.cmp(&b.address)),
        };
        match self.sort.direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        }
    }

    /// Filters, sorts, and paginates a snapshot.
    pub fn apply(&self, validators: &[Validator]) -> IndexerResult<Page<Validator>> {
        self.validate()?;
        let mut matched: Vec<Validator> = validators
            .iter()
            .filter(|validator| self.matches(validator))
            .cloned()
            .collect();
        matched.sort_by(|a, b| self.compare(a, b));
        Ok(Page::paginate(matched, self.offset, self.limit))
    }
}

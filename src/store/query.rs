use crate::error::{IndexerError, IndexerResult};
use crate::model::Block;
use std::str::FromStr;

pub const DEFAULT_PAGE_LIMIT: usize = 10;
pub const MAX_PAGE_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl FromStr for SortDirection {
    type Err = IndexerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "asc" => Ok(SortDirection::Asc),
            "desc" => Ok(SortDirection::Desc),
            other => Err(IndexerError::validation(
                "sort",
                format!("unknown direction '{other}'"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSortField {
    Height,
    Timestamp,
}

/// Block ordering, parsed from `field:direction` (e.g. `height:desc`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSort {
    pub field: BlockSortField,
    pub direction: SortDirection,
}

impl Default for BlockSort {
    fn default() -> Self {
        Self {
            field: BlockSortField::Height,
            direction: SortDirection::Desc,
        }
    }
}

impl FromStr for BlockSort {
    type Err = IndexerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (field, direction) = value.split_once(':').unwrap_or((value, "desc"));
        let field = match field {
            "height" => BlockSortField::Height,
            "timestamp" => BlockSortField::Timestamp,
            other => {
                return Err(IndexerError::validation(
                    "sort",
                    format!("blocks cannot be sorted by '{other}'"),
                ))
            }
        };
        Ok(Self {
            field,
            direction: direction.parse()?,
        })
    }
}

/// Filters and pagination for block listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockQuery {
    pub id: Option<String>,
    pub height: Option<u64>,
    pub generator_address: Option<String>,
    pub timestamp_from: Option<u64>,
    pub timestamp_to: Option<u64>,
    pub sort: BlockSort,
    pub limit: usize,
    pub offset: usize,
}

impl Default for BlockQuery {
    fn default() -> Self {
        Self {
            id: None,
            height: None,
            generator_address: None,
            timestamp_from: None,
            timestamp_to: None,
            sort: BlockSort::default(),
            limit: DEFAULT_PAGE_LIMIT,
            offset: 0,
        }
    }
}

impl BlockQuery {
    pub fn validate(&self) -> IndexerResult<()> {
        validate_limit(self.limit)?;
        if let (Some(from), Some(to)) = (self.timestamp_from, self.timestamp_to) {
            if from > to {
                return Err(IndexerError::validation(
                    "timestamp",
                    format!("range start {from} is after range end {to}"),
                ));
            }
        }
        Ok(())
    }

    pub fn matches(&self, block: &Block) -> bool {
        self.id.as_deref().map_or(true, |id| block.id == id)
            && self.height.map_or(true, |height| block.height == height)
            && self
                .generator_address
                .as_deref()
                .map_or(true, |address| block.generator_address == address)
            && self.timestamp_from.map_or(true, |from| block.timestamp >= from)
            && self.timestamp_to.map_or(true, |to| block.timestamp <= to)
    }
}

pub fn validate_limit(limit: usize) -> IndexerResult<()> {
    if limit == 0 || limit > MAX_PAGE_LIMIT {
        return Err(IndexerError::validation(
            "limit",
            format!("must be between 1 and {MAX_PAGE_LIMIT}"),
        ));
    }
    Ok(())
}

/// One page of results plus the number of matches before pagination.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub total: usize,
}

impl<T> Page<T> {
    pub fn paginate(items: Vec<T>, offset: usize, limit: usize) -> Self {
        let total = items.len();
        let data = items.into_iter().skip(offset).take(limit).collect();
        Self { data, total }
    }
}

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockSummary {
    pub height: u64,
    pub id: String,
}

/// Derived indexing progress read model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStats {
    pub genesis_height: u64,
    pub current_chain_height: u64,
    pub num_blocks_indexed: u64,
    pub last_indexed_block: Option<BlockSummary>,
    pub percentage_indexed: f64,
}

impl IndexStats {
    pub fn compute(
        genesis_height: u64,
        current_chain_height: u64,
        num_blocks_indexed: u64,
        last_indexed_block: Option<BlockSummary>,
    ) -> Self {
        let expected = current_chain_height
            .saturating_sub(genesis_height)
            .saturating_add(1);
        let ratio = num_blocks_indexed as f64 / expected as f64 * 100.0;
        let percentage_indexed = (ratio.clamp(0.0, 100.0) * 100.0).round() / 100.0;

        Self {
            genesis_height,
            current_chain_height,
            num_blocks_indexed,
            last_indexed_block,
            percentage_indexed,
        }
    }
}

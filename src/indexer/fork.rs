use std::collections::BTreeMap;

/// Ids of the most recently applied heights, used to spot a parent mismatch.
#[derive(Debug, Clone)]
pub struct ForkWindow {
    limit: usize,
    ids: BTreeMap<u64, String>,
}

impl ForkWindow {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            ids: BTreeMap::new(),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Remembers `id` at `height`, evicting the lowest heights beyond the limit.
    pub fn record(&mut self, height: u64, id: &str) {
        self.ids.insert(height, id.to_owned());
        while self.ids.len() > self.limit {
            self.ids.pop_first();
        }
    }

    pub fn id_at(&self, height: u64) -> Option<&str> {
        self.ids.get(&height).map(String::as_str)
    }

    pub fn forget(&mut self, height: u64) {
        self.ids.remove(&height);
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    /// Returns the id the window holds for the parent height when it disagrees
    /// with `previous_block_id`. Unknown parents are not treated as forks.
    pub fn parent_mismatch(&self, height: u64, previous_block_id: &str) -> Option<&str> {
        let parent = height.checked_sub(1)?;
        self.id_at(parent)
            .filter(|known| *known != previous_block_id)
    }
}

use alloy_primitives::B256;
use std::collections::VecDeque;

/// Sliding window of recent canonical `(number, hash)` pairs, ascending and
/// contiguous, used to find the common ancestor during a reorg.
#[derive(Debug, Clone)]
pub struct HeadWindow {
    limit: usize,
    items: VecDeque<(u64, B256)>,
}

impl HeadWindow {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            items: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Appends a head. A number that does not directly follow the newest entry
    /// starts a fresh window.
    pub fn push(&mut self, number: u64, hash: B256) {
        if let Some((latest, _)) = self.items.back() {
            if number != latest.saturating_add(1) {
                self.truncate_after(number.saturating_sub(1));
                if matches!(self.items.back(), Some((latest, _)) if number != latest.saturating_add(1))
                {
                    self.items.clear();
                }
            }
        }
        self.items.push_back((number, hash));
        if self.items.len() > self.limit {
            self.items.pop_front();
        }
    }

    pub fn hash_at(&self, number: u64) -> Option<B256> {
        let (oldest, _) = self.items.front()?;
        let offset = usize::try_from(number.checked_sub(*oldest)?).ok()?;
        self.items.get(offset).map(|(_, hash)| *hash)
    }

    pub fn find_hash(&self, hash: &B256) -> Option<u64> {
        self.items
            .iter()
            .rev()
            .find(|(_, existing_hash)| existing_hash == hash)
            .map(|(number, _)| *number)
    }

    pub fn oldest(&self) -> Option<u64> {
        self.items.front().map(|(number, _)| *number)
    }

    pub fn latest(&self) -> Option<(u64, B256)> {
        self.items.back().copied()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Drops every entry above `number`, keeping the older prefix.
    pub fn truncate_after(&mut self, number: u64) {
        while matches!(self.items.back(), Some((existing, _)) if *existing > number) {
            self.items.pop_back();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &(u64, B256)> {
        self.items.iter()
    }
}

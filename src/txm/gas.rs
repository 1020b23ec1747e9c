use alloy_primitives::U256;

const GWEI: u64 = 1_000_000_000;
const DEFAULT_BUMP_PERCENT: u64 = 20;
const DEFAULT_BUMP_MIN_INCREASE_GWEI: u64 = 5;
const DEFAULT_BUMP_THRESHOLD_BLOCKS: u64 = 12;

/// When and by how much an unconfirmed attempt is re-priced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasBumpPolicy {
    /// Percentage added to the previous price on each bump.
    pub percent: u64,
    /// Absolute floor for each increase, in wei.
    pub min_increase: U256,
    /// Blocks an attempt may sit without a receipt before it is bumped.
    pub threshold_blocks: u64,
}

impl Default for GasBumpPolicy {
    fn default() -> Self {
        Self {
            percent: DEFAULT_BUMP_PERCENT,
            min_increase: U256::from(DEFAULT_BUMP_MIN_INCREASE_GWEI * GWEI),
            threshold_blocks: DEFAULT_BUMP_THRESHOLD_BLOCKS,
        }
    }
}

impl GasBumpPolicy {
    /// Price for the replacement attempt: the larger of the percentage and the
    /// absolute step, and always strictly above `previous`.
    pub fn next_price(&self, previous: U256) -> U256 {
        let scaled = previous.saturating_mul(U256::from(100u64.saturating_add(self.percent)))
            / U256::from(100u64);
        let stepped = previous.saturating_add(self.min_increase);
        let next = scaled.max(stepped);
        if next > previous {
            next
        } else {
            previous.saturating_add(U256::from(1u64))
        }
    }

    pub fn is_due(&self, sent_at: u64, head: u64) -> bool {
        head.saturating_sub(sent_at) >= self.threshold_blocks
    }
}

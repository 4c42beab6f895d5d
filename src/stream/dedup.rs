use std::collections::{HashMap, HashSet};

/// How colliding timestamps are separated within one flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TieBreakMode {
    /// The n-th repeat of `(node, channel, ts)` is written at `ts + n`.
    /// A bumped value may still equal another sample's original timestamp.
    #[default]
    OriginalKey,
    /// Like `OriginalKey`, then keeps bumping until the timestamp is unused
    /// for that `(node, channel)`.
    Strict,
}

impl TieBreakMode {
    pub fn from_strict(strict: bool) -> Self {
        if strict {
            Self::Strict
        } else {
            Self::OriginalKey
        }
    }
}

/// Assigns sink timestamps so repeated `(node, channel, ts)` keys do not
/// overwrite each other. Collisions are bumped, never dropped.
///
/// One instance covers one flush (or one backfill call).
#[derive(Debug, Default)]
pub struct TieBreaker {
    mode: TieBreakMode,
    counts: HashMap<(u32, String, i64), i64>,
    emitted: HashSet<(u32, String, i64)>,
}

impl TieBreaker {
    pub fn new(mode: TieBreakMode) -> Self {
        Self {
            mode,
            counts: HashMap::new(),
            emitted: HashSet::new(),
        }
    }

    /// Returns the timestamp to write for a sample originally at `ts`.
    pub fn assign(&mut self, node_id: u32, channel: &str, ts: i64) -> i64 {
        let dup_idx = self
            .counts
            .entry((node_id, channel.to_string(), ts))
            .and_modify(|n| *n += 1)
            .or_insert(0);
        let mut out = ts.saturating_add(*dup_idx);

        if self.mode == TieBreakMode::Strict {
            while !self.emitted.insert((node_id, channel.to_string(), out)) {
                out = out.saturating_add(1);
            }
        }

        out
    }

    pub fn clear(&mut self) {
        self.counts.clear();
        self.emitted.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(mode: TieBreakMode, input: &[i64]) -> Vec<i64> {
        let mut tb = TieBreaker::new(mode);
        input.iter().map(|ts| tb.assign(1, "ch1", *ts)).collect()
    }

    #[test]
    fn test_original_key_bumps_once_per_repeat() {
        assert_eq!(run(TieBreakMode::OriginalKey, &[100, 100, 100]), vec![100, 101, 102]);
    }

    #[test]
    fn test_original_key_leaves_latent_collision() {
        // The bump is keyed on the original timestamp, so 100's repeat lands
        // on 101 and the genuine 101 sample keeps its own slot.
        assert_eq!(run(TieBreakMode::OriginalKey, &[100, 100, 101]), vec![100, 101, 101]);
    }

    #[test]
    fn test_strict_rechecks_bumped_values() {
        assert_eq!(run(TieBreakMode::Strict, &[100, 100, 101]), vec![100, 101, 102]);
        assert_eq!(run(TieBreakMode::Strict, &[101, 100, 100]), vec![101, 100, 102]);
    }

    #[test]
    fn test_keys_are_per_node_and_channel() {
        let mut tb = TieBreaker::new(TieBreakMode::OriginalKey);
        assert_eq!(tb.assign(1, "ch1", 500), 500);
        assert_eq!(tb.assign(1, "ch2", 500), 500);
        assert_eq!(tb.assign(2, "ch1", 500), 500);
        assert_eq!(tb.assign(1, "ch1", 500), 501);
    }

    #[test]
    fn test_strict_output_is_unique() {
        let input = [7, 7, 8, 8, 9, 7, 10, 10];
        let out = run(TieBreakMode::Strict, &input);
        let unique: HashSet<i64> = out.iter().copied().collect();
        assert_eq!(unique.len(), out.len());
        assert!(out.iter().zip(input.iter()).all(|(o, i)| o >= i));
    }

    #[test]
    fn test_clear_resets_counts() {
        let mut tb = TieBreaker::new(TieBreakMode::Strict);
        tb.assign(1, "ch1", 10);
        tb.clear();
        assert_eq!(tb.assign(1, "ch1", 10), 10);
    }
}

//! The published warm-target snapshot.

use std::collections::BTreeMap;

use prepline_state::{FunctionId, PoolType};

/// Desired warm containers per (function, pool), computed in one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarmTargets {
    targets: BTreeMap<(FunctionId, PoolType), u32>,
    pub computed_at_ms: u64,
}

impl WarmTargets {
    pub fn new(targets: BTreeMap<(FunctionId, PoolType), u32>, computed_at_ms: u64) -> Self {
        Self {
            targets,
            computed_at_ms,
        }
    }

    /// Target for a pair; pairs without a target read as zero.
    pub fn get(&self, function_id: &str, pool: PoolType) -> u32 {
        self.targets
            .get(&(function_id.to_string(), pool))
            .copied()
            .unwrap_or(0)
    }

    pub fn contains(&self, function_id: &str, pool: PoolType) -> bool {
        self.targets.contains_key(&(function_id.to_string(), pool))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FunctionId, PoolType, u32)> {
        self.targets.iter().map(|((f, pool), target)| (f, *pool, *target))
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_pairs_read_zero() {
        let mut map = BTreeMap::new();
        map.insert(("f1".to_string(), PoolType::Gpu), 4);
        let targets = WarmTargets::new(map, 10);
        assert_eq!(targets.get("f1", PoolType::Gpu), 4);
        assert_eq!(targets.get("f1", PoolType::Cpu), 0);
        assert!(!targets.contains("f2", PoolType::Gpu));
        assert_eq!(targets.iter().count(), 1);
    }
}

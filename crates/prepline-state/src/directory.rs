//! Function profile lookup.

use std::collections::BTreeMap;

use crate::types::{FunctionId, FunctionProfile};

/// Source of function profiles, supplied by whatever owns function
/// definitions.
pub trait FunctionDirectory: Send + Sync {
    fn get_function_profile(&self, function_id: &str) -> Option<FunctionProfile>;

    /// Every known function, ordered by id.
    fn list_functions(&self) -> Vec<FunctionProfile>;
}

/// A fixed directory, typically loaded from `prepline.toml`.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    profiles: BTreeMap<FunctionId, FunctionProfile>,
}

impl StaticDirectory {
    /// Later profiles replace earlier ones with the same id.
    pub fn new(profiles: impl IntoIterator<Item = FunctionProfile>) -> Self {
        Self {
            profiles: profiles
                .into_iter()
                .map(|p| (p.function_id.clone(), p))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

impl FunctionDirectory for StaticDirectory {
    fn get_function_profile(&self, function_id: &str) -> Option<FunctionProfile> {
        self.profiles.get(function_id).cloned()
    }

    fn list_functions(&self) -> Vec<FunctionProfile> {
        self.profiles.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PoolType, Runtime};

    #[test]
    fn lookup_and_listing() {
        let dir = StaticDirectory::new([
            FunctionProfile::new("b", Runtime::Go122, PoolType::Cpu),
            FunctionProfile::new("a", Runtime::Python311, PoolType::Gpu),
            FunctionProfile::new("b", Runtime::Nodejs18, PoolType::Large),
        ]);
        assert_eq!(dir.len(), 2);
        assert_eq!(dir.get_function_profile("b").unwrap().pool_type, PoolType::Large);
        assert!(dir.get_function_profile("c").is_none());
        let ids: Vec<String> = dir.list_functions().into_iter().map(|p| p.function_id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}

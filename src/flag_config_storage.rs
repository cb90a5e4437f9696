use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use crate::evaluation::Flag;

/// Flags by key.
pub type FlagConfigs = HashMap<String, Arc<Flag>>;

/// `FlagConfigStorage` provides a Sync storage for flag configs that allows concurrent access for
/// readers and writers.
///
/// Readers get a snapshot that is never modified in place: writers swap in a new map, so a
/// reader sees either all of an update or none of it.
#[derive(Default)]
pub struct FlagConfigStorage {
    flag_configs: RwLock<Arc<FlagConfigs>>,
}

impl FlagConfigStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_flag_config(&self, key: &str) -> Option<Arc<Flag>> {
        self.get_flag_configs().get(key).cloned()
    }

    /// Snapshot of all flags, safe to iterate without holding a lock.
    pub fn get_flag_configs(&self) -> Arc<FlagConfigs> {
        let flag_configs = self
            .flag_configs
            .read()
            .expect("thread holding flag config lock should not panic");
        Arc::clone(&flag_configs)
    }

    /// Replace all flags, returning the previous ones. Flags absent from `flag_configs` are
    /// removed.
    pub fn replace_flag_configs(&self, flag_configs: FlagConfigs) -> Arc<FlagConfigs> {
        // Constructing new value before requesting the lock to minimize lock span.
        let new_value = Arc::new(flag_configs);

        let mut slot = self
            .flag_configs
            .write()
            .expect("thread holding flag config lock should not panic");
        std::mem::replace(&mut slot, new_value)
    }
}

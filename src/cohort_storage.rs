use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::{Arc, RwLock},
};

use crate::cohort::{Cohort, USER_GROUP_TYPE};

#[derive(Default)]
struct Cohorts {
    by_id: HashMap<String, Arc<Cohort>>,
    /// Group type to ids of cohorts of that type.
    by_group_type: HashMap<String, HashSet<String>>,
}

/// `CohortStorage` holds downloaded cohorts and answers membership queries. Allows concurrent
/// access for readers and writers.
#[derive(Default)]
pub struct CohortStorage {
    cohorts: RwLock<Cohorts>,
}

impl CohortStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_cohort(&self, cohort_id: &str) -> Option<Arc<Cohort>> {
        self.read().by_id.get(cohort_id).cloned()
    }

    pub fn get_cohorts(&self) -> HashMap<String, Arc<Cohort>> {
        self.read().by_id.clone()
    }

    pub fn get_cohort_ids(&self) -> BTreeSet<String> {
        self.read().by_id.keys().cloned().collect()
    }

    /// Which of `cohort_ids` the user is a member of.
    pub fn get_cohorts_for_user(
        &self,
        user_id: &str,
        cohort_ids: &BTreeSet<String>,
    ) -> BTreeSet<String> {
        self.get_cohorts_for_group(USER_GROUP_TYPE, user_id, cohort_ids)
    }

    /// Which of `cohort_ids` of type `group_type` the group is a member of.
    pub fn get_cohorts_for_group(
        &self,
        group_type: &str,
        group_name: &str,
        cohort_ids: &BTreeSet<String>,
    ) -> BTreeSet<String> {
        let cohorts = self.read();
        let Some(group_cohorts) = cohorts.by_group_type.get(group_type) else {
            return BTreeSet::new();
        };
        group_cohorts
            .iter()
            .filter(|id| cohort_ids.contains(*id))
            .filter(|id| {
                cohorts
                    .by_id
                    .get(*id)
                    .is_some_and(|cohort| cohort.member_ids.contains(group_name))
            })
            .cloned()
            .collect()
    }

    /// Store `cohort`, replacing any previous version.
    pub fn put_cohort(&self, cohort: Cohort) {
        let cohort = Arc::new(cohort);
        let mut cohorts = self
            .cohorts
            .write()
            .expect("thread holding cohort lock should not panic");
        if let Some(previous) = cohorts.by_id.get(&cohort.id).cloned() {
            if previous.group_type != cohort.group_type {
                remove_from_group(&mut cohorts.by_group_type, &previous.group_type, &previous.id);
            }
        }
        cohorts
            .by_group_type
            .entry(cohort.group_type.clone())
            .or_default()
            .insert(cohort.id.clone());
        cohorts.by_id.insert(cohort.id.clone(), cohort);
    }

    pub fn delete_cohort(&self, group_type: &str, cohort_id: &str) {
        let mut cohorts = self
            .cohorts
            .write()
            .expect("thread holding cohort lock should not panic");
        remove_from_group(&mut cohorts.by_group_type, group_type, cohort_id);
        cohorts.by_id.remove(cohort_id);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Cohorts> {
        self.cohorts
            .read()
            .expect("thread holding cohort lock should not panic")
    }
}

fn remove_from_group(
    by_group_type: &mut HashMap<String, HashSet<String>>,
    group_type: &str,
    cohort_id: &str,
) {
    if let Some(ids) = by_group_type.get_mut(group_type) {
        ids.remove(cohort_id);
        if ids.is_empty() {
            by_group_type.remove(group_type);
        }
    }
}

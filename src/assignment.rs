//! Assignment tracking: one event per distinct evaluation result per user per day.
use std::{collections::HashMap, sync::Arc};

use serde_json::{json, Map, Value};

use crate::{
    dedup::{DedupFilter, Deduplicate},
    evaluation::Variant,
    tracker::{AnalyticsEvent, EventTracker},
    User,
};

pub(crate) const DAY_MILLIS: i64 = 24 * 60 * 60 * 1000;
pub(crate) const FLAG_TYPE_MUTUAL_EXCLUSION_GROUP: &str = "mutual-exclusion-group";

/// Evaluation results for a user at a point in time.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub user: User,
    pub results: HashMap<String, Variant>,
    /// Milliseconds since the unix epoch.
    pub timestamp: i64,
}

impl Assignment {
    pub fn new(user: User, results: HashMap<String, Variant>) -> Assignment {
        Assignment {
            user,
            results,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn canonicalize(&self) -> String {
        canonicalize(&self.user, &self.results)
    }
}

/// `"<user_id> <device_id> <flag> <variant> ..."` with flags in key order.
pub(crate) fn canonicalize(user: &User, results: &HashMap<String, Variant>) -> String {
    let mut canonical = format!("{} {} ", user.user_id(), user.device_id());
    let mut keys: Vec<&String> = results.keys().collect();
    keys.sort_unstable();
    for key in keys {
        canonical.push_str(key);
        canonical.push(' ');
        canonical.push_str(&results[key].key);
        canonical.push(' ');
    }
    canonical
}

/// 32-bit string hash matching the analytics backend's insert id scheme.
pub(crate) fn hash_code(s: &str) -> i64 {
    s.bytes().fold(0i64, |hash, b| {
        ((hash << 5) - hash + i64::from(b)) & 0xFFFF_FFFF
    })
}

impl Deduplicate for Assignment {
    fn dedup_key(&self) -> Option<String> {
        (!self.results.is_empty()).then(|| self.canonicalize())
    }
}

/// Remembers recently tracked assignments.
pub type AssignmentFilter = DedupFilter<Assignment>;

pub struct AssignmentService {
    tracker: Arc<dyn EventTracker + Send + Sync>,
    filter: AssignmentFilter,
}

impl AssignmentService {
    pub fn new(
        tracker: Arc<dyn EventTracker + Send + Sync>,
        filter: AssignmentFilter,
    ) -> AssignmentService {
        AssignmentService { tracker, filter }
    }

    pub fn track(&self, assignment: &Assignment) {
        if self.filter.should_track(assignment) {
            self.tracker.track(to_event(assignment));
        }
    }
}

pub(crate) fn to_event(assignment: &Assignment) -> AnalyticsEvent {
    let mut event_properties = Map::new();
    let mut set = Map::new();
    let mut unset = Map::new();
    for (flag_key, variant) in &assignment.results {
        event_properties.insert(format!("{flag_key}.variant"), json!(variant.key));
        if variant.flag_type() == Some(FLAG_TYPE_MUTUAL_EXCLUSION_GROUP) {
            continue;
        }
        let property = format!("[Experiment] {flag_key}");
        if variant.is_default_variant() {
            unset.insert(property, json!("-"));
        } else {
            set.insert(property, json!(variant.key));
        }
    }

    let mut user_properties = Map::new();
    user_properties.insert("$set".to_owned(), Value::Object(set));
    user_properties.insert("$unset".to_owned(), Value::Object(unset));

    let user = &assignment.user;
    AnalyticsEvent {
        event_type: "[Experiment] assignment".to_owned(),
        user_id: user.user_id.clone(),
        device_id: user.device_id.clone(),
        event_properties,
        user_properties,
        groups: HashMap::new(),
        insert_id: format!(
            "{} {} {} {}",
            user.user_id(),
            user.device_id(),
            hash_code(&assignment.canonicalize()),
            assignment.timestamp / DAY_MILLIS
        ),
    }
}

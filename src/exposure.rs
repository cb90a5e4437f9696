//! Exposure tracking: one event per flag actually shown to a user, deduplicated per day.
use std::{collections::HashMap, sync::Arc};

use serde_json::{json, Map, Value};

use crate::{
    assignment::{canonicalize, hash_code, DAY_MILLIS, FLAG_TYPE_MUTUAL_EXCLUSION_GROUP},
    dedup::{DedupFilter, Deduplicate},
    evaluation::Variant,
    tracker::{AnalyticsEvent, EventTracker},
    User,
};

#[derive(Debug, Clone)]
pub struct Exposure {
    pub user: User,
    pub results: HashMap<String, Variant>,
    /// Milliseconds since the unix epoch.
    pub timestamp: i64,
}

impl Exposure {
    pub fn new(user: User, results: HashMap<String, Variant>) -> Exposure {
        Exposure {
            user,
            results,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn canonicalize(&self) -> String {
        canonicalize(&self.user, &self.results)
    }
}

impl Deduplicate for Exposure {
    fn dedup_key(&self) -> Option<String> {
        (!self.results.is_empty()).then(|| self.canonicalize())
    }
}

/// Remembers recently tracked exposures, independently of assignments.
pub type ExposureFilter = DedupFilter<Exposure>;

pub struct ExposureService {
    tracker: Arc<dyn EventTracker + Send + Sync>,
    filter: ExposureFilter,
}

impl ExposureService {
    pub fn new(tracker: Arc<dyn EventTracker + Send + Sync>, filter: ExposureFilter) -> ExposureService {
        ExposureService { tracker, filter }
    }

    pub fn track(&self, exposure: &Exposure) {
        if self.filter.should_track(exposure) {
            for event in to_exposure_events(exposure) {
                self.tracker.track(event);
            }
        }
    }
}

/// One event per exposed flag. Default variants and flags with `trackExposure: false` are not
/// exposures.
pub(crate) fn to_exposure_events(exposure: &Exposure) -> Vec<AnalyticsEvent> {
    let canonical = exposure.canonicalize();
    let user = &exposure.user;

    let mut flag_keys: Vec<&String> = exposure.results.keys().collect();
    flag_keys.sort_unstable();

    let mut events = Vec::new();
    for flag_key in flag_keys {
        let variant = &exposure.results[flag_key];
        if !variant.track_exposure() || variant.is_default_variant() {
            continue;
        }

        let label = variant.label();
        let mut set = Map::new();
        if variant.flag_type() != Some(FLAG_TYPE_MUTUAL_EXCLUSION_GROUP) {
            if let Some(label) = label {
                set.insert(format!("[Experiment] {flag_key}"), json!(label));
            }
        }
        let mut user_properties = Map::new();
        user_properties.insert("$set".to_owned(), Value::Object(set));
        user_properties.insert("$unset".to_owned(), Value::Object(Map::new()));

        let mut event_properties = Map::new();
        event_properties.insert("[Experiment] Flag Key".to_owned(), json!(flag_key));
        if let Some(label) = label {
            event_properties.insert("[Experiment] Variant".to_owned(), json!(label));
        }
        if let Some(metadata) = &variant.metadata {
            event_properties.insert("metadata".to_owned(), Value::Object(metadata.clone()));
        }

        events.push(AnalyticsEvent {
            event_type: "[Experiment] Exposure".to_owned(),
            user_id: user.user_id.clone(),
            device_id: user.device_id.clone(),
            event_properties,
            user_properties,
            groups: user.groups.clone(),
            insert_id: format!(
                "{} {} {} {}",
                user.user_id(),
                user.device_id(),
                hash_code(&format!("{flag_key} {canonical}")),
                exposure.timestamp / DAY_MILLIS
            ),
        });
    }
    events
}

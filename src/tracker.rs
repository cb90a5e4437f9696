use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An analytics event produced by assignment and exposure tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsEvent {
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub event_properties: Map<String, Value>,
    /// Identify operations, keyed by `$set` and `$unset`.
    pub user_properties: Map<String, Value>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub groups: HashMap<String, Vec<String>>,
    /// Stable id letting the analytics backend drop duplicates that escape the local filters.
    pub insert_id: String,
}

/// Destination for [`AnalyticsEvent`]s, typically an analytics SDK.
///
/// Implemented for closures:
///
/// ```
/// # use experiment_local::{AnalyticsEvent, AssignmentConfig};
/// let config = AssignmentConfig::new(|event: AnalyticsEvent| {
///     println!("{:?}", event);
/// });
/// ```
pub trait EventTracker {
    /// Called from the evaluating thread. Should hand off quickly.
    fn track(&self, event: AnalyticsEvent);
}

impl<T: Fn(AnalyticsEvent)> EventTracker for T {
    fn track(&self, event: AnalyticsEvent) {
        self(event);
    }
}

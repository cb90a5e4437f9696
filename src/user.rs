use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identity and properties of the user a flag is evaluated for.
///
/// Empty strings are treated the same as `None`.
///
/// ```
/// # use experiment_local::User;
/// let user = User {
///     device_id: Some("device".to_owned()),
///     country: Some("US".to_owned()),
///     ..User::from_user_id("user")
/// };
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dma: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_brand: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carrier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub library: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub user_properties: Map<String, Value>,
    /// Group type to group names. Only the first name of each type is targeted.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub groups: HashMap<String, Vec<String>>,
    /// Group type to group name to properties.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub group_properties: HashMap<String, HashMap<String, Map<String, Value>>>,
    /// Cohorts the user is a member of. Filled from cohort storage during evaluation.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub cohort_ids: BTreeSet<String>,
    /// Group type to group name to cohorts the group is a member of.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub group_cohort_ids: HashMap<String, HashMap<String, BTreeSet<String>>>,
}

impl User {
    pub fn from_user_id(user_id: impl Into<String>) -> User {
        User {
            user_id: Some(user_id.into()),
            ..User::default()
        }
    }

    pub fn from_device_id(device_id: impl Into<String>) -> User {
        User {
            device_id: Some(device_id.into()),
            ..User::default()
        }
    }

    /// User id, empty if unset.
    pub fn user_id(&self) -> &str {
        self.user_id.as_deref().unwrap_or_default()
    }

    /// Device id, empty if unset.
    pub fn device_id(&self) -> &str {
        self.device_id.as_deref().unwrap_or_default()
    }

    pub(crate) fn add_group_cohort_ids(
        &mut self,
        group_type: &str,
        group_name: &str,
        cohort_ids: impl IntoIterator<Item = String>,
    ) {
        self.group_cohort_ids
            .entry(group_type.to_owned())
            .or_default()
            .entry(group_name.to_owned())
            .or_default()
            .extend(cohort_ids);
    }
}

//! Audience cohorts and the cohort filters in flags that reference them.
use std::collections::{BTreeSet, HashMap, HashSet};

use serde::Deserialize;

use crate::evaluation::{models::Condition, Flag, Operator};

/// Group type of cohorts made of users rather than groups.
pub const USER_GROUP_TYPE: &str = "user";

/// A versioned set of member ids. Membership is immutable for a given `last_modified`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cohort {
    pub id: String,
    /// Milliseconds since the unix epoch.
    pub last_modified: i64,
    pub size: usize,
    pub member_ids: HashSet<String>,
    pub group_type: String,
}

/// Cohort as returned by the cohort server.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CohortDescription {
    cohort_id: String,
    last_modified: i64,
    size: usize,
    #[serde(default)]
    member_ids: Vec<String>,
    #[serde(default)]
    group_type: Option<String>,
}

impl From<CohortDescription> for Cohort {
    fn from(wire: CohortDescription) -> Self {
        Cohort {
            id: wire.cohort_id,
            last_modified: wire.last_modified,
            size: wire.size,
            member_ids: wire.member_ids.into_iter().collect(),
            group_type: wire
                .group_type
                .filter(|g| !g.is_empty())
                .unwrap_or_else(|| USER_GROUP_TYPE.to_owned()),
        }
    }
}

impl Condition {
    /// Cohort filters select `cohort_ids` with one of the "set contains any" operators.
    fn is_cohort_filter(&self) -> bool {
        matches!(self.op, Operator::SetContainsAny | Operator::SetDoesNotContainAny)
            && self.selector.last().is_some_and(|s| s == "cohort_ids")
    }

    /// Group type targeted by a cohort filter: `user` for `["context", "user", ...]`, the group
    /// type for `["context", "groups", <type>, ...]`.
    fn cohort_group_type(&self) -> Option<&str> {
        if self.selector.len() <= 2 {
            return None;
        }
        if self.selector[1] == "user" {
            Some(USER_GROUP_TYPE)
        } else if self.selector.iter().any(|s| s == "groups") {
            Some(self.selector[2].as_str())
        } else {
            None
        }
    }
}

impl Flag {
    /// Cohort ids referenced by the flag's cohort filters, by group type.
    pub fn grouped_cohort_ids(&self) -> HashMap<String, BTreeSet<String>> {
        let mut cohort_ids: HashMap<String, BTreeSet<String>> = HashMap::new();
        let conditions = self
            .segments
            .iter()
            .filter_map(|segment| segment.conditions.as_ref())
            .flatten()
            .flatten()
            .filter(|condition| condition.is_cohort_filter());
        for condition in conditions {
            if let Some(group_type) = condition.cohort_group_type() {
                cohort_ids
                    .entry(group_type.to_owned())
                    .or_default()
                    .extend(condition.values.iter().cloned());
            }
        }
        cohort_ids
    }

    pub fn all_cohort_ids(&self) -> BTreeSet<String> {
        self.grouped_cohort_ids().into_values().flatten().collect()
    }
}

/// Cohort ids referenced by any of `flags`, by group type.
pub fn grouped_cohort_ids_from_flags<'a>(
    flags: impl IntoIterator<Item = &'a Flag>,
) -> HashMap<String, BTreeSet<String>> {
    let mut cohort_ids: HashMap<String, BTreeSet<String>> = HashMap::new();
    for flag in flags {
        for (group_type, ids) in flag.grouped_cohort_ids() {
            cohort_ids.entry(group_type).or_default().extend(ids);
        }
    }
    cohort_ids
}

/// Every cohort id referenced by any of `flags`.
pub fn all_cohort_ids_from_flags<'a>(flags: impl IntoIterator<Item = &'a Flag>) -> BTreeSet<String> {
    flags.into_iter().flat_map(Flag::all_cohort_ids).collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeSet;

    use serde_json::json;

    use super::*;

    pub(crate) fn cohort(id: &str, last_modified: i64, group_type: &str, members: &[&str]) -> Cohort {
        Cohort {
            id: id.to_owned(),
            last_modified,
            size: members.len(),
            member_ids: members.iter().map(|m| m.to_string()).collect(),
            group_type: group_type.to_owned(),
        }
    }

    pub(crate) fn cohort_flag(key: &str, user_cohorts: &[&str], group_cohorts: &[(&str, &str)]) -> Flag {
        let mut conditions = vec![];
        if !user_cohorts.is_empty() {
            conditions.push(json!([{
                "selector": ["context", "user", "cohort_ids"],
                "op": "set contains any",
                "values": user_cohorts
            }]));
        }
        for (group_type, cohort_id) in group_cohorts {
            conditions.push(json!([{
                "selector": ["context", "groups", group_type, "cohort_ids"],
                "op": "set contains any",
                "values": [cohort_id]
            }]));
        }
        serde_json::from_value(json!({
            "key": key,
            "segments": [
                {"conditions": conditions, "variant": "on"},
                {"variant": "off"}
            ],
            "variants": {"on": {"key": "on"}, "off": {"key": "off", "metadata": {"default": true}}}
        }))
        .unwrap()
    }

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_cohort_description() {
        let description: CohortDescription = serde_json::from_value(json!({
            "cohortId": "c1",
            "lastModified": 10,
            "size": 2,
            "memberIds": ["a", "b"]
        }))
        .unwrap();
        assert_eq!(Cohort::from(description), cohort("c1", 10, "user", &["a", "b"]));

        let description: CohortDescription = serde_json::from_value(json!({
            "cohortId": "c2",
            "lastModified": 11,
            "size": 0,
            "memberIds": [],
            "groupType": "org"
        }))
        .unwrap();
        assert_eq!(Cohort::from(description).group_type, "org");
    }

    #[test]
    fn extract_grouped_cohort_ids() {
        let flag = cohort_flag("flag", &["u1", "u2"], &[("org", "g1")]);
        let grouped = flag.grouped_cohort_ids();
        assert_eq!(grouped["user"], set(&["u1", "u2"]));
        assert_eq!(grouped["org"], set(&["g1"]));
        assert_eq!(flag.all_cohort_ids(), set(&["g1", "u1", "u2"]));
    }

    #[test]
    fn non_cohort_conditions_are_ignored() {
        let flag: Flag = serde_json::from_value(json!({
            "key": "flag",
            "segments": [{
                "conditions": [
                    [{"selector": ["context", "user", "cohort_ids"], "op": "set contains", "values": ["x"]}],
                    [{"selector": ["context", "user", "device_id"], "op": "set contains any", "values": ["y"]}],
                    [{"selector": ["context", "cohort_ids"], "op": "set contains any", "values": ["z"]}]
                ],
                "variant": "on"
            }],
            "variants": {}
        }))
        .unwrap();
        assert!(flag.grouped_cohort_ids().is_empty());
    }

    #[test]
    fn ids_from_many_flags() {
        let flags = [
            cohort_flag("a", &["u1"], &[]),
            cohort_flag("b", &["u2"], &[("org", "g1")]),
        ];
        let grouped = grouped_cohort_ids_from_flags(&flags);
        assert_eq!(grouped["user"], set(&["u1", "u2"]));
        assert_eq!(all_cohort_ids_from_flags(&flags), set(&["g1", "u1", "u2"]));
    }
}

//! Flag configuration wire model.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Free-form metadata attached to flags, segments, and variants.
pub type Metadata = Map<String, Value>;

/// `TryParse` allows a single flag to fail parsing without failing the parsing of the whole flag
/// list.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TryParse<T> {
    Parsed(T),
    ParseFailed(serde_json::Value),
}

impl<T> From<TryParse<T>> for Option<T> {
    fn from(value: TryParse<T>) -> Self {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flag {
    pub key: String,
    #[serde(default)]
    pub variants: HashMap<String, Variant>,
    #[serde(default)]
    pub segments: Vec<Segment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl Flag {
    /// Value of a string metadata entry, e.g. `flagType` or `deployed`.
    pub fn metadata_value(&self, key: &str) -> Option<&Value> {
        self.metadata.as_ref()?.get(key)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variant {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl Variant {
    fn metadata_bool(&self, key: &str) -> Option<bool> {
        self.metadata.as_ref()?.get(key)?.as_bool()
    }

    /// The variant was served because no targeting rule assigned a real one.
    pub fn is_default_variant(&self) -> bool {
        self.metadata_bool("default").unwrap_or(false)
    }

    /// Flags that are not deployed are still evaluated as dependencies. Missing means deployed.
    pub fn is_deployed(&self) -> bool {
        self.metadata_bool("deployed").unwrap_or(true)
    }

    /// Exposure tracking can be disabled per flag. Missing means tracked.
    pub fn track_exposure(&self) -> bool {
        self.metadata_bool("trackExposure").unwrap_or(true)
    }

    pub fn flag_type(&self) -> Option<&str> {
        self.metadata.as_ref()?.get("flagType")?.as_str()
    }

    /// String form of the variant used in analytics: the key, or else a string value.
    pub(crate) fn label(&self) -> Option<&str> {
        if !self.key.is_empty() {
            return Some(&self.key);
        }
        match &self.value {
            Some(Value::String(value)) if !value.is_empty() => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    /// `None` means the segment is fully rolled out to its default variant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<Bucket>,
    /// Disjunction of conjunctions. `None` always matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Vec<Condition>>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub variant: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    #[serde(default)]
    pub selector: Vec<String>,
    #[serde(default)]
    pub salt: String,
    #[serde(default)]
    pub allocations: Vec<Allocation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(default)]
    pub selector: Vec<String>,
    #[serde(default)]
    pub op: Operator,
    #[serde(default)]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    #[serde(default)]
    pub range: Range,
    #[serde(default)]
    pub distributions: Vec<Distribution>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Distribution {
    #[serde(default)]
    pub variant: String,
    #[serde(default)]
    pub range: Range,
}

/// Half-open `[start, end)` range, encoded as a two-element array on the wire. Empty by default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[u64; 2]", into = "[u64; 2]")]
pub struct Range {
    pub start: u64,
    pub end: u64,
}

impl Range {
    pub fn contains(&self, value: u64) -> bool {
        self.start <= value && value < self.end
    }
}

impl From<[u64; 2]> for Range {
    fn from([start, end]: [u64; 2]) -> Self {
        Range { start, end }
    }
}

impl From<Range> for [u64; 2] {
    fn from(range: Range) -> Self {
        [range.start, range.end]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "is")]
    Is,
    #[serde(rename = "is not")]
    IsNot,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "does not contain")]
    DoesNotContain,
    #[serde(rename = "less")]
    LessThan,
    #[serde(rename = "less or equal")]
    LessThanEquals,
    #[serde(rename = "greater")]
    GreaterThan,
    #[serde(rename = "greater or equal")]
    GreaterThanEquals,
    #[serde(rename = "version less")]
    VersionLessThan,
    #[serde(rename = "version less or equal")]
    VersionLessThanEquals,
    #[serde(rename = "version greater")]
    VersionGreaterThan,
    #[serde(rename = "version greater or equal")]
    VersionGreaterThanEquals,
    #[serde(rename = "set is")]
    SetIs,
    #[serde(rename = "set is not")]
    SetIsNot,
    #[serde(rename = "set contains")]
    SetContains,
    #[serde(rename = "set does not contain")]
    SetDoesNotContain,
    #[serde(rename = "set contains any")]
    SetContainsAny,
    #[serde(rename = "set does not contain any")]
    SetDoesNotContainAny,
    #[serde(rename = "regex match")]
    RegexMatch,
    #[serde(rename = "regex does not match")]
    RegexDoesNotMatch,
    /// Operators added on the server after this version was released, or a missing operator.
    /// Never match.
    #[serde(other)]
    #[default]
    Unknown,
}

impl Operator {
    pub fn is_set_operator(self) -> bool {
        matches!(
            self,
            Operator::SetIs
                | Operator::SetIsNot
                | Operator::SetContains
                | Operator::SetDoesNotContain
                | Operator::SetContainsAny
                | Operator::SetDoesNotContainAny
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_flag() {
        let flag: Flag = serde_json::from_str(
            r#"{
                "key": "flag",
                "metadata": {"deployed": true, "flagType": "experiment"},
                "segments": [
                    {
                        "conditions": [[{"selector": ["context", "user", "device_id"], "op": "is", "values": ["1"]}]],
                        "bucket": {
                            "selector": ["context", "user", "device_id"],
                            "salt": "abc",
                            "allocations": [{"range": [0, 100], "distributions": [{"variant": "on", "range": [0, 42949673]}]}]
                        },
                        "variant": "off"
                    },
                    {"variant": "off"}
                ],
                "variants": {"on": {"key": "on", "value": "on"}, "off": {"key": "off", "metadata": {"default": true}}}
            }"#,
        )
        .unwrap();

        assert_eq!(flag.segments.len(), 2);
        assert!(flag.segments[1].conditions.is_none());
        assert!(flag.segments[1].bucket.is_none());
        let bucket = flag.segments[0].bucket.as_ref().unwrap();
        assert_eq!(bucket.allocations[0].range, Range { start: 0, end: 100 });
        assert!(flag.variants["off"].is_default_variant());
        assert!(!flag.variants["on"].is_default_variant());
        assert_eq!(
            flag.metadata_value("flagType").and_then(Value::as_str),
            Some("experiment")
        );
    }

    #[test]
    fn unknown_operator_parses() {
        let condition: Condition =
            serde_json::from_str(r#"{"selector": ["context"], "op": "sounds like", "values": []}"#)
                .unwrap();
        assert_eq!(condition.op, Operator::Unknown);
    }

    #[test]
    fn missing_fields_get_defaults() {
        let condition: Condition = serde_json::from_str(r#"{"selector": ["context"]}"#).unwrap();
        assert_eq!(condition.op, Operator::Unknown);
        assert!(condition.values.is_empty());

        let allocation: Allocation = serde_json::from_str(r#"{"distributions": [{}]}"#).unwrap();
        assert_eq!(allocation.range, Range::default());
        assert!(!allocation.range.contains(0));
        assert_eq!(allocation.distributions[0].variant, "");
        assert_eq!(allocation.distributions[0].range, Range::default());
    }

    #[test]
    fn range_is_half_open() {
        let range = Range::from([10, 20]);
        assert!(!range.contains(9));
        assert!(range.contains(10));
        assert!(range.contains(19));
        assert!(!range.contains(20));
    }

    #[test]
    fn variant_defaults() {
        let variant = Variant::default();
        assert!(variant.is_deployed());
        assert!(variant.track_exposure());
        assert!(!variant.is_default_variant());
        assert_eq!(variant.label(), None);
    }
}

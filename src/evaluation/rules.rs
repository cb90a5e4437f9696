use std::collections::HashSet;

use regex::Regex;
use serde_json::Value;

use super::{
    models::{Condition, Operator},
    select::{coerce_string, coerce_string_list, Target},
    version::Version,
};

/// Filter value that matches a missing property.
const NONE_VALUE: &str = "(none)";

impl Condition {
    pub(crate) fn eval(&self, target: &Target) -> bool {
        let value = target.select(&self.selector);
        let matched = self.op.eval(value.as_deref(), &self.values);
        log::trace!(target: "experiment", selector:? = self.selector, op:? = self.op, matched; "condition evaluated");
        matched
    }
}

impl Operator {
    /// Apply the operator to a selected value. Any single filter value satisfying the operator
    /// is a match. Returns `false` if the value cannot be coerced for the operator.
    pub fn eval(self, value: Option<&Value>, filter_values: &[String]) -> bool {
        let Some(value) = value else {
            return self.eval_missing(filter_values);
        };
        if self.is_set_operator() {
            match coerce_string_list(value) {
                Some(values) => self.eval_set(&values, filter_values),
                None => false,
            }
        } else {
            match coerce_string(value) {
                Some(value) => self.eval_string(&value, filter_values),
                None => false,
            }
        }
    }

    fn eval_missing(self, filter_values: &[String]) -> bool {
        let contains_none = filter_values.iter().any(|v| v == NONE_VALUE);
        match self {
            Self::Is
            | Self::Contains
            | Self::LessThan
            | Self::LessThanEquals
            | Self::GreaterThan
            | Self::GreaterThanEquals
            | Self::VersionLessThan
            | Self::VersionLessThanEquals
            | Self::VersionGreaterThan
            | Self::VersionGreaterThanEquals
            | Self::SetIs
            | Self::SetContains
            | Self::SetContainsAny => contains_none,
            Self::IsNot | Self::DoesNotContain | Self::SetDoesNotContain | Self::SetDoesNotContainAny => {
                !contains_none
            }
            Self::RegexMatch => false,
            Self::RegexDoesNotMatch | Self::SetIsNot => true,
            Self::Unknown => false,
        }
    }

    fn eval_set(self, values: &[String], filter_values: &[String]) -> bool {
        match self {
            Self::SetIs => set_equals(values, filter_values),
            Self::SetIsNot => !set_equals(values, filter_values),
            Self::SetContains => contains_all(values, filter_values),
            Self::SetDoesNotContain => !contains_all(values, filter_values),
            Self::SetContainsAny => contains_any(values, filter_values),
            Self::SetDoesNotContainAny => !contains_any(values, filter_values),
            _ => false,
        }
    }

    fn eval_string(self, value: &str, filter_values: &[String]) -> bool {
        match self {
            Self::Is => matches_is(value, filter_values),
            Self::IsNot => !matches_is(value, filter_values),
            Self::Contains => matches_contains(value, filter_values),
            Self::DoesNotContain => !matches_contains(value, filter_values),
            Self::LessThan | Self::LessThanEquals | Self::GreaterThan | Self::GreaterThanEquals => {
                self.compare(value, filter_values)
            }
            Self::VersionLessThan
            | Self::VersionLessThanEquals
            | Self::VersionGreaterThan
            | Self::VersionGreaterThanEquals => self.compare_versions(value, filter_values),
            Self::RegexMatch => matches_regex(value, filter_values),
            Self::RegexDoesNotMatch => !matches_regex(value, filter_values),
            _ => false,
        }
    }

    /// Numeric comparison when the value and at least one filter value parse as numbers,
    /// lexical comparison otherwise.
    fn compare(self, value: &str, filter_values: &[String]) -> bool {
        if let Ok(value) = value.parse::<f64>() {
            let numbers: Vec<f64> = filter_values
                .iter()
                .filter_map(|v| v.parse::<f64>().ok())
                .collect();
            if !numbers.is_empty() {
                return numbers.iter().any(|n| self.holds(value.partial_cmp(n)));
            }
        }
        self.compare_strings(value, filter_values)
    }

    fn compare_versions(self, value: &str, filter_values: &[String]) -> bool {
        let Some(version) = Version::parse(value) else {
            return self.compare_strings(value, filter_values);
        };
        let versions: Vec<Version> = filter_values
            .iter()
            .filter_map(|v| Version::parse(v))
            .collect();
        if versions.is_empty() {
            return self.compare_strings(value, filter_values);
        }
        versions.iter().any(|v| self.holds(Some(version.cmp(v))))
    }

    fn compare_strings(self, value: &str, filter_values: &[String]) -> bool {
        filter_values
            .iter()
            .any(|v| self.holds(Some(value.cmp(v.as_str()))))
    }

    /// Whether `value <op> filter` holds given `value.cmp(filter)`.
    fn holds(self, ordering: Option<std::cmp::Ordering>) -> bool {
        let Some(ordering) = ordering else {
            return false;
        };
        match self {
            Self::LessThan | Self::VersionLessThan => ordering.is_lt(),
            Self::LessThanEquals | Self::VersionLessThanEquals => ordering.is_le(),
            Self::GreaterThan | Self::VersionGreaterThan => ordering.is_gt(),
            Self::GreaterThanEquals | Self::VersionGreaterThanEquals => ordering.is_ge(),
            _ => false,
        }
    }
}

fn is_boolean(s: &str) -> bool {
    s.eq_ignore_ascii_case("true") || s.eq_ignore_ascii_case("false")
}

fn matches_is(value: &str, filter_values: &[String]) -> bool {
    // Booleans compare case-insensitively, so "True" is "true".
    if is_boolean(value) && filter_values.iter().any(|v| is_boolean(v)) {
        if filter_values.iter().any(|v| v.eq_ignore_ascii_case(value)) {
            return true;
        }
    }
    filter_values.iter().any(|v| v == value)
}

fn matches_contains(value: &str, filter_values: &[String]) -> bool {
    let value = value.to_lowercase();
    filter_values
        .iter()
        .any(|v| value.contains(&v.to_lowercase()))
}

fn matches_regex(value: &str, filter_values: &[String]) -> bool {
    filter_values
        .iter()
        .any(|pattern| Regex::new(pattern).is_ok_and(|regex| regex.is_match(value)))
}

fn set_equals(values: &[String], filter_values: &[String]) -> bool {
    let values: HashSet<&str> = values.iter().map(String::as_str).collect();
    let filter_values: HashSet<&str> = filter_values.iter().map(String::as_str).collect();
    values == filter_values
}

fn contains_all(values: &[String], filter_values: &[String]) -> bool {
    filter_values.iter().all(|v| matches_is(v, values))
}

fn contains_any(values: &[String], filter_values: &[String]) -> bool {
    filter_values.iter().any(|v| matches_is(v, values))
}

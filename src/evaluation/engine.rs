use std::{collections::HashMap, sync::Arc};

use serde_json::Value;

use crate::sharder::{Murmur3Sharder, Sharder};

use super::{
    models::{Flag, Metadata, Segment, Variant},
    select::{coerce_string, Target},
};

/// Evaluate `flags` in order against `context`.
///
/// Results of earlier flags are visible to later ones through `["result", <flag key>, ...]`
/// selectors, so `flags` should be topologically sorted. Flags that match no segment are absent
/// from the result.
pub fn evaluate(context: &Value, flags: &[Arc<Flag>]) -> HashMap<String, Variant> {
    evaluate_with_sharder(context, flags, &Murmur3Sharder)
}

pub(crate) fn evaluate_with_sharder(
    context: &Value,
    flags: &[Arc<Flag>],
    sharder: &impl Sharder,
) -> HashMap<String, Variant> {
    let mut results = HashMap::with_capacity(flags.len());
    for flag in flags {
        let target = Target {
            context,
            results: &results,
        };
        match flag.eval(&target, sharder) {
            Some(variant) => {
                log::trace!(target: "experiment", flag_key = flag.key, variant_key = variant.key; "evaluated flag");
                results.insert(flag.key.clone(), variant);
            }
            None => {
                log::trace!(target: "experiment", flag_key = flag.key; "flag evaluation returned no variant");
            }
        }
    }
    results
}

impl Flag {
    fn eval(&self, target: &Target, sharder: &impl Sharder) -> Option<Variant> {
        self.segments.iter().find_map(|segment| {
            let variant = segment.eval(self, target, sharder)?;
            let metadata = merge_metadata([
                self.metadata.as_ref(),
                segment.metadata.as_ref(),
                variant.metadata.as_ref(),
            ]);
            Some(Variant {
                metadata,
                ..variant.clone()
            })
        })
    }
}

impl Segment {
    /// Returns the variant this segment assigns, or `None` if conditions don't match or the
    /// bucketed variant key is not one of the flag's variants.
    fn eval<'a>(&self, flag: &'a Flag, target: &Target, sharder: &impl Sharder) -> Option<&'a Variant> {
        if let Some(conditions) = &self.conditions {
            // Outer list is "or", inner list is "and".
            let matched = conditions
                .iter()
                .any(|and| and.iter().all(|condition| condition.eval(target)));
            if !matched {
                return None;
            }
        }
        flag.variants.get(self.bucket(target, sharder))
    }

    fn bucket(&self, target: &Target, sharder: &impl Sharder) -> &str {
        // No bucket means the segment is fully rolled out.
        let Some(bucket) = &self.bucket else {
            return &self.variant;
        };
        let bucketing_value = target
            .select(&bucket.selector)
            .and_then(|value| coerce_string(&value));
        let Some(bucketing_value) = bucketing_value.filter(|v| !v.is_empty()) else {
            return &self.variant;
        };

        let hash = sharder.get_hash(format!("{}/{}", bucket.salt, bucketing_value));
        let allocation_value = hash % 100;
        let distribution_value = hash / 100;

        bucket
            .allocations
            .iter()
            .filter(|allocation| allocation.range.contains(allocation_value))
            .flat_map(|allocation| &allocation.distributions)
            .find(|distribution| distribution.range.contains(distribution_value))
            .map_or(&self.variant, |distribution| &distribution.variant)
    }
}

fn merge_metadata<const N: usize>(metadata: [Option<&Metadata>; N]) -> Option<Metadata> {
    let mut merged = Metadata::new();
    for m in metadata.into_iter().flatten() {
        merged.extend(m.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    (!merged.is_empty()).then_some(merged)
}

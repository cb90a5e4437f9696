use derive_more::{From, Into};
use serde_json::{json, Map, Value};

use crate::User;

/// Read-only tree conditions select from, rooted at `{"user": ..., "groups": ...}`.
#[derive(Debug, Clone, PartialEq, From, Into)]
pub struct EvaluationContext(Value);

impl EvaluationContext {
    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

impl From<&User> for EvaluationContext {
    fn from(user: &User) -> Self {
        let mut user_map = Map::new();
        let fields = [
            ("user_id", &user.user_id),
            ("device_id", &user.device_id),
            ("country", &user.country),
            ("region", &user.region),
            ("dma", &user.dma),
            ("city", &user.city),
            ("language", &user.language),
            ("platform", &user.platform),
            ("version", &user.version),
            ("os", &user.os),
            ("device_manufacturer", &user.device_manufacturer),
            ("device_brand", &user.device_brand),
            ("device_model", &user.device_model),
            ("carrier", &user.carrier),
            ("library", &user.library),
        ];
        for (key, value) in fields {
            if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
                user_map.insert(key.to_owned(), Value::from(value));
            }
        }
        if !user.user_properties.is_empty() {
            user_map.insert(
                "user_properties".to_owned(),
                Value::Object(user.user_properties.clone()),
            );
        }
        if !user.cohort_ids.is_empty() {
            user_map.insert("cohort_ids".to_owned(), json!(user.cohort_ids));
        }

        let mut context = Map::new();
        context.insert("user".to_owned(), Value::Object(user_map));

        let mut groups = Map::new();
        for (group_type, group_names) in &user.groups {
            let Some(group_name) = group_names.first() else {
                continue;
            };
            let mut group = Map::new();
            group.insert("group_name".to_owned(), Value::from(group_name.as_str()));
            if let Some(properties) = user
                .group_properties
                .get(group_type)
                .and_then(|names| names.get(group_name))
                .filter(|properties| !properties.is_empty())
            {
                group.insert(
                    "group_properties".to_owned(),
                    Value::Object(properties.clone()),
                );
            }
            if let Some(cohort_ids) = user
                .group_cohort_ids
                .get(group_type)
                .and_then(|names| names.get(group_name))
                .filter(|ids| !ids.is_empty())
            {
                group.insert("cohort_ids".to_owned(), json!(cohort_ids));
            }
            groups.insert(group_type.clone(), Value::Object(group));
        }
        if !groups.is_empty() {
            context.insert("groups".to_owned(), Value::Object(groups));
        }

        EvaluationContext(Value::Object(context))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::EvaluationContext;
    use crate::User;

    #[test]
    fn empty_fields_are_omitted() {
        let user = User {
            device_id: Some(String::new()),
            country: Some("US".to_owned()),
            ..User::from_user_id("user")
        };
        let context = EvaluationContext::from(&user);
        assert_eq!(
            context.as_value(),
            &json!({"user": {"user_id": "user", "country": "US"}})
        );
    }

    #[test]
    fn cohorts_and_groups() {
        let mut user = User::from_user_id("user");
        user.user_properties
            .insert("plan".to_owned(), json!("pro"));
        user.cohort_ids.insert("b".to_owned());
        user.cohort_ids.insert("a".to_owned());
        user.groups = HashMap::from([(
            "org".to_owned(),
            vec!["acme".to_owned(), "ignored".to_owned()],
        )]);
        user.group_properties = HashMap::from([(
            "org".to_owned(),
            HashMap::from([(
                "acme".to_owned(),
                json!({"tier": "enterprise"}).as_object().unwrap().clone(),
            )]),
        )]);
        user.add_group_cohort_ids("org", "acme", ["c".to_owned()]);

        let context = EvaluationContext::from(&user);
        assert_eq!(
            context.as_value(),
            &json!({
                "user": {"user_id": "user", "user_properties": {"plan": "pro"}, "cohort_ids": ["a", "b"]},
                "groups": {"org": {"group_name": "acme", "group_properties": {"tier": "enterprise"}, "cohort_ids": ["c"]}}
            })
        );
    }
}

use std::{collections::HashMap, sync::Arc};

use crate::{
    assignment::{Assignment, AssignmentFilter, AssignmentService},
    cohort::grouped_cohort_ids_from_flags,
    cohort::USER_GROUP_TYPE,
    cohort_download_api::{CohortDownloadApi, DirectCohortDownloadApi},
    cohort_loader::CohortLoader,
    cohort_storage::CohortStorage,
    deployment_runner::DeploymentRunner,
    evaluation::{evaluate, models::Metadata, EvaluationContext, Flag, Variant},
    exposure::{Exposure, ExposureFilter, ExposureService},
    flag_config_api::{FlagConfigApi, FlagConfigApiV2},
    flag_config_storage::{FlagConfigStorage, FlagConfigs},
    stream::{FlagStream, SseStream},
    topological_sort::topological_sort,
    Config, Error, Result, User,
};

/// Options for [`Client::evaluate_with_options`].
#[derive(Debug, Clone, Default)]
pub struct EvaluateOptions {
    /// Flags to evaluate, together with their dependencies. Empty evaluates every flag.
    pub flag_keys: Vec<String>,
    /// Track an exposure event for each evaluated flag. Requires
    /// [`Config::exposure_config`].
    pub tracks_exposure: bool,
}

/// Evaluates flags locally against flag configs kept in sync with the server.
///
/// Call [`Client::start`] before evaluating. Until then every flag evaluates as missing.
///
/// # Examples
/// ```no_run
/// # use experiment_local::{Client, Config, User};
/// let client = Client::new("deployment-key", Config::new()).unwrap();
/// client.start().unwrap();
/// let variants = client.evaluate_v2(&User::from_user_id("user"), &["my-flag"]).unwrap();
/// ```
pub struct Client {
    flag_config_storage: Arc<FlagConfigStorage>,
    cohort_storage: Arc<CohortStorage>,
    /// Present when cohort sync is configured.
    cohort_loader: Option<Arc<CohortLoader>>,
    deployment_runner: DeploymentRunner,
    assignment_service: Option<AssignmentService>,
    exposure_service: Option<ExposureService>,
}

impl Client {
    /// Create a client for the deployment `api_key`. Unset `config` values get defaults.
    ///
    /// No network requests are made until [`Client::start`].
    ///
    /// # Errors
    ///
    /// - [`Error::MissingApiKey`] if `api_key` is empty.
    /// - [`Error::InvalidServerUrl`] if a configured server url does not parse.
    pub fn new(api_key: impl Into<String>, config: Config) -> Result<Client> {
        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(Error::MissingApiKey);
        }
        let config = config.fill_defaults();
        log::debug!(target: "experiment", config:? = config; "creating client");

        let flag_config_api = Arc::new(FlagConfigApiV2::new(
            &api_key,
            config.server_url(),
            config.flag_config_poller_request_timeout,
        )?);
        let flag_stream: Option<Arc<dyn FlagStream>> = if config.stream_updates {
            Some(Arc::new(SseStream::new(
                &api_key,
                config.stream_server_url(),
                config.stream_flag_conn_timeout,
            )?))
        } else {
            None
        };
        let cohort_download_api: Option<Arc<dyn CohortDownloadApi>> =
            match (&config.cohort_sync_config, config.cohort_server_url()) {
                (Some(cohort_sync_config), Some(cohort_server_url)) => {
                    Some(Arc::new(DirectCohortDownloadApi::new(
                        &cohort_sync_config.api_key,
                        &cohort_sync_config.secret_key,
                        cohort_sync_config.max_cohort_size,
                        cohort_server_url,
                        cohort_sync_config.cohort_request_timeout,
                    )?))
                }
                _ => None,
            };

        Ok(Client::from_parts(
            &config,
            flag_config_api,
            flag_stream,
            cohort_download_api,
        ))
    }

    pub(crate) fn from_parts(
        config: &Config,
        flag_config_api: Arc<dyn FlagConfigApi>,
        flag_stream: Option<Arc<dyn FlagStream>>,
        cohort_download_api: Option<Arc<dyn CohortDownloadApi>>,
    ) -> Client {
        let flag_config_storage = Arc::new(FlagConfigStorage::new());
        let cohort_storage = Arc::new(CohortStorage::new());
        let cohort_loader = cohort_download_api
            .map(|api| Arc::new(CohortLoader::new(api, Arc::clone(&cohort_storage))));
        let deployment_runner = DeploymentRunner::new(
            config,
            flag_config_api,
            flag_stream,
            Arc::clone(&flag_config_storage),
            Arc::clone(&cohort_storage),
            cohort_loader.clone(),
        );
        let assignment_service = config.assignment_config.as_ref().map(|assignment_config| {
            AssignmentService::new(
                Arc::clone(&assignment_config.tracker),
                AssignmentFilter::new(assignment_config.cache_capacity),
            )
        });
        let exposure_service = config.exposure_config.as_ref().map(|exposure_config| {
            ExposureService::new(
                Arc::clone(&exposure_config.tracker),
                ExposureFilter::new(exposure_config.cache_capacity),
            )
        });

        Client {
            flag_config_storage,
            cohort_storage,
            cohort_loader,
            deployment_runner,
            assignment_service,
            exposure_service,
        }
    }

    /// Load flag configs (and the cohorts they target), blocking until the first flag set is
    /// stored, then keep them updated in the background.
    pub fn start(&self) -> Result<()> {
        self.deployment_runner.start()
    }

    /// Stop background updates. Evaluation keeps working on the last stored flags.
    pub fn stop(&self) {
        self.deployment_runner.stop();
    }

    /// Evaluate `flag_keys` (and their dependencies) for `user`. Empty `flag_keys` evaluates
    /// every flag.
    ///
    /// The result includes default and undeployed variants. Use [`Variant::is_default_variant`]
    /// and [`Variant::is_deployed`] to tell them apart.
    ///
    /// # Errors
    ///
    /// [`Error::DependencyCycle`] if flag dependencies form a cycle.
    pub fn evaluate_v2<S: AsRef<str>>(
        &self,
        user: &User,
        flag_keys: &[S],
    ) -> Result<HashMap<String, Variant>> {
        self.evaluate_flags(user, flag_keys, false)
    }

    /// Like [`Client::evaluate_v2`], optionally tracking exposures.
    pub fn evaluate_with_options(
        &self,
        user: &User,
        options: &EvaluateOptions,
    ) -> Result<HashMap<String, Variant>> {
        self.evaluate_flags(user, &options.flag_keys, options.tracks_exposure)
    }

    /// Evaluate `flag_keys` for `user`, keeping only variants actually served: default and
    /// undeployed variants are dropped.
    #[deprecated(note = "use `evaluate_v2`, which also returns default variants")]
    pub fn evaluate<S: AsRef<str>>(
        &self,
        user: &User,
        flag_keys: &[S],
    ) -> Result<HashMap<String, Variant>> {
        let mut variants = self.evaluate_v2(user, flag_keys)?;
        variants.retain(|_, variant| !variant.is_default_variant() && variant.is_deployed());
        Ok(variants)
    }

    /// Current flag configs.
    pub fn flag_configs(&self) -> Arc<FlagConfigs> {
        self.flag_config_storage.get_flag_configs()
    }

    /// Metadata of flag `flag_key`, if the flag exists and has any.
    pub fn flag_metadata(&self, flag_key: &str) -> Option<Metadata> {
        self.flag_config_storage.get_flag_config(flag_key)?.metadata.clone()
    }

    fn evaluate_flags<S: AsRef<str>>(
        &self,
        user: &User,
        flag_keys: &[S],
        tracks_exposure: bool,
    ) -> Result<HashMap<String, Variant>> {
        let flag_configs = self.flag_config_storage.get_flag_configs();
        let flags = match topological_sort(&flag_configs, flag_keys) {
            Ok(flags) => flags,
            Err(err) => {
                log::warn!(target: "experiment", "cannot evaluate flags: {err}");
                return Err(err);
            }
        };

        let enriched = self.enrich_user(user, &flags);
        let context = EvaluationContext::from(enriched.as_ref().unwrap_or(user));
        let variants = evaluate(context.as_value(), &flags);
        log::trace!(target: "experiment",
            user_id = user.user_id(),
            device_id = user.device_id(),
            flags = flags.len(),
            results = variants.len();
            "evaluated flags");

        if let Some(assignment_service) = &self.assignment_service {
            assignment_service.track(&Assignment::new(user.clone(), variants.clone()));
        }
        if tracks_exposure {
            match &self.exposure_service {
                Some(exposure_service) => {
                    exposure_service.track(&Exposure::new(user.clone(), variants.clone()))
                }
                None => {
                    log::debug!(target: "experiment", "exposure tracking requested without exposure config")
                }
            }
        }
        Ok(variants)
    }

    /// Copy of `user` with the cohorts it belongs to, among those targeted by `flags`. `None`
    /// when cohort sync is off or `flags` target no cohorts.
    fn enrich_user(&self, user: &User, flags: &[Arc<Flag>]) -> Option<User> {
        self.cohort_loader.as_ref()?;
        let grouped_cohort_ids = grouped_cohort_ids_from_flags(flags.iter().map(|flag| &**flag));
        if grouped_cohort_ids.is_empty() {
            return None;
        }

        let mut enriched = user.clone();
        if !user.user_id().is_empty() {
            if let Some(cohort_ids) = grouped_cohort_ids.get(USER_GROUP_TYPE) {
                enriched.cohort_ids = self
                    .cohort_storage
                    .get_cohorts_for_user(user.user_id(), cohort_ids);
            }
        }
        for (group_type, group_names) in &user.groups {
            let (Some(group_name), Some(cohort_ids)) =
                (group_names.first(), grouped_cohort_ids.get(group_type))
            else {
                continue;
            };
            let member_of = self
                .cohort_storage
                .get_cohorts_for_group(group_type, group_name, cohort_ids);
            enriched.add_group_cohort_ids(group_type, group_name, member_of);
        }
        Some(enriched)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::{
        cohort::tests::{cohort, cohort_flag},
        cohort_loader::tests::MockCohortDownloadApi,
        config::{AssignmentConfig, CohortSyncConfig, ExposureConfig},
        flag_config_api::tests::{flag_configs, MockFlagConfigApi},
        tracker::AnalyticsEvent,
    };

    fn flag(value: serde_json::Value) -> Flag {
        serde_json::from_value(value).unwrap()
    }

    fn rollout_flag(key: &str) -> Flag {
        flag(json!({
            "key": key,
            "variants": {"on": {"key": "on", "value": "on"}},
            "segments": [{"variant": "on"}]
        }))
    }

    fn client(config: Config, flags: Vec<Flag>) -> Client {
        let api = Arc::new(MockFlagConfigApi::new(vec![Ok(flag_configs(flags))]));
        let client = Client::from_parts(&config.fill_defaults(), api, None, None);
        client.start().unwrap();
        client
    }

    fn recorder() -> (Arc<Mutex<Vec<AnalyticsEvent>>>, impl Fn(AnalyticsEvent) + Send + Sync) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        (events, move |event: AnalyticsEvent| sink.lock().unwrap().push(event))
    }

    #[test]
    fn empty_api_key_is_rejected() {
        assert!(matches!(
            Client::new("", Config::new()),
            Err(Error::MissingApiKey)
        ));
    }

    #[test]
    fn invalid_server_url_is_rejected() {
        assert!(matches!(
            Client::new("key", Config::new().with_server_url("not a url")),
            Err(Error::InvalidServerUrl(_))
        ));
    }

    #[test]
    fn evaluates_stored_flags() {
        let client = client(Config::new(), vec![rollout_flag("a"), rollout_flag("b")]);

        let variants = client.evaluate_v2(&User::from_user_id("u"), &["a"]).unwrap();
        assert_eq!(variants.len(), 1);
        assert_eq!(variants["a"].key, "on");

        let all = client.evaluate_v2::<&str>(&User::default(), &[]).unwrap();
        assert_eq!(all.len(), 2);
        client.stop();
    }

    #[test]
    fn targets_user_properties() {
        let client = client(
            Config::new(),
            vec![flag(json!({
                "key": "plan-flag",
                "variants": {"on": {"key": "on"}, "off": {"key": "off", "metadata": {"default": true}}},
                "segments": [
                    {
                        "conditions": [[{
                            "selector": ["context", "user", "user_properties", "plan"],
                            "op": "is",
                            "values": ["pro"]
                        }]],
                        "variant": "on"
                    },
                    {"variant": "off"}
                ]
            }))],
        );

        let mut user = User::from_user_id("u");
        user.user_properties.insert("plan".to_owned(), json!("pro"));
        assert_eq!(client.evaluate_v2(&user, &["plan-flag"]).unwrap()["plan-flag"].key, "on");

        user.user_properties.insert("plan".to_owned(), json!("free"));
        assert_eq!(client.evaluate_v2(&user, &["plan-flag"]).unwrap()["plan-flag"].key, "off");
    }

    #[test]
    #[allow(deprecated)]
    fn legacy_evaluate_drops_default_and_undeployed_variants() {
        let client = client(
            Config::new(),
            vec![
                rollout_flag("served"),
                cohort_flag("defaulted", &["c1"], &[]),
                flag(json!({
                    "key": "undeployed",
                    "variants": {"on": {"key": "on", "metadata": {"deployed": false}}},
                    "segments": [{"variant": "on"}]
                })),
            ],
        );

        let variants = client.evaluate::<&str>(&User::from_user_id("u"), &[]).unwrap();
        assert_eq!(variants.keys().collect::<Vec<_>>(), vec!["served"]);
        assert_eq!(client.evaluate_v2::<&str>(&User::from_user_id("u"), &[]).unwrap().len(), 3);
    }

    #[test]
    fn dependency_cycle_fails_evaluation() {
        let client = client(
            Config::new(),
            vec![
                flag(json!({"key": "a", "dependencies": ["b"], "variants": {}, "segments": []})),
                flag(json!({"key": "b", "dependencies": ["a"], "variants": {}, "segments": []})),
            ],
        );

        assert!(matches!(
            client.evaluate_v2(&User::default(), &["a"]),
            Err(Error::DependencyCycle(_))
        ));
    }

    #[test]
    fn cohort_membership_targets_users_and_groups() {
        let cohort_api = Arc::new(MockCohortDownloadApi::default());
        cohort_api.respond("c1", Ok(Some(cohort("c1", 1, "user", &["u1"]))));
        cohort_api.respond("c2", Ok(Some(cohort("c2", 1, "org", &["acme"]))));
        let api = Arc::new(MockFlagConfigApi::new(vec![Ok(flag_configs([
            cohort_flag("user-flag", &["c1"], &[]),
            cohort_flag("org-flag", &[], &[("org", "c2")]),
        ]))]));
        let config = Config::new().with_cohort_sync_config(CohortSyncConfig::new("key", "secret"));
        let client = Client::from_parts(&config, api, None, Some(cohort_api));
        client.start().unwrap();

        let member = client.evaluate_v2(&User::from_user_id("u1"), &["user-flag"]).unwrap();
        assert_eq!(member["user-flag"].key, "on");
        let other = client.evaluate_v2(&User::from_user_id("u2"), &["user-flag"]).unwrap();
        assert_eq!(other["user-flag"].key, "off");

        let mut user = User::from_device_id("d");
        user.groups.insert("org".to_owned(), vec!["acme".to_owned()]);
        assert_eq!(client.evaluate_v2(&user, &["org-flag"]).unwrap()["org-flag"].key, "on");
        user.groups.insert("org".to_owned(), vec!["globex".to_owned()]);
        assert_eq!(client.evaluate_v2(&user, &["org-flag"]).unwrap()["org-flag"].key, "off");
        client.stop();
    }

    #[test]
    fn tracks_assignments_once_per_result() {
        let (events, tracker) = recorder();
        let client = client(
            Config::new().with_assignment_config(AssignmentConfig::new(tracker)),
            vec![rollout_flag("a")],
        );
        let user = User::from_user_id("u");

        client.evaluate_v2(&user, &["a"]).unwrap();
        client.evaluate_v2(&user, &["a"]).unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "[Experiment] assignment");
        assert_eq!(events[0].user_id.as_deref(), Some("u"));
    }

    #[test]
    fn tracks_exposures_only_when_asked() {
        let (events, tracker) = recorder();
        let client = client(
            Config::new().with_exposure_config(ExposureConfig::new(tracker)),
            vec![rollout_flag("a")],
        );
        let user = User::from_user_id("u");

        client
            .evaluate_with_options(&user, &EvaluateOptions { flag_keys: vec!["a".to_owned()], tracks_exposure: false })
            .unwrap();
        assert!(events.lock().unwrap().is_empty());

        client
            .evaluate_with_options(&user, &EvaluateOptions { flag_keys: vec!["a".to_owned()], tracks_exposure: true })
            .unwrap();
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "[Experiment] Exposure");
    }

    #[test]
    fn exposes_flag_configs_and_metadata() {
        let client = client(
            Config::new(),
            vec![flag(json!({
                "key": "a",
                "metadata": {"flagType": "experiment"},
                "variants": {},
                "segments": []
            }))],
        );

        assert!(client.flag_configs().contains_key("a"));
        assert_eq!(
            client.flag_metadata("a").unwrap().get("flagType"),
            Some(&json!("experiment"))
        );
        assert!(client.flag_metadata("missing").is_none());
    }
}

use std::{
    ops::ControlFlow,
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::{
    cohort_loader::CohortLoader,
    cohort_storage::CohortStorage,
    config::{CohortSyncConfig, Config},
    flag_config_api::FlagConfigApi,
    flag_config_storage::FlagConfigStorage,
    flag_config_stream_api::FlagConfigStreamApiV2,
    flag_config_updater::{
        FlagConfigFallbackRetryWrapper, FlagConfigPoller, FlagConfigStreamer, FlagConfigUpdater,
        FlagConfigUpdaterBase,
    },
    poller::Poller,
    stream::FlagStream,
    Result,
};

const STREAM_RETRY_DELAY: Duration = Duration::from_secs(15);
const RETRY_JITTER: Duration = Duration::from_secs(1);

/// Owns everything that keeps flags and cohorts fresh in the background.
pub struct DeploymentRunner {
    updater: FlagConfigFallbackRetryWrapper,
    cohort_loader: Option<Arc<CohortLoader>>,
    cohort_polling_interval: Duration,
    cohort_poller: Mutex<Option<Poller>>,
}

impl DeploymentRunner {
    /// With `flag_stream`, flags are streamed and polled only while the stream is down.
    /// Otherwise they are polled.
    pub fn new(
        config: &Config,
        flag_config_api: Arc<dyn FlagConfigApi>,
        flag_stream: Option<Arc<dyn FlagStream>>,
        flag_config_storage: Arc<FlagConfigStorage>,
        cohort_storage: Arc<CohortStorage>,
        cohort_loader: Option<Arc<CohortLoader>>,
    ) -> DeploymentRunner {
        let base = FlagConfigUpdaterBase::new(flag_config_storage, cohort_storage, cohort_loader.clone());
        let poller: Arc<dyn FlagConfigUpdater> = Arc::new(FlagConfigPoller::new(
            base.clone(),
            flag_config_api,
            config.flag_config_poller_interval,
        ));

        let updater = match flag_stream {
            Some(flag_stream) => {
                let streamer = FlagConfigStreamer::new(
                    base,
                    FlagConfigStreamApiV2::new(flag_stream, config.stream_flag_conn_timeout),
                );
                FlagConfigFallbackRetryWrapper::new(
                    Arc::new(streamer),
                    Some(poller),
                    STREAM_RETRY_DELAY,
                    RETRY_JITTER,
                )
            }
            None => FlagConfigFallbackRetryWrapper::new(
                poller,
                None,
                config.flag_config_poller_interval,
                RETRY_JITTER.min(config.flag_config_poller_interval / 2),
            ),
        };

        let cohort_polling_interval = config
            .cohort_sync_config
            .as_ref()
            .map(|cohort_sync_config| cohort_sync_config.cohort_polling_interval)
            .unwrap_or(CohortSyncConfig::DEFAULT_COHORT_POLLING_INTERVAL);

        DeploymentRunner {
            updater,
            cohort_loader,
            cohort_polling_interval,
            cohort_poller: Mutex::new(None),
        }
    }

    /// Load flags, blocking until the first flag set is stored, then keep flags and cohorts
    /// updated.
    pub fn start(&self) -> Result<()> {
        let mut cohort_poller = self
            .cohort_poller
            .lock()
            .expect("thread holding cohort poller lock should not panic");

        self.updater.start(None)?;

        if let (Some(cohort_loader), None) = (&self.cohort_loader, &*cohort_poller) {
            let cohort_loader = Arc::clone(cohort_loader);
            *cohort_poller = Some(Poller::start(
                "experiment-cohort-poller",
                self.cohort_polling_interval,
                Duration::ZERO,
                move || {
                    if let Err(err) = cohort_loader.update_stored_cohorts() {
                        log::warn!(target: "experiment", "failed to refresh stored cohorts: {err}");
                    }
                    ControlFlow::Continue(())
                },
            )?);
        }
        log::debug!(target: "experiment", "deployment runner started");
        Ok(())
    }

    /// Stop all background updates. Idempotent.
    pub fn stop(&self) {
        let cohort_poller = self
            .cohort_poller
            .lock()
            .expect("thread holding cohort poller lock should not panic")
            .take();
        if let Some(cohort_poller) = cohort_poller {
            cohort_poller.shutdown();
        }
        self.updater.stop();
        log::debug!(target: "experiment", "deployment runner stopped");
    }
}

impl Drop for DeploymentRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

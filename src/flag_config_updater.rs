//! Keeping stored flag configs up to date, by polling, streaming, or a streaming connection
//! with polling as fallback.
use std::{
    ops::ControlFlow,
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc, Mutex,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crate::{
    cohort::all_cohort_ids_from_flags,
    cohort_loader::CohortLoader,
    cohort_storage::CohortStorage,
    flag_config_api::FlagConfigApi,
    flag_config_storage::{FlagConfigStorage, FlagConfigs},
    flag_config_stream_api::FlagConfigStreamApiV2,
    poller::{jitter_around, Poller},
    Error, Result,
};

pub use crate::flag_config_stream_api::ErrorCallback;

/// Something that keeps [`FlagConfigStorage`] current in the background.
pub trait FlagConfigUpdater: Send + Sync {
    /// Load flag configs once, blocking, then keep them updated.
    ///
    /// Failures after a successful start are reported to `on_error`.
    fn start(&self, on_error: Option<ErrorCallback>) -> Result<()>;

    /// Stop updating. Idempotent.
    fn stop(&self);
}

/// Applies a freshly fetched flag set to storage, downloading the cohorts it needs first.
#[derive(Clone)]
pub struct FlagConfigUpdaterBase {
    flag_config_storage: Arc<FlagConfigStorage>,
    cohort_storage: Arc<CohortStorage>,
    cohort_loader: Option<Arc<CohortLoader>>,
}

impl FlagConfigUpdaterBase {
    pub fn new(
        flag_config_storage: Arc<FlagConfigStorage>,
        cohort_storage: Arc<CohortStorage>,
        cohort_loader: Option<Arc<CohortLoader>>,
    ) -> FlagConfigUpdaterBase {
        FlagConfigUpdaterBase {
            flag_config_storage,
            cohort_storage,
            cohort_loader,
        }
    }

    /// Replace stored flags with `flag_configs`.
    ///
    /// Cohorts referenced for the first time are downloaded before the flags are stored. Flags
    /// whose cohorts fail to download are stored anyway and logged. Cohorts no longer referenced
    /// by any flag are deleted afterwards.
    pub fn update(&self, flag_configs: FlagConfigs) -> Result<()> {
        let count = flag_configs.len();
        let Some(cohort_loader) = &self.cohort_loader else {
            self.flag_config_storage.replace_flag_configs(flag_configs);
            log::debug!(target: "experiment", count; "refreshed flag configs");
            return Ok(());
        };

        let referenced = all_cohort_ids_from_flags(flag_configs.values().map(|flag| &**flag));
        let existing = self.cohort_storage.get_cohort_ids();
        // Failures are logged by the loader and reported per flag below.
        let _ = cohort_loader.download_cohorts(referenced.difference(&existing));

        let stored = self.cohort_storage.get_cohort_ids();
        for flag in flag_configs.values() {
            let missing: Vec<String> = flag.all_cohort_ids().difference(&stored).cloned().collect();
            if !missing.is_empty() {
                log::warn!(target: "experiment", flag_key = flag.key.as_str(), missing_cohorts:? = missing; "flag is missing cohorts, cohort targeting may be inaccurate");
            }
        }

        self.flag_config_storage.replace_flag_configs(flag_configs);
        self.delete_unused_cohorts();
        log::debug!(target: "experiment", count; "refreshed flag configs");
        Ok(())
    }

    fn delete_unused_cohorts(&self) {
        let flag_configs = self.flag_config_storage.get_flag_configs();
        let referenced = all_cohort_ids_from_flags(flag_configs.values().map(|flag| &**flag));
        for (cohort_id, cohort) in self.cohort_storage.get_cohorts() {
            if !referenced.contains(&cohort_id) {
                log::debug!(target: "experiment", cohort_id = cohort_id.as_str(); "deleting unused cohort");
                self.cohort_storage.delete_cohort(&cohort.group_type, &cohort_id);
            }
        }
    }
}

/// Polls the flag server on a fixed interval.
pub struct FlagConfigPoller {
    base: FlagConfigUpdaterBase,
    api: Arc<dyn FlagConfigApi>,
    poll_interval: Duration,
    poller: Mutex<Option<Poller>>,
}

/// Spreads polls of many instances slightly so they don't line up.
const POLL_JITTER: Duration = Duration::from_millis(500);

impl FlagConfigPoller {
    pub fn new(
        base: FlagConfigUpdaterBase,
        api: Arc<dyn FlagConfigApi>,
        poll_interval: Duration,
    ) -> FlagConfigPoller {
        FlagConfigPoller {
            base,
            api,
            poll_interval,
            poller: Mutex::new(None),
        }
    }
}

fn fetch_and_update(api: &dyn FlagConfigApi, base: &FlagConfigUpdaterBase) -> Result<()> {
    let flag_configs = api.get_flag_configs()?;
    base.update(flag_configs)
}

impl FlagConfigUpdater for FlagConfigPoller {
    fn start(&self, on_error: Option<ErrorCallback>) -> Result<()> {
        let mut poller = self
            .poller
            .lock()
            .expect("thread holding poller lock should not panic");
        if let Some(previous) = poller.take() {
            previous.shutdown();
        }

        if let Err(err) = fetch_and_update(self.api.as_ref(), &self.base) {
            log::error!(target: "experiment", "initial flag config fetch failed: {err}");
            return Err(err);
        }

        let api = Arc::clone(&self.api);
        let base = self.base.clone();
        *poller = Some(Poller::start(
            "experiment-flag-poller",
            self.poll_interval,
            POLL_JITTER.min(self.poll_interval / 10),
            move || match fetch_and_update(api.as_ref(), &base) {
                Ok(()) => ControlFlow::Continue(()),
                Err(err) => {
                    log::error!(target: "experiment", "periodic flag config fetch failed, stopping poller: {err}");
                    if let Some(on_error) = &on_error {
                        on_error(err);
                    }
                    ControlFlow::Break(())
                }
            },
        )?);
        Ok(())
    }

    fn stop(&self) {
        let poller = self
            .poller
            .lock()
            .expect("thread holding poller lock should not panic")
            .take();
        if let Some(poller) = poller {
            poller.shutdown();
        }
    }
}

/// Receives flag configs over the stream.
pub struct FlagConfigStreamer {
    base: FlagConfigUpdaterBase,
    api: FlagConfigStreamApiV2,
    lock: Mutex<()>,
}

impl FlagConfigStreamer {
    pub fn new(base: FlagConfigUpdaterBase, api: FlagConfigStreamApiV2) -> FlagConfigStreamer {
        FlagConfigStreamer {
            base,
            api,
            lock: Mutex::new(()),
        }
    }
}

impl FlagConfigUpdater for FlagConfigStreamer {
    fn start(&self, on_error: Option<ErrorCallback>) -> Result<()> {
        let _guard = self
            .lock
            .lock()
            .expect("thread holding streamer lock should not panic");
        let base = self.base.clone();
        self.api.connect(
            |flag_configs| self.base.update(flag_configs),
            move |flag_configs| base.update(flag_configs),
            move |err| {
                if let Some(on_error) = on_error {
                    on_error(err);
                }
            },
        )
    }

    fn stop(&self) {
        let _guard = self
            .lock
            .lock()
            .expect("thread holding streamer lock should not panic");
        self.api.close();
    }
}

enum Command {
    MainFailed(Error),
    Stop,
}

struct Supervisor {
    commands: Sender<Command>,
    join_handle: JoinHandle<()>,
}

/// Runs a main updater, falling back to another while the main one is down.
///
/// When the main updater fails to start, or fails later, the fallback is started and the main
/// updater is retried after `retry_delay ± max_jitter` until it is back. Then the fallback is
/// stopped. At most one retry is pending at any time.
///
/// The wrapper recovers from every failure on its own, so it never calls its `on_error`.
pub struct FlagConfigFallbackRetryWrapper {
    updaters: Arc<Updaters>,
    supervisor: Mutex<Option<Supervisor>>,
}

struct Updaters {
    main: Arc<dyn FlagConfigUpdater>,
    fallback: Option<Arc<dyn FlagConfigUpdater>>,
    retry_delay: Duration,
    max_jitter: Duration,
}

impl FlagConfigFallbackRetryWrapper {
    pub fn new(
        main: Arc<dyn FlagConfigUpdater>,
        fallback: Option<Arc<dyn FlagConfigUpdater>>,
        retry_delay: Duration,
        max_jitter: Duration,
    ) -> FlagConfigFallbackRetryWrapper {
        FlagConfigFallbackRetryWrapper {
            updaters: Arc::new(Updaters {
                main,
                fallback,
                retry_delay,
                max_jitter,
            }),
            supervisor: Mutex::new(None),
        }
    }
}

impl Updaters {
    fn retry_at(&self) -> Instant {
        Instant::now() + jitter_around(self.retry_delay, self.max_jitter)
    }

    fn start_fallback(&self) -> Result<()> {
        match &self.fallback {
            Some(fallback) => fallback.start(None),
            None => Ok(()),
        }
    }

    fn stop_fallback(&self) {
        if let Some(fallback) = &self.fallback {
            fallback.stop();
        }
    }

    /// Supervisor loop. Owns the retry timer so there is never more than one retry pending.
    fn supervise(&self, commands: Receiver<Command>, on_main_error: ErrorCallback, mut retry_at: Option<Instant>) {
        loop {
            let command = match retry_at {
                Some(at) => match commands.recv_timeout(at.saturating_duration_since(Instant::now())) {
                    Ok(command) => Some(command),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => return,
                },
                None => match commands.recv() {
                    Ok(command) => Some(command),
                    Err(_) => return,
                },
            };

            match command {
                Some(Command::Stop) => return,
                Some(Command::MainFailed(err)) => {
                    log::warn!(target: "experiment", "flag config updater failed, starting fallback: {err}");
                    if let Err(err) = self.start_fallback() {
                        log::error!(target: "experiment", "fallback flag config updater failed to start: {err}");
                    }
                    retry_at = Some(self.retry_at());
                }
                None => {
                    log::debug!(target: "experiment", "retrying flag config updater");
                    match self.main.start(Some(Arc::clone(&on_main_error))) {
                        Ok(()) => {
                            retry_at = None;
                            self.stop_fallback();
                        }
                        Err(err) => {
                            log::warn!(target: "experiment", "flag config updater retry failed: {err}");
                            retry_at = Some(self.retry_at());
                        }
                    }
                }
            }
        }
    }
}

impl FlagConfigUpdater for FlagConfigFallbackRetryWrapper {
    fn start(&self, _on_error: Option<ErrorCallback>) -> Result<()> {
        let mut supervisor = self
            .supervisor
            .lock()
            .expect("thread holding supervisor lock should not panic");
        if let Some(previous) = supervisor.take() {
            previous.shutdown();
        }

        let (commands, receiver) = mpsc::channel();
        let on_main_error: ErrorCallback = {
            let commands = commands.clone();
            Arc::new(move |err| {
                // Error means the supervisor has exited and nobody needs to hear about it.
                let _ = commands.send(Command::MainFailed(err));
            })
        };

        let retry_at = match self.updaters.main.start(Some(Arc::clone(&on_main_error))) {
            Ok(()) => {
                self.updaters.stop_fallback();
                None
            }
            Err(err) if self.updaters.fallback.is_none() => return Err(err),
            Err(err) => {
                log::warn!(target: "experiment", "flag config updater failed to start, starting fallback: {err}");
                self.updaters.start_fallback()?;
                Some(self.updaters.retry_at())
            }
        };

        let join_handle = {
            let updaters = Arc::clone(&self.updaters);
            std::thread::Builder::new()
                .name("experiment-updater-supervisor".to_owned())
                .spawn(move || updaters.supervise(receiver, on_main_error, retry_at))?
        };
        *supervisor = Some(Supervisor {
            commands,
            join_handle,
        });
        Ok(())
    }

    fn stop(&self) {
        let supervisor = self
            .supervisor
            .lock()
            .expect("thread holding supervisor lock should not panic")
            .take();
        if let Some(supervisor) = supervisor {
            supervisor.shutdown();
        }
        self.updaters.main.stop();
        self.updaters.stop_fallback();
    }
}

impl Supervisor {
    /// Cancel the pending retry and wait for the supervisor to exit.
    fn shutdown(self) {
        let _ = self.commands.send(Command::Stop);
        if self.join_handle.join().is_err() {
            log::error!(target: "experiment", "updater supervisor thread panicked");
        }
    }
}

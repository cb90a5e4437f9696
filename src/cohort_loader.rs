//! Cohort downloads with in-flight request coalescing.
use std::{
    collections::HashMap,
    sync::{Arc, Condvar, Mutex},
};

use crate::{cohort_download_api::CohortDownloadApi, cohort_storage::CohortStorage, Error, Result};

/// Handle to a running cohort download. Cloning shares the same download.
#[derive(Clone)]
pub struct CohortLoaderTask {
    /// Holds `None` while the download is running, then its outcome.
    result: Arc<(Mutex<Option<Result<()>>>, Condvar)>,
}

impl CohortLoaderTask {
    fn new() -> CohortLoaderTask {
        CohortLoaderTask {
            result: Arc::new((Mutex::new(None), Condvar::new())),
        }
    }

    fn complete(&self, value: Result<()>) {
        if let Ok(mut result) = self.result.0.lock() {
            *result = Some(value);
        }
        self.result.1.notify_all();
    }

    /// Block until the download finishes. `Ok(())` includes "not modified".
    pub fn wait(&self) -> Result<()> {
        let mut lock = self.result.0.lock().map_err(|_| Error::ThreadPanicked)?;
        loop {
            match &*lock {
                Some(result) => return result.clone(),
                None => {
                    lock = self
                        .result
                        .1
                        .wait(lock)
                        .map_err(|_| Error::ThreadPanicked)?;
                }
            }
        }
    }
}

type Jobs = Arc<Mutex<HashMap<String, CohortLoaderTask>>>;

/// Downloads cohorts into [`CohortStorage`]. Concurrent loads of the same cohort share one
/// download.
pub struct CohortLoader {
    api: Arc<dyn CohortDownloadApi>,
    storage: Arc<CohortStorage>,
    jobs: Jobs,
}

impl CohortLoader {
    pub fn new(api: Arc<dyn CohortDownloadApi>, storage: Arc<CohortStorage>) -> CohortLoader {
        CohortLoader {
            api,
            storage,
            jobs: Arc::default(),
        }
    }

    /// Start downloading `cohort_id`, or join the download already in flight.
    pub fn load_cohort(&self, cohort_id: &str) -> CohortLoaderTask {
        let mut jobs = self
            .jobs
            .lock()
            .expect("thread holding cohort jobs lock should not panic");
        if let Some(task) = jobs.get(cohort_id) {
            return task.clone();
        }
        let task = CohortLoaderTask::new();
        jobs.insert(cohort_id.to_owned(), task.clone());
        drop(jobs);

        let spawned = {
            let api = Arc::clone(&self.api);
            let storage = Arc::clone(&self.storage);
            let jobs = Arc::clone(&self.jobs);
            let task = task.clone();
            let cohort_id = cohort_id.to_owned();
            std::thread::Builder::new()
                .name("experiment-cohort-loader".to_owned())
                .spawn(move || {
                    let result = download_cohort(&*api, &storage, &cohort_id);
                    remove_job(&jobs, &cohort_id);
                    task.complete(result);
                })
        };
        if let Err(err) = spawned {
            remove_job(&self.jobs, cohort_id);
            task.complete(Err(Error::from(err)));
        }
        task
    }

    /// Download `cohort_ids` concurrently and wait for all of them.
    ///
    /// # Errors
    ///
    /// [`Error::CohortDownloadFailed`] naming every cohort that failed. The rest are stored.
    pub fn download_cohorts<I, S>(&self, cohort_ids: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tasks: Vec<(String, CohortLoaderTask)> = cohort_ids
            .into_iter()
            .map(|id| (id.as_ref().to_owned(), self.load_cohort(id.as_ref())))
            .collect();

        let mut failed = Vec::new();
        for (cohort_id, task) in tasks {
            if let Err(err) = task.wait() {
                log::error!(target: "experiment", cohort_id; "error downloading cohort: {err}");
                failed.push(cohort_id);
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::CohortDownloadFailed(failed))
        }
    }

    /// Refresh every stored cohort.
    pub fn update_stored_cohorts(&self) -> Result<()> {
        log::debug!(target: "experiment", "updating stored cohorts");
        self.download_cohorts(self.storage.get_cohort_ids())
    }
}

fn download_cohort(api: &dyn CohortDownloadApi, storage: &CohortStorage, cohort_id: &str) -> Result<()> {
    let existing = storage.get_cohort(cohort_id);
    if let Some(cohort) = api.get_cohort(cohort_id, existing.as_deref())? {
        storage.put_cohort(cohort);
    }
    Ok(())
}

fn remove_job(jobs: &Jobs, cohort_id: &str) {
    if let Ok(mut jobs) = jobs.lock() {
        jobs.remove(cohort_id);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    };

    use super::CohortLoader;
    use crate::{
        cohort::{tests::cohort, Cohort},
        cohort_download_api::CohortDownloadApi,
        cohort_storage::CohortStorage,
        Error, Result,
    };

    /// Serves canned responses per cohort id, counting calls.
    #[derive(Default)]
    pub(crate) struct MockCohortDownloadApi {
        pub responses: Mutex<HashMap<String, Vec<Result<Option<Cohort>>>>>,
        pub calls: AtomicUsize,
        pub latency: Duration,
    }

    impl MockCohortDownloadApi {
        pub fn respond(&self, cohort_id: &str, response: Result<Option<Cohort>>) {
            self.responses
                .lock()
                .unwrap()
                .entry(cohort_id.to_owned())
                .or_default()
                .push(response);
        }
    }

    impl CohortDownloadApi for MockCohortDownloadApi {
        fn get_cohort(&self, cohort_id: &str, _existing: Option<&Cohort>) -> Result<Option<Cohort>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.latency);
            let mut responses = self.responses.lock().unwrap();
            match responses.get_mut(cohort_id) {
                Some(queue) if queue.len() > 1 => queue.remove(0),
                Some(queue) if queue.len() == 1 => queue[0].clone(),
                _ => Err(Error::HttpStatus(404)),
            }
        }
    }

    fn loader(api: Arc<MockCohortDownloadApi>) -> (CohortLoader, Arc<CohortStorage>) {
        let storage = Arc::new(CohortStorage::new());
        (CohortLoader::new(api, Arc::clone(&storage)), storage)
    }

    #[test]
    fn loads_into_storage() {
        let api = Arc::new(MockCohortDownloadApi::default());
        api.respond("a", Ok(Some(cohort("a", 1, "user", &["u"]))));
        let (loader, storage) = loader(Arc::clone(&api));

        loader.load_cohort("a").wait().unwrap();
        assert_eq!(storage.get_cohort("a").unwrap().last_modified, 1);
    }

    #[test]
    fn concurrent_loads_share_one_download() {
        let api = Arc::new(MockCohortDownloadApi {
            latency: Duration::from_millis(100),
            ..Default::default()
        });
        api.respond("a", Ok(Some(cohort("a", 1, "user", &["u"]))));
        let (loader, _storage) = loader(Arc::clone(&api));

        let first = loader.load_cohort("a");
        let second = loader.load_cohort("a");
        first.wait().unwrap();
        second.wait().unwrap();
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);

        // Finished jobs are forgotten, so a later load downloads again.
        loader.load_cohort("a").wait().unwrap();
        assert_eq!(api.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failure_does_not_poison_later_loads() {
        let api = Arc::new(MockCohortDownloadApi::default());
        api.respond("a", Err(Error::HttpStatus(500)));
        api.respond("a", Ok(Some(cohort("a", 2, "user", &[]))));
        let (loader, storage) = loader(Arc::clone(&api));

        assert!(matches!(loader.load_cohort("a").wait(), Err(Error::HttpStatus(500))));
        assert!(storage.get_cohort("a").is_none());
        loader.load_cohort("a").wait().unwrap();
        assert!(storage.get_cohort("a").is_some());
    }

    #[test]
    fn not_modified_keeps_stored_cohort() {
        let api = Arc::new(MockCohortDownloadApi::default());
        api.respond("a", Ok(None));
        let (loader, storage) = loader(Arc::clone(&api));
        storage.put_cohort(cohort("a", 1, "user", &["u"]));

        loader.load_cohort("a").wait().unwrap();
        assert_eq!(storage.get_cohort("a").unwrap().member_ids.len(), 1);
    }

    #[test]
    fn download_cohorts_reports_failures() {
        let api = Arc::new(MockCohortDownloadApi::default());
        api.respond("a", Ok(Some(cohort("a", 1, "user", &[]))));
        api.respond("b", Err(Error::CohortTooLarge));
        let (loader, storage) = loader(Arc::clone(&api));

        let err = loader.download_cohorts(["a", "b"]).unwrap_err();
        assert!(matches!(err, Error::CohortDownloadFailed(ids) if ids == ["b"]));
        assert!(storage.get_cohort("a").is_some());
    }

    #[test]
    fn update_stored_cohorts_refreshes_all() {
        let api = Arc::new(MockCohortDownloadApi::default());
        api.respond("a", Ok(Some(cohort("a", 2, "user", &[]))));
        api.respond("b", Ok(None));
        let (loader, storage) = loader(Arc::clone(&api));
        storage.put_cohort(cohort("a", 1, "user", &[]));
        storage.put_cohort(cohort("b", 1, "user", &[]));

        loader.update_stored_cohorts().unwrap();
        assert_eq!(api.calls.load(Ordering::SeqCst), 2);
        assert_eq!(storage.get_cohort("a").unwrap().last_modified, 2);
        assert_eq!(storage.get_cohort("b").unwrap().last_modified, 1);
    }
}

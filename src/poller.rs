//! A background thread that runs a task periodically until stopped.
use std::{
    ops::ControlFlow,
    sync::mpsc::{RecvTimeoutError, SyncSender},
    thread::JoinHandle,
    time::Duration,
};

use rand::{thread_rng, Rng};

/// A periodic task thread.
///
/// The first tick happens one interval after start. Each tick returns whether to keep polling.
pub struct Poller {
    name: String,
    join_handle: Option<JoinHandle<()>>,
    /// Used to send a stop command to the poller thread.
    stop_sender: SyncSender<()>,
}

impl Poller {
    /// Starts the poller thread.
    ///
    /// # Errors
    ///
    /// IO error if the thread failed to start.
    pub fn start<F>(
        name: &str,
        interval: Duration,
        jitter: Duration,
        mut tick: F,
    ) -> std::io::Result<Poller>
    where
        F: FnMut() -> ControlFlow<()> + Send + 'static,
    {
        // Using `sync_channel` here as it makes `stop_sender` `Sync` (shareable between
        // threads). Buffer size of 1 is enough as we only ever send a stop command, and a full
        // buffer means another thread has already sent one.
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);

        let thread_name = name.to_owned();
        let join_handle = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || loop {
                let timeout = self::jitter(interval, jitter);
                match stop_receiver.recv_timeout(timeout) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        log::debug!(target: "experiment", poller = thread_name; "poller thread received stop command");
                        return;
                    }
                }

                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(&mut tick));
                match result {
                    Ok(ControlFlow::Continue(())) => {}
                    Ok(ControlFlow::Break(())) => {
                        log::debug!(target: "experiment", poller = thread_name; "poller finished");
                        return;
                    }
                    Err(_panic) => {
                        log::error!(target: "experiment", poller = thread_name; "poller task panicked, stopping");
                        return;
                    }
                }
            })?;

        Ok(Poller {
            name: name.to_owned(),
            join_handle: Some(join_handle),
            stop_sender,
        })
    }

    /// Stop the poller thread. Does not wait for a running tick to finish.
    pub fn stop(&self) {
        // Error means that the thread has exited or another stop command is already queued.
        // Either way the thread is stopping.
        if self.stop_sender.try_send(()).is_ok() {
            log::debug!(target: "experiment", poller = self.name.as_str(); "stopping poller");
        }
    }

    /// Stop the poller thread and block until it exits, letting a running tick finish.
    pub fn shutdown(mut self) {
        self.stop();
        let Some(join_handle) = self.join_handle.take() else {
            return;
        };
        // Joining from the poller's own thread would never return.
        if join_handle.thread().id() == std::thread::current().id() {
            return;
        }
        if join_handle.join().is_err() {
            log::error!(target: "experiment", poller = self.name.as_str(); "poller thread panicked");
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Apply randomized `jitter` to `interval`, never exceeding `interval`.
pub(crate) fn jitter(interval: Duration, jitter: Duration) -> Duration {
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}

/// Pick a random duration in `interval ± jitter`.
pub(crate) fn jitter_around(interval: Duration, jitter: Duration) -> Duration {
    Duration::saturating_sub(interval, jitter) + thread_rng().gen_range(Duration::ZERO..=jitter * 2)
}

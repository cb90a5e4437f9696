//! Flag configs delivered over a [`FlagStream`].
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError},
        Arc, Mutex,
    },
    time::Duration,
};

use crate::{
    flag_config_api::parse_flag_configs,
    flag_config_storage::FlagConfigs,
    stream::{FlagStream, StreamEvent},
    Error, Result,
};

/// Receives asynchronous errors from a background updater.
pub type ErrorCallback = Arc<dyn Fn(Error) + Send + Sync>;

/// Turns raw stream payloads into flag config updates.
///
/// The first payload after connecting is the full flag set and decides whether the connection
/// succeeded. Later payloads are dispatched on a background thread.
pub struct FlagConfigStreamApiV2 {
    stream: Arc<dyn FlagStream>,
    conn_timeout: Duration,
    /// Closed flag of the current connection.
    session: Mutex<Option<Arc<AtomicBool>>>,
}

impl FlagConfigStreamApiV2 {
    pub fn new(stream: Arc<dyn FlagStream>, conn_timeout: Duration) -> FlagConfigStreamApiV2 {
        FlagConfigStreamApiV2 {
            stream,
            conn_timeout,
            session: Mutex::new(None),
        }
    }

    /// Connect and block until the first flag set has been handed to `on_init_update`.
    ///
    /// # Errors
    ///
    /// - [`Error::StreamConnectTimeout`] if no payload arrives within the connection timeout.
    /// - [`Error::StreamCorruptData`] if the first payload is not a flag list.
    /// - Any error returned by `on_init_update` or reported by the stream.
    ///
    /// After a successful connect, `on_error` is called at most once when the stream fails. It
    /// is never called after [`FlagConfigStreamApiV2::close`].
    pub fn connect<I, U, E>(&self, on_init_update: I, on_update: U, on_error: E) -> Result<()>
    where
        I: FnOnce(FlagConfigs) -> Result<()>,
        U: Fn(FlagConfigs) -> Result<()> + Send + 'static,
        E: FnOnce(Error) + Send + 'static,
    {
        self.close();

        let (sender, receiver) = mpsc::channel();
        self.stream.connect(sender)?;
        let closed = Arc::new(AtomicBool::new(false));
        *self
            .session
            .lock()
            .expect("thread holding stream session lock should not panic") = Some(Arc::clone(&closed));

        let first = match receiver.recv_timeout(self.conn_timeout) {
            Ok(StreamEvent::Data(data)) => parse_stream_payload(&data).and_then(on_init_update),
            Ok(StreamEvent::Error(err)) => Err(err),
            Err(RecvTimeoutError::Timeout) => Err(Error::StreamConnectTimeout),
            Err(RecvTimeoutError::Disconnected) => Err(Error::StreamDisconnected),
        };
        if let Err(err) = first {
            log::warn!(target: "experiment", "stream connection failed: {err}");
            self.close();
            return Err(err);
        }
        log::debug!(target: "experiment", "stream connected");

        let stream = Arc::clone(&self.stream);
        let spawned = std::thread::Builder::new()
            .name("experiment-stream-dispatch".to_owned())
            .spawn(move || {
                // Ends when the stream is cancelled and drops its sender.
                for event in receiver {
                    if closed.load(Ordering::SeqCst) {
                        return;
                    }
                    let err = match event {
                        StreamEvent::Data(data) => match parse_stream_payload(&data) {
                            Ok(flag_configs) => {
                                if let Err(err) = on_update(flag_configs) {
                                    log::warn!(target: "experiment", "failed to apply streamed flag configs: {err}");
                                }
                                continue;
                            }
                            Err(err) => err,
                        },
                        StreamEvent::Error(err) => err,
                    };
                    // Claim the session so `on_error` runs once and never after `close()`.
                    if !closed.swap(true, Ordering::SeqCst) {
                        log::warn!(target: "experiment", "stream failed: {err}");
                        stream.cancel();
                        on_error(err);
                    }
                    return;
                }
            });
        if let Err(err) = spawned {
            self.close();
            return Err(Error::from(err));
        }
        Ok(())
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        let session = self
            .session
            .lock()
            .expect("thread holding stream session lock should not panic")
            .take();
        if let Some(closed) = session {
            closed.store(true, Ordering::SeqCst);
            self.stream.cancel();
        }
    }
}

fn parse_stream_payload(data: &str) -> Result<FlagConfigs> {
    parse_flag_configs(data).map_err(|err| match err {
        Error::Json(err) => Error::StreamCorruptData(err),
        err => err,
    })
}

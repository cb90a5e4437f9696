//! Server-sent events transport for flag config updates.
use std::{
    sync::{mpsc::Sender, Mutex},
    time::Duration,
};

use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::{StatusCode, Url};
use tokio::sync::watch;

use crate::{
    cohort_download_api::{library_name, LIBRARY_HEADER},
    poller::jitter_around,
    Error, Result,
};

/// Messages delivered by a [`FlagStream`].
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A non-heartbeat payload.
    Data(String),
    /// The stream failed and is closed. No further events follow.
    Error(Error),
}

/// A long-lived connection delivering flag payloads.
pub trait FlagStream: Send + Sync {
    /// Open the connection in the background, delivering payloads and the terminal error to
    /// `events`. Connecting again closes the previous connection.
    fn connect(&self, events: Sender<StreamEvent>) -> Result<()>;

    /// Close the connection. No events are delivered afterwards.
    fn cancel(&self);
}

/// Default keepalive timeout. The server sends a heartbeat well within it.
pub const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(17);
/// Connections are recycled after this long, plus or minus [`DEFAULT_RECONNECT_JITTER`].
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_RECONNECT_JITTER: Duration = Duration::from_secs(5);

/// [`FlagStream`] over `reqwest` and `eventsource-stream`, running on its own thread.
pub struct SseStream {
    url: Url,
    authorization: String,
    conn_timeout: Duration,
    keepalive_timeout: Duration,
    reconnect_interval: Duration,
    reconnect_jitter: Duration,
    /// Set while connected. Sending `true` (or dropping it) shuts the connection down.
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl SseStream {
    pub fn new(deployment_key: &str, stream_server_url: &str, conn_timeout: Duration) -> Result<SseStream> {
        Ok(SseStream {
            url: stream_url(stream_server_url)?,
            authorization: format!("Api-Key {deployment_key}"),
            conn_timeout,
            keepalive_timeout: DEFAULT_KEEPALIVE_TIMEOUT,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            reconnect_jitter: DEFAULT_RECONNECT_JITTER,
            shutdown: Mutex::new(None),
        })
    }
}

#[cfg(test)]
impl SseStream {
    pub fn with_keepalive_timeout(mut self, keepalive_timeout: Duration) -> SseStream {
        self.keepalive_timeout = keepalive_timeout;
        self
    }

    /// Recycle connections after `interval ± jitter`.
    pub fn with_reconnect_interval(mut self, interval: Duration, jitter: Duration) -> SseStream {
        self.reconnect_interval = interval;
        self.reconnect_jitter = jitter;
        self
    }
}

impl FlagStream for SseStream {
    fn connect(&self, events: Sender<StreamEvent>) -> Result<()> {
        self.cancel();

        let client = reqwest::Client::builder()
            .connect_timeout(self.conn_timeout)
            .build()?;
        let (shutdown_sender, shutdown_receiver) = watch::channel(false);
        let session = Session {
            client,
            url: self.url.clone(),
            authorization: self.authorization.clone(),
            conn_timeout: self.conn_timeout,
            keepalive_timeout: self.keepalive_timeout,
            events,
        };
        let (reconnect_interval, reconnect_jitter) = (self.reconnect_interval, self.reconnect_jitter);

        std::thread::Builder::new()
            .name("experiment-stream".to_owned())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        let _ = session.events.send(StreamEvent::Error(Error::from(err)));
                        return;
                    }
                };
                runtime.block_on(session.run(shutdown_receiver, reconnect_interval, reconnect_jitter));
                log::debug!(target: "experiment", "stream thread exited");
            })?;

        *self
            .shutdown
            .lock()
            .expect("thread holding stream lock should not panic") = Some(shutdown_sender);
        Ok(())
    }

    fn cancel(&self) {
        let shutdown = self
            .shutdown
            .lock()
            .expect("thread holding stream lock should not panic")
            .take();
        if let Some(shutdown) = shutdown {
            log::debug!(target: "experiment", "closing stream");
            // Error means the stream thread has already exited.
            let _ = shutdown.send(true);
        }
    }
}

impl Drop for SseStream {
    fn drop(&mut self) {
        self.cancel();
    }
}

struct Session {
    client: reqwest::Client,
    url: Url,
    authorization: String,
    conn_timeout: Duration,
    keepalive_timeout: Duration,
    events: Sender<StreamEvent>,
}

enum SessionEnd {
    /// Connection reached its maximum lifetime and should be reopened.
    Expired,
    Failed(Error),
    /// Nobody is listening anymore.
    Abandoned,
}

impl Session {
    async fn run(
        self,
        mut shutdown: watch::Receiver<bool>,
        reconnect_interval: Duration,
        reconnect_jitter: Duration,
    ) {
        loop {
            let lifetime = jitter_around(reconnect_interval, reconnect_jitter);
            let end = tokio::select! {
                // Fires on shutdown and when the sender is dropped.
                _ = shutdown.changed() => return,
                end = self.open(lifetime) => end,
            };
            match end {
                SessionEnd::Expired => {
                    log::debug!(target: "experiment", "stream connection expired, reconnecting");
                }
                SessionEnd::Failed(err) => {
                    if !*shutdown.borrow() {
                        let _ = self.events.send(StreamEvent::Error(err));
                    }
                    return;
                }
                SessionEnd::Abandoned => return,
            }
        }
    }

    async fn open(&self, lifetime: Duration) -> SessionEnd {
        log::debug!(target: "experiment", url = self.url.as_str(); "opening stream");
        let request = self
            .client
            .get(self.url.clone())
            .header(reqwest::header::AUTHORIZATION, &self.authorization)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header(LIBRARY_HEADER, library_name())
            .send();

        let response = match tokio::time::timeout(self.conn_timeout, request).await {
            Err(_) => return SessionEnd::Failed(Error::StreamConnectTimeout),
            Ok(Err(err)) => return SessionEnd::Failed(Error::from(err)),
            Ok(Ok(response)) => response,
        };
        match response.status() {
            status if status.is_success() => {}
            StatusCode::UNAUTHORIZED => return SessionEnd::Failed(Error::Unauthorized),
            status => return SessionEnd::Failed(Error::HttpStatus(status.as_u16())),
        }

        let mut messages = response.bytes_stream().eventsource();
        let expiry = tokio::time::sleep(lifetime);
        tokio::pin!(expiry);

        loop {
            let next = tokio::select! {
                _ = &mut expiry => return SessionEnd::Expired,
                next = tokio::time::timeout(self.keepalive_timeout, messages.next()) => next,
            };
            match next {
                Err(_) => return SessionEnd::Failed(Error::StreamKeepaliveTimeout),
                Ok(None) => return SessionEnd::Failed(Error::StreamDisconnected),
                Ok(Some(Err(err))) => return SessionEnd::Failed(Error::Stream(err.to_string())),
                Ok(Some(Ok(message))) => {
                    if is_heartbeat(&message.data) {
                        log::trace!(target: "experiment", "stream heartbeat");
                        continue;
                    }
                    if self.events.send(StreamEvent::Data(message.data)).is_err() {
                        return SessionEnd::Abandoned;
                    }
                }
            }
        }
    }
}

fn is_heartbeat(data: &str) -> bool {
    data.trim().is_empty()
}

fn stream_url(stream_server_url: &str) -> Result<Url> {
    Ok(Url::parse(stream_server_url)?.join("sdk/stream/v1/flags")?)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc,
    };

    use super::*;
    use crate::test_server::{serve, serve_once};

    /// A [`FlagStream`] driven by the test through the sender handed to `connect`.
    #[derive(Default)]
    pub(crate) struct MockFlagStream {
        events: Mutex<Option<Sender<StreamEvent>>>,
        /// Delivered as soon as `connect` is called.
        on_connect: Mutex<Vec<StreamEvent>>,
        pub connect_error: Mutex<Option<Error>>,
        pub connects: AtomicUsize,
        pub cancels: AtomicUsize,
    }

    impl MockFlagStream {
        pub fn new() -> Arc<MockFlagStream> {
            Arc::new(MockFlagStream::default())
        }

        /// Deliver `events` on every subsequent connect.
        pub fn on_connect(&self, events: Vec<StreamEvent>) {
            *self.on_connect.lock().unwrap() = events;
        }

        /// Deliver `event` if connected. Returns whether anyone received it.
        pub fn push(&self, event: StreamEvent) -> bool {
            match &*self.events.lock().unwrap() {
                Some(events) => events.send(event).is_ok(),
                None => false,
            }
        }
    }

    impl FlagStream for MockFlagStream {
        fn connect(&self, events: Sender<StreamEvent>) -> Result<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.connect_error.lock().unwrap().clone() {
                return Err(err);
            }
            for event in self.on_connect.lock().unwrap().iter() {
                let _ = events.send(event.clone());
            }
            *self.events.lock().unwrap() = Some(events);
            Ok(())
        }

        fn cancel(&self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            self.events.lock().unwrap().take();
        }
    }

    #[test]
    fn heartbeats() {
        assert!(is_heartbeat(" "));
        assert!(is_heartbeat(""));
        assert!(is_heartbeat("\n "));
        assert!(!is_heartbeat("[]"));
    }

    #[test]
    fn builds_stream_url() {
        assert_eq!(
            stream_url("https://stream.lab.amplitude.com").unwrap().as_str(),
            "https://stream.lab.amplitude.com/sdk/stream/v1/flags"
        );
    }

    #[test]
    fn delivers_data_and_skips_heartbeats() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n\
             data: \x20\n\n\
             data: [{\"key\":\"a\"}]\n\n",
            Duration::ZERO,
        );
        let stream = SseStream::new("key", &url, Duration::from_secs(5)).unwrap();
        let (sender, receiver) = mpsc::channel();
        stream.connect(sender).unwrap();

        let first = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(first, StreamEvent::Data(data) if data == r#"[{"key":"a"}]"#));
        let second = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(second, StreamEvent::Error(Error::StreamDisconnected)));
    }

    #[test]
    fn unauthorized_is_reported() {
        let url = serve_once(
            "HTTP/1.1 401 Unauthorized\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
            Duration::ZERO,
        );
        let stream = SseStream::new("bad", &url, Duration::from_secs(5)).unwrap();
        let (sender, receiver) = mpsc::channel();
        stream.connect(sender).unwrap();

        let event = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(event, StreamEvent::Error(Error::Unauthorized)));
    }

    #[test]
    fn silent_connection_times_out() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\n\r\ndata: []\n\n",
            Duration::from_secs(3),
        );
        let stream = SseStream::new("key", &url, Duration::from_secs(5))
            .unwrap()
            .with_keepalive_timeout(Duration::from_millis(100));
        let (sender, receiver) = mpsc::channel();
        stream.connect(sender).unwrap();

        assert!(matches!(
            receiver.recv_timeout(Duration::from_secs(5)).unwrap(),
            StreamEvent::Data(_)
        ));
        assert!(matches!(
            receiver.recv_timeout(Duration::from_secs(2)).unwrap(),
            StreamEvent::Error(Error::StreamKeepaliveTimeout)
        ));
    }

    #[test]
    fn cancel_suppresses_events() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\n\r\n",
            Duration::from_secs(3),
        );
        let stream = SseStream::new("key", &url, Duration::from_secs(5)).unwrap();
        let (sender, receiver) = mpsc::channel();
        stream.connect(sender).unwrap();
        stream.cancel();
        stream.cancel();

        // Sender is dropped once the thread exits, without an error being reported.
        assert!(matches!(
            receiver.recv_timeout(Duration::from_secs(5)),
            Err(mpsc::RecvTimeoutError::Disconnected)
        ));
    }

    #[test]
    fn expired_connection_reconnects_silently() {
        let response = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\n\r\ndata: []\n\n";
        let (url, requests) = serve(vec![response, response], Duration::from_secs(3));
        let stream = SseStream::new("key", &url, Duration::from_secs(5))
            .unwrap()
            .with_reconnect_interval(Duration::from_millis(300), Duration::ZERO);
        let (sender, receiver) = mpsc::channel();
        stream.connect(sender).unwrap();

        for _ in 0..2 {
            assert!(matches!(
                receiver.recv_timeout(Duration::from_secs(5)).unwrap(),
                StreamEvent::Data(data) if data == "[]"
            ));
            assert_eq!(
                requests.recv_timeout(Duration::from_secs(5)).unwrap(),
                "GET /sdk/stream/v1/flags HTTP/1.1"
            );
        }
        stream.cancel();

        loop {
            match receiver.recv_timeout(Duration::from_secs(5)) {
                Ok(StreamEvent::Data(_)) => {}
                Ok(StreamEvent::Error(err)) => panic!("unexpected stream error: {err}"),
                Err(err) => {
                    assert_eq!(err, mpsc::RecvTimeoutError::Disconnected);
                    break;
                }
            }
        }
    }
}

//! # Reconnection
//!
//! [`ReconnectingClient`] keeps a client connection alive: whenever the connection drops it
//! waits for a [`Backoff`] delay and asks its [`Connector`] for a new one. The attempt counter
//! belongs to the client alone and goes back to zero after every successful connection.
//!
//! When [`ReconnectOptions::max_attempts`] is reached the client enters
//! [`ClientState::Failed`] and stops. Exhaustion is reported through the state channel, not
//! returned as an error.
//!
//! ```no_run
//! use wsengine::{
//!     reconnect::{ReconnectOptions, ReconnectingClient},
//!     Handlers, Options, Role, WebSocket,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> wsengine::Result<()> {
//! let client = ReconnectingClient::new(
//!     |_cancel: CancellationToken| async {
//!         let stream = tokio::net::TcpStream::connect("127.0.0.1:9000").await?;
//!         // the HTTP upgrade happens here
//!         let ws = WebSocket::spawn(Role::Client, stream, Options::default(), Handlers::new());
//!         Ok::<_, wsengine::WebSocketError>(ws)
//!     },
//!     ReconnectOptions::default().with_max_attempts(10),
//! )?;
//!
//! client.run().await
//! # }
//! ```
use std::{
    future::Future,
    sync::{Arc, OnceLock},
    time::Duration,
};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    close::CloseCode, interceptor::BoxFuture, pool::RandomSource, Message, Result, WebSocket,
    WebSocketError,
};

mod backoff;

pub use backoff::Backoff;

/// Configuration of the reconnect loop.
#[derive(Clone, Debug)]
pub struct ReconnectOptions {
    /// Delay before the first reconnect attempt.
    ///
    /// Default: 1 second
    pub initial_delay: Duration,

    /// Upper bound of every delay.
    ///
    /// Default: 30 seconds
    pub max_delay: Duration,

    /// Growth factor between consecutive attempts. Must be positive.
    ///
    /// Default: 2.0
    pub multiplier: f64,

    /// Fraction of randomness applied to each delay, in `[0, 1]`.
    ///
    /// Default: 0.2
    pub jitter: f64,

    /// Consecutive failed attempts after which the client gives up. 0 means never.
    pub max_attempts: u32,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: 0,
        }
    }
}

impl ReconnectOptions {
    pub fn with_initial_delay(self, initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            ..self
        }
    }

    pub fn with_max_delay(self, max_delay: Duration) -> Self {
        Self { max_delay, ..self }
    }

    pub fn with_multiplier(self, multiplier: f64) -> Self {
        Self { multiplier, ..self }
    }

    pub fn with_jitter(self, jitter: f64) -> Self {
        Self { jitter, ..self }
    }

    pub fn with_max_attempts(self, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..self
        }
    }

    /// Checks the ranges of the multiplier and the jitter fraction.
    pub fn validate(&self) -> Result<()> {
        if !(self.multiplier > 0.0 && self.multiplier.is_finite()) {
            return Err(WebSocketError::InvalidArgument(
                "backoff multiplier must be positive",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(WebSocketError::InvalidArgument(
                "jitter fraction must be within [0, 1]",
            ));
        }
        Ok(())
    }
}

/// State of a [`ReconnectingClient`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ClientState {
    /// Not running, or stopped on request.
    Disconnected,
    /// Waiting for the connector.
    Connecting,
    /// A connection is open.
    Connected,
    /// Waiting `delay` before attempt number `attempt`, counting from 1.
    Reconnecting { attempt: u32, delay: Duration },
    /// Gave up after the configured number of attempts. Terminal.
    Failed,
}

/// Produces a fresh, open client connection.
///
/// Implemented for every `Fn(CancellationToken) -> impl Future<Output = Result<WebSocket>>`.
/// The connector opens the transport, performs the upgrade and hands the stream to
/// [`WebSocket::spawn`].
pub trait Connector: Send + Sync {
    fn connect(&self, cancel: CancellationToken) -> BoxFuture<'_, Result<WebSocket>>;
}

impl<F, Fut> Connector for F
where
    F: Fn(CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<WebSocket>> + Send + 'static,
{
    fn connect(&self, cancel: CancellationToken) -> BoxFuture<'_, Result<WebSocket>> {
        Box::pin(self(cancel))
    }
}

/// Client connection that reconnects with exponential backoff.
///
/// The handle is cheap to clone. [`ReconnectingClient::run`] drives the loop, the other
/// methods may be called from anywhere.
#[derive(Clone)]
pub struct ReconnectingClient {
    inner: Arc<Inner>,
}

struct Inner {
    connector: Box<dyn Connector>,
    options: ReconnectOptions,
    backoff: Backoff,
    state: watch::Sender<ClientState>,
    connection: watch::Sender<Option<WebSocket>>,
    /// Closes the current connection and stops reconnecting.
    stop: CancellationToken,
    /// Close frame sent when stopping, set by the first call to `close`.
    stop_frame: OnceLock<(CloseCode, String)>,
    /// Aborts everything.
    cancel: CancellationToken,
}

impl ReconnectingClient {
    /// Creates a client. Nothing connects until [`ReconnectingClient::run`] is called.
    ///
    /// # Errors
    /// [`WebSocketError::InvalidArgument`] when the options are out of range.
    pub fn new<C: Connector + 'static>(connector: C, options: ReconnectOptions) -> Result<Self> {
        let backoff = Backoff::new(&options)?;
        Ok(Self::build(Box::new(connector), options, backoff))
    }

    /// Like [`ReconnectingClient::new`] with jitter drawn from `random`.
    pub fn with_random<C: Connector + 'static>(
        connector: C,
        options: ReconnectOptions,
        random: Arc<dyn RandomSource>,
    ) -> Result<Self> {
        let backoff = Backoff::with_random(&options, random)?;
        Ok(Self::build(Box::new(connector), options, backoff))
    }

    fn build(connector: Box<dyn Connector>, options: ReconnectOptions, backoff: Backoff) -> Self {
        let (state, _) = watch::channel(ClientState::Disconnected);
        let (connection, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                connector,
                options,
                backoff,
                state,
                connection,
                stop: CancellationToken::new(),
                stop_frame: OnceLock::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn state(&self) -> ClientState {
        *self.inner.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ClientState> {
        self.inner.state.subscribe()
    }

    /// The current connection, if one is open.
    pub fn connection(&self) -> Option<WebSocket> {
        self.inner.connection.borrow().clone()
    }

    /// Sends through the current connection.
    ///
    /// # Errors
    /// [`WebSocketError::ConnectionClosed`] while no connection is open.
    pub async fn send(&self, message: Message) -> Result<()> {
        match self.connection() {
            Some(ws) => ws.send(message).await,
            None => Err(WebSocketError::ConnectionClosed),
        }
    }

    /// Closes the current connection and stops reconnecting.
    ///
    /// A connection that is still being established when this is called is abandoned.
    /// One that completes regardless is closed by [`ReconnectingClient::run`] with the
    /// same code and reason.
    pub async fn close(&self, code: CloseCode, reason: &str) -> Result<()> {
        let _ = self.inner.stop_frame.set((code, reason.to_owned()));
        self.inner.stop.cancel();
        match self.connection() {
            Some(ws) => ws.close(code, reason).await,
            None => Ok(()),
        }
    }

    /// Aborts the loop, any pending delay and the current connection.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    /// Connects and keeps reconnecting until stopped, cancelled or out of attempts.
    ///
    /// Returns `Ok(())` when stopped through [`ReconnectingClient::close`] or when the
    /// attempts ran out, in which case the state is [`ClientState::Failed`].
    ///
    /// # Errors
    /// [`WebSocketError::Cancelled`] when [`ReconnectingClient::cancel`] was called.
    pub async fn run(&self) -> Result<()> {
        let inner = &self.inner;
        let mut attempt: u32 = 0;

        loop {
            if inner.stop.is_cancelled() {
                inner.set_state(ClientState::Disconnected);
                return Ok(());
            }

            inner.set_state(ClientState::Connecting);
            let res = tokio::select! {
                _ = inner.cancel.cancelled() => {
                    inner.set_state(ClientState::Disconnected);
                    return Err(WebSocketError::Cancelled);
                }
                _ = inner.stop.cancelled() => {
                    inner.set_state(ClientState::Disconnected);
                    return Ok(());
                }
                res = inner.connector.connect(inner.cancel.child_token()) => res,
            };

            match res {
                Ok(ws) => {
                    attempt = 0;
                    inner.connection.send_replace(Some(ws.clone()));
                    inner.set_state(ClientState::Connected);

                    let end = tokio::select! {
                        _ = inner.cancel.cancelled() => End::Cancelled,
                        _ = inner.stop.cancelled() => End::Stopped,
                        _ = ws.closed() => End::Lost,
                    };

                    match end {
                        End::Cancelled => {
                            inner.connection.send_replace(None);
                            ws.cancel();
                            inner.set_state(ClientState::Disconnected);
                            return Err(WebSocketError::Cancelled);
                        }
                        End::Stopped => {
                            inner.stop_connection(&ws).await;
                            inner.connection.send_replace(None);
                            inner.set_state(ClientState::Disconnected);
                            return Ok(());
                        }
                        End::Lost => {
                            inner.connection.send_replace(None);
                        }
                    }

                    #[cfg(feature = "logging")]
                    log::debug!("connection lost, reconnecting");
                }
                Err(err) => {
                    #[cfg(feature = "logging")]
                    log::debug!("connect attempt {attempt} failed: {err}");

                    // protocol failures are never retried
                    if err.kind() == crate::ErrorKind::Protocol {
                        inner.set_state(ClientState::Failed);
                        return Ok(());
                    }
                }
            }

            if inner.stop.is_cancelled() {
                inner.set_state(ClientState::Disconnected);
                return Ok(());
            }

            if inner.options.max_attempts != 0 && attempt >= inner.options.max_attempts {
                #[cfg(feature = "logging")]
                log::warn!("giving up after {attempt} reconnect attempts");

                inner.set_state(ClientState::Failed);
                return Ok(());
            }

            let delay = inner
                .backoff
                .delay(i32::try_from(attempt).unwrap_or(i32::MAX))?;
            attempt = attempt.saturating_add(1);

            #[cfg(feature = "logging")]
            log::debug!("reconnect attempt {attempt} in {delay:?}");

            inner.set_state(ClientState::Reconnecting { attempt, delay });
            tokio::select! {
                _ = inner.cancel.cancelled() => {
                    inner.set_state(ClientState::Disconnected);
                    return Err(WebSocketError::Cancelled);
                }
                _ = inner.stop.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

enum End {
    Cancelled,
    Stopped,
    Lost,
}

impl Inner {
    async fn stop_connection(&self, ws: &WebSocket) {
        let (code, reason) = match self.stop_frame.get() {
            Some((code, reason)) => (*code, reason.as_str()),
            None => (CloseCode::Normal, ""),
        };

        // closing twice waits for the handshake already in progress
        if let Err(_err) = ws.close(code, reason).await {
            #[cfg(feature = "logging")]
            log::debug!("close on stop failed: {_err}");
        }
    }

    fn set_state(&self, state: ClientState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{Handlers, Options, Role};

    fn options() -> ReconnectOptions {
        ReconnectOptions::default()
            .with_initial_delay(Duration::from_millis(1000))
            .with_max_delay(Duration::from_millis(30000))
            .with_jitter(0.0)
    }

    #[test]
    fn test_defaults() {
        let options = ReconnectOptions::default();
        assert_eq!(options.initial_delay, Duration::from_secs(1));
        assert_eq!(options.max_delay, Duration::from_secs(30));
        assert_eq!(options.multiplier, 2.0);
        assert_eq!(options.jitter, 0.2);
        assert_eq!(options.max_attempts, 0);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_rejects_invalid_options() {
        let res = ReconnectingClient::new(
            |_: CancellationToken| async { Err(WebSocketError::ConnectionClosed) },
            options().with_jitter(2.0),
        );
        assert!(matches!(res, Err(WebSocketError::InvalidArgument(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let client = ReconnectingClient::new(
            move |_: CancellationToken| {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(WebSocketError::IoError(std::io::Error::new(
                        std::io::ErrorKind::ConnectionRefused,
                        "refused",
                    )))
                }
            },
            options().with_max_attempts(3),
        )
        .unwrap();

        let mut states = client.state_changes();
        let start = tokio::time::Instant::now();
        assert!(client.run().await.is_ok());

        assert_eq!(client.state(), ClientState::Failed);
        assert!(states.has_changed().unwrap());
        // the first try plus three retries after 1s, 2s and 4s
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(start.elapsed() >= Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_reset_after_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let peers = Arc::new(std::sync::Mutex::new(Vec::new()));
        let keep = Arc::clone(&peers);

        // fails, succeeds and drops right away, then fails for good
        let client = ReconnectingClient::new(
            move |_: CancellationToken| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let keep = Arc::clone(&keep);
                async move {
                    if n == 1 {
                        let (stream, peer) = tokio::io::duplex(64);
                        drop(peer);
                        let ws = WebSocket::spawn(
                            Role::Client,
                            stream,
                            Options::default(),
                            Handlers::new(),
                        );
                        keep.lock().unwrap().push(ws.clone());
                        Ok(ws)
                    } else {
                        Err(WebSocketError::IoError(std::io::Error::new(
                            std::io::ErrorKind::ConnectionRefused,
                            "refused",
                        )))
                    }
                }
            },
            options().with_max_attempts(1),
        )
        .unwrap();

        let mut states = client.state_changes();
        let observed = tokio::spawn(async move {
            let mut seen = Vec::new();
            while states.changed().await.is_ok() {
                let state = *states.borrow_and_update();
                seen.push(state);
                if state == ClientState::Failed {
                    break;
                }
            }
            seen
        });

        assert!(client.run().await.is_ok());
        let seen = observed.await.unwrap();

        assert!(seen.contains(&ClientState::Connected));
        // both reconnect cycles start from the initial delay
        let delays: Vec<Duration> = seen
            .iter()
            .filter_map(|state| match state {
                ClientState::Reconnecting { delay, .. } => Some(*delay),
                _ => None,
            })
            .collect();
        assert_eq!(
            delays,
            vec![Duration::from_millis(1000), Duration::from_millis(1000)]
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(peers.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_delay() {
        let client = ReconnectingClient::new(
            |_: CancellationToken| async {
                Err(WebSocketError::IoError(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "refused",
                )))
            },
            options(),
        )
        .unwrap();

        let runner = client.clone();
        let task = tokio::spawn(async move { runner.run().await });

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(matches!(
            client.state(),
            ClientState::Reconnecting { attempt: 1, .. }
        ));

        client.cancel();
        assert!(matches!(
            task.await.unwrap(),
            Err(WebSocketError::Cancelled)
        ));
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_while_connecting() {
        let peers = Arc::new(std::sync::Mutex::new(Vec::new()));
        let keep = Arc::clone(&peers);
        let client = ReconnectingClient::new(
            move |_: CancellationToken| {
                let keep = Arc::clone(&keep);
                async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    let (stream, peer) = tokio::io::duplex(1024);
                    keep.lock().unwrap().push(peer);
                    Ok::<_, WebSocketError>(WebSocket::spawn(
                        Role::Client,
                        stream,
                        Options::default(),
                        Handlers::new(),
                    ))
                }
            },
            options(),
        )
        .unwrap();

        let runner = client.clone();
        let task = tokio::spawn(async move { runner.run().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(client.state(), ClientState::Connecting);
        client.close(CloseCode::Normal, "bye").await.unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(task.is_finished());
        assert!(task.await.unwrap().is_ok());
        assert_eq!(client.state(), ClientState::Disconnected);
        assert!(client.connection().is_none());
        assert!(peers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_closes_established_connection() {
        let (close_tx, mut close_rx) = tokio::sync::mpsc::unbounded_channel();
        let servers = Arc::new(std::sync::Mutex::new(Vec::new()));
        let keep = Arc::clone(&servers);
        let client = ReconnectingClient::new(
            move |_: CancellationToken| {
                let (stream, peer) = tokio::io::duplex(1024);
                let close_tx = close_tx.clone();
                let handlers = Handlers::new().on_close(
                    move |event: crate::CloseEvent, _: CancellationToken| {
                        let _ = close_tx.send(event);
                        async {}
                    },
                );
                keep.lock().unwrap().push(WebSocket::spawn(
                    Role::Server,
                    peer,
                    Options::default(),
                    handlers,
                ));
                async move {
                    Ok::<_, WebSocketError>(WebSocket::spawn(
                        Role::Client,
                        stream,
                        Options::default(),
                        Handlers::new(),
                    ))
                }
            },
            options(),
        )
        .unwrap();

        let runner = client.clone();
        let task = tokio::spawn(async move { runner.run().await });

        let mut states = client.state_changes();
        states
            .wait_for(|state| *state == ClientState::Connected)
            .await
            .unwrap();
        let ws = client.connection().unwrap();

        // stop without going through `close`, as when it raced the connector
        let _ = client
            .inner
            .stop_frame
            .set((CloseCode::Away, "shutting down".to_owned()));
        client.inner.stop.cancel();

        assert!(task.await.unwrap().is_ok());
        assert_eq!(client.state(), ClientState::Disconnected);
        assert!(ws.state().is_closed());

        let event = close_rx.recv().await.unwrap();
        assert_eq!(event.code, CloseCode::Away);
        assert_eq!(event.reason, "shutting down");
        assert!(event.was_clean);
    }

    #[tokio::test]
    async fn test_send_without_connection() {
        let client = ReconnectingClient::new(
            |_: CancellationToken| async { Err(WebSocketError::ConnectionClosed) },
            options(),
        )
        .unwrap();
        assert!(matches!(
            client.send(Message::text("hello")).await,
            Err(WebSocketError::ConnectionClosed)
        ));
    }
}

//! # Connection
//!
//! A [`WebSocket`] drives one upgraded stream. [`WebSocket::spawn`] splits the stream, puts
//! the write side behind a send lock and spawns a read loop that:
//!
//! - decodes frames and reassembles them into messages through a [`ReadHalf`]
//! - answers pings and feeds pongs to the keep-alive check
//! - runs the close handshake and the [`ConnectionState`] transitions
//! - closes the connection with the right status when the peer violates the protocol
//! - delivers connect, message, close and error events through their interceptor chains
//!
//! Sends may come from any number of tasks. Each one runs the pre-send chain, then takes the
//! send lock for all the frames of its message, so fragments of different messages never
//! interleave on the wire.
//!
//! One [`CancellationToken`] per connection reaches the read loop, the keep-alive pings, sends
//! waiting for the lock and the close handshake wait.
use std::{sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, watch, Mutex},
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};

use crate::{
    close::{CloseCode, CloseReason},
    codec::{Decoder, Encoder},
    frame::{Frame, Message, OpCode, MAX_CONTROL_PAYLOAD},
    interceptor::{Chain, Handler, Interceptor, Pipeline},
    Options, Result, WebSocketError,
};

mod keepalive;
mod split;
mod state;

use keepalive::KeepAlive;
pub use split::{ReadHalf, WriteHalf};
use state::CloseAction;
pub use state::ConnectionState;

/// The role of an endpoint.
///
/// When a server role is taken the frames will not be masked, unlike
/// the client role, in which frames are masked.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Server => {
                write!(f, "server")
            }
            Self::Client => {
                write!(f, "client")
            }
        }
    }
}

/// Delivered to the connect chain once the connection is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectInfo {
    pub role: Role,
    /// Subprotocol agreed on during the handshake.
    pub subprotocol: Option<String>,
    /// Whether permessage-deflate is active.
    pub compression: bool,
}

/// Delivered to the close chain when the connection reached [`ConnectionState::Closed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    /// Code from the close frame, or [`CloseCode::Abnormal`] when the connection dropped.
    pub code: CloseCode,
    pub reason: String,
    /// Whether close frames were exchanged in both directions.
    pub was_clean: bool,
}

impl CloseEvent {
    fn clean(reason: CloseReason) -> Self {
        Self {
            code: reason.code,
            reason: reason.reason,
            was_clean: true,
        }
    }

    fn abnormal() -> Self {
        Self {
            code: CloseCode::Abnormal,
            reason: String::new(),
            was_clean: false,
        }
    }
}

/// A terminal handler plus the interceptors wrapped around it.
struct Event<A, R> {
    terminal: Chain<A, R>,
    pipeline: Pipeline<A, R>,
}

impl<A, R> Event<A, R>
where
    A: Send + 'static,
    R: Send + 'static,
{
    fn new(terminal: Chain<A, R>) -> Self {
        Self {
            terminal,
            pipeline: Pipeline::new(),
        }
    }

    fn build(&self) -> Chain<A, R> {
        self.pipeline.build(Arc::clone(&self.terminal))
    }
}

fn noop<A: Send + 'static>() -> Chain<A, ()> {
    Arc::new(|_: A, _: CancellationToken| async {})
}

/// Application callbacks of a connection, each with its own interceptor chain.
///
/// Handlers are set with the `on_*` methods, interceptors are appended with the
/// `intercept_*` methods and run in the order they were added. Every event without a handler
/// is dropped, and outgoing messages pass through unchanged unless a send interceptor
/// rewrites or drops them.
///
/// Handlers run on the connection's read loop: the next frame is not read until they return.
/// A message handler must not wait for [`WebSocket::close`] to finish, since the reply it
/// waits for is read by the very loop it is blocking. Spawn the close instead.
///
/// Keep-alive pings are not sent while a message handler runs. A pong left unread behind a
/// slow handler does not count as missing: the deadline is extended by one keep-alive
/// interval.
pub struct Handlers {
    connect: Event<ConnectInfo, ()>,
    message: Event<Message, ()>,
    close: Event<CloseEvent, ()>,
    error: Event<Arc<WebSocketError>, ()>,
    send: Event<Message, Option<Message>>,
}

impl Default for Handlers {
    fn default() -> Self {
        let send: Chain<Message, Option<Message>> =
            Arc::new(|message: Message, _: CancellationToken| async move { Some(message) });

        Self {
            connect: Event::new(noop()),
            message: Event::new(noop()),
            close: Event::new(noop()),
            error: Event::new(noop()),
            send: Event::new(send),
        }
    }
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handlers that forward every incoming message into a bounded channel.
    ///
    /// The receiver yields `None` once the connection is closed.
    pub fn channel() -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(64);
        let handlers = Self::default().on_message(move |message: Message, _: CancellationToken| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message).await;
            }
        });
        (handlers, rx)
    }

    pub fn on_connect<H: Handler<ConnectInfo, ()> + 'static>(mut self, handler: H) -> Self {
        self.connect.terminal = Arc::new(handler);
        self
    }

    pub fn on_message<H: Handler<Message, ()> + 'static>(mut self, handler: H) -> Self {
        self.message.terminal = Arc::new(handler);
        self
    }

    pub fn on_close<H: Handler<CloseEvent, ()> + 'static>(mut self, handler: H) -> Self {
        self.close.terminal = Arc::new(handler);
        self
    }

    /// Errors that ended the connection or were reported by the peer's misbehaviour.
    pub fn on_error<H: Handler<Arc<WebSocketError>, ()> + 'static>(mut self, handler: H) -> Self {
        self.error.terminal = Arc::new(handler);
        self
    }

    pub fn intercept_connect<I: Interceptor<ConnectInfo, ()> + 'static>(
        mut self,
        interceptor: I,
    ) -> Self {
        self.connect.pipeline.push(interceptor);
        self
    }

    pub fn intercept_message<I: Interceptor<Message, ()> + 'static>(
        mut self,
        interceptor: I,
    ) -> Self {
        self.message.pipeline.push(interceptor);
        self
    }

    pub fn intercept_close<I: Interceptor<CloseEvent, ()> + 'static>(
        mut self,
        interceptor: I,
    ) -> Self {
        self.close.pipeline.push(interceptor);
        self
    }

    pub fn intercept_error<I: Interceptor<Arc<WebSocketError>, ()> + 'static>(
        mut self,
        interceptor: I,
    ) -> Self {
        self.error.pipeline.push(interceptor);
        self
    }

    /// Adds a pre-send interceptor. Returning `None` drops the message.
    pub fn intercept_send<I: Interceptor<Message, Option<Message>> + 'static>(
        mut self,
        interceptor: I,
    ) -> Self {
        self.send.pipeline.push(interceptor);
        self
    }
}

/// Composed chains of the events raised by the read loop.
struct Events {
    connect: Chain<ConnectInfo, ()>,
    message: Chain<Message, ()>,
    close: Chain<CloseEvent, ()>,
    error: Chain<Arc<WebSocketError>, ()>,
}

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Everything guarded by the send lock.
struct Writer {
    sink: FramedWrite<BoxedWrite, Encoder>,
    half: WriteHalf,
}

struct Shared {
    role: Role,
    writer: Mutex<Writer>,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
    send_chain: Chain<Message, Option<Message>>,
    close_timeout: Duration,
    fragment_size: Option<usize>,
}

/// Handle to a running WebSocket connection.
///
/// Cloning the handle is cheap; all clones drive the same connection.
#[derive(Clone)]
pub struct WebSocket {
    shared: Arc<Shared>,
}

impl WebSocket {
    /// Takes over an upgraded stream and starts the read loop on the current tokio runtime.
    ///
    /// `options` carries what the handshake negotiated. The connection is
    /// [`ConnectionState::Open`] when this returns.
    pub fn spawn<S>(role: Role, stream: S, options: Options, handlers: Handlers) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        let read: BoxedRead = Box::new(read);
        let write: BoxedWrite = Box::new(write);

        let decoder = Decoder::new(role, options.max_payload_read);
        let encoder = Encoder::new(role, options.resources.clone());
        let read_half = ReadHalf::new(role, &options);
        let write_half = WriteHalf::new(role, &options);

        let info = ConnectInfo {
            role,
            subprotocol: options.subprotocol.clone(),
            compression: write_half.is_compressed(),
        };

        let (state, _) = watch::channel(ConnectionState::Connecting);
        let shared = Arc::new(Shared {
            role,
            writer: Mutex::new(Writer {
                sink: FramedWrite::new(write, encoder),
                half: write_half,
            }),
            state,
            cancel: CancellationToken::new(),
            send_chain: handlers.send.build(),
            close_timeout: options.close_timeout,
            fragment_size: options.fragment_size,
        });

        shared.transition(ConnectionState::on_open);

        let events = Events {
            connect: handlers.connect.build(),
            message: handlers.message.build(),
            close: handlers.close.build(),
            error: handlers.error.build(),
        };

        let reader = Reader {
            shared: Arc::clone(&shared),
            stream: FramedRead::new(read, decoder),
            half: read_half,
            keep_alive: options.keep_alive().map(KeepAlive::new),
            events,
        };
        tokio::spawn(reader.run(info));

        Self { shared }
    }

    /// The role of this endpoint.
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// The current state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Subscribes to state changes.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Waits until the connection reached [`ConnectionState::Closed`].
    pub async fn closed(&self) {
        let mut states = self.shared.state.subscribe();
        let _ = states.wait_for(|state| state.is_closed()).await;
    }

    /// Aborts every in-flight operation of this connection and drops it without a close
    /// handshake.
    pub fn cancel(&self) {
        self.shared.cancel.cancel();
    }

    /// The cancellation token of this connection.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Sends a message, fragmenting it when [`Options::fragment_size`] is set.
    ///
    /// The message passes through the send interceptors first, which may rewrite or drop it.
    ///
    /// # Errors
    /// - [`WebSocketError::ConnectionClosed`] unless the connection is open
    /// - [`WebSocketError::Cancelled`] when the connection was cancelled meanwhile
    pub async fn send(&self, message: Message) -> Result<()> {
        self.send_with(message, self.shared.fragment_size).await
    }

    /// Sends a message as frames of at most `fragment_size` payload bytes.
    pub async fn send_fragmented(&self, message: Message, fragment_size: usize) -> Result<()> {
        if fragment_size == 0 {
            return Err(WebSocketError::InvalidArgument(
                "fragment size must be positive",
            ));
        }
        self.send_with(message, Some(fragment_size)).await
    }

    /// Serializes data to JSON and sends it as a text message.
    #[cfg(feature = "json")]
    #[cfg_attr(docsrs, doc(cfg(feature = "json")))]
    pub async fn send_json<T: serde::Serialize>(&self, data: &T) -> Result<()> {
        let bytes = serde_json::to_vec(data)?;
        self.send(Message::text(bytes)).await
    }

    /// Sends a ping. The answer is handled by the connection.
    pub async fn ping(&self, payload: impl AsRef<[u8]>) -> Result<()> {
        let payload = payload.as_ref();
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(WebSocketError::ControlFrameTooLarge);
        }
        self.shared.ensure_open()?;
        self.shared.write_frames(vec![Frame::ping(payload)]).await
    }

    /// Starts the close handshake and waits for it to finish.
    ///
    /// The wait is bounded by [`Options::close_timeout`]. When it elapses the connection is
    /// force-closed and [`WebSocketError::CloseTimeout`] is returned. Closing a connection
    /// whose handshake is already in progress waits for that handshake.
    ///
    /// # Errors
    /// - [`WebSocketError::InvalidArgument`] for codes that may not be sent or reasons longer
    ///   than 123 bytes
    /// - [`WebSocketError::ConnectionClosed`] if the connection is already closed
    /// - [`WebSocketError::CloseTimeout`] if the peer did not answer in time
    pub async fn close(&self, code: CloseCode, reason: &str) -> Result<()> {
        let shared = &self.shared;
        if !code.is_allowed() && code != CloseCode::Status {
            return Err(WebSocketError::InvalidArgument("close code may not be sent"));
        }
        if reason.len() + 2 > MAX_CONTROL_PAYLOAD {
            return Err(WebSocketError::InvalidArgument("close reason too long"));
        }

        let initiated = shared.transition(ConnectionState::on_close_initiated);
        if !initiated && shared.state().is_closed() {
            return Err(WebSocketError::ConnectionClosed);
        }

        if initiated {
            let frame = Frame::close_raw(CloseReason::new(code, reason).encode());
            if let Err(err) = shared.write_frames(vec![frame]).await {
                shared.force_close();
                return Err(err);
            }
        }

        let mut states = shared.state.subscribe();
        let wait = tokio::time::timeout(
            shared.close_timeout,
            states.wait_for(|state| state.is_closed()),
        );

        tokio::select! {
            _ = shared.cancel.cancelled() => Err(WebSocketError::Cancelled),
            res = wait => match res {
                Ok(_) => Ok(()),
                Err(_) => {
                    #[cfg(feature = "logging")]
                    log::debug!("{} close handshake timed out", shared.role);

                    shared.force_close();
                    Err(WebSocketError::CloseTimeout)
                }
            },
        }
    }

    async fn send_with(&self, message: Message, fragment_size: Option<usize>) -> Result<()> {
        let shared = &self.shared;
        shared.ensure_open()?;

        let message = match shared
            .send_chain
            .call(message, shared.cancel.clone())
            .await
        {
            Some(message) => message,
            None => return Ok(()),
        };

        tokio::select! {
            _ = shared.cancel.cancelled() => Err(WebSocketError::Cancelled),
            res = shared.write_message(&message, fragment_size) => res,
        }
    }
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state().is_open() {
            Ok(())
        } else {
            Err(WebSocketError::ConnectionClosed)
        }
    }

    /// Applies a transition atomically. Returns whether the state changed.
    fn transition(&self, next: impl FnOnce(ConnectionState) -> Option<ConnectionState>) -> bool {
        self.state.send_if_modified(|state| match next(*state) {
            Some(next) if !state.is_closed() && next != *state => {
                #[cfg(feature = "logging")]
                log::debug!("{} connection {} -> {}", self.role, state, next);

                *state = next;
                true
            }
            _ => false,
        })
    }

    /// Moves to [`ConnectionState::Closed`] without cancelling anything.
    fn force_close_state(&self) {
        self.transition(|_| Some(ConnectionState::Closed));
    }

    /// Moves straight to [`ConnectionState::Closed`] and stops the read loop.
    fn force_close(&self) {
        self.force_close_state();
        self.cancel.cancel();
    }

    async fn write_message(&self, message: &Message, fragment_size: Option<usize>) -> Result<()> {
        let mut writer = self.writer.lock().await;
        // the connection may have closed while we waited for the lock
        self.ensure_open()?;

        let Writer { sink, half } = &mut *writer;
        let frames = half.frames(message, fragment_size)?;
        let res = feed_all(sink, frames).await;
        if matches!(res, Err(WebSocketError::IoError(_))) {
            self.force_close();
        }
        res
    }

    /// Writes frames under the send lock, bypassing the state check.
    async fn write_frames(&self, frames: Vec<Frame>) -> Result<()> {
        let write = async {
            let mut writer = self.writer.lock().await;
            feed_all(&mut writer.sink, frames).await
        };
        let res = tokio::select! {
            _ = self.cancel.cancelled() => Err(WebSocketError::Cancelled),
            res = write => res,
        };
        if matches!(res, Err(WebSocketError::IoError(_))) {
            self.force_close();
        }
        res
    }

    async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.sink.close().await;
    }
}

async fn feed_all(sink: &mut FramedWrite<BoxedWrite, Encoder>, frames: Vec<Frame>) -> Result<()> {
    for frame in frames {
        sink.feed(frame).await?;
    }
    sink.flush().await
}

/// State owned by the read loop.
struct Reader {
    shared: Arc<Shared>,
    stream: FramedRead<BoxedRead, Decoder>,
    half: ReadHalf,
    keep_alive: Option<KeepAlive>,
    events: Events,
}

/// What a processed frame means for the read loop.
enum Flow {
    Continue,
    Stop(CloseEvent),
}

impl Reader {
    async fn run(mut self, info: ConnectInfo) {
        let cancel = self.shared.cancel.clone();
        self.events.connect.call(info, cancel.clone()).await;

        let close = self.read_loop(&cancel).await;

        #[cfg(feature = "logging")]
        log::debug!(
            "{} read loop finished with {} (clean={})",
            self.shared.role,
            close.code,
            close.was_clean
        );

        self.shared.force_close_state();
        let _ = tokio::time::timeout(self.shared.close_timeout, self.shared.shutdown()).await;
        self.events.close.call(close, cancel.clone()).await;
        cancel.cancel();
    }

    async fn read_loop(&mut self, cancel: &CancellationToken) -> CloseEvent {
        let shared = Arc::clone(&self.shared);
        let keep_alive = self.keep_alive.take();

        let pings = async {
            match &keep_alive {
                Some(keep_alive) => {
                    keep_alive
                        .run(cancel, || shared.write_frames(vec![Frame::ping(b"")]))
                        .await
                }
                None => std::future::pending().await,
            }
        };
        tokio::pin!(pings);

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return CloseEvent::abnormal(),
                res = &mut pings => {
                    return match res {
                        Ok(()) => CloseEvent::abnormal(),
                        Err(err) => self.fail(err, cancel).await,
                    };
                }
                next = self.stream.next() => next,
            };

            let flow = match next {
                Some(Ok(frame)) => match self.on_frame(frame, keep_alive.as_ref()).await {
                    Ok(flow) => flow,
                    Err(err) => Flow::Stop(self.fail(err, cancel).await),
                },
                Some(Err(err)) => Flow::Stop(self.fail(err, cancel).await),
                None => {
                    #[cfg(feature = "logging")]
                    log::debug!("{} stream ended without a close frame", shared.role);

                    Flow::Stop(CloseEvent::abnormal())
                }
            };

            if let Flow::Stop(close) = flow {
                return close;
            }
        }
    }

    async fn on_frame(&mut self, frame: Frame, keep_alive: Option<&KeepAlive>) -> Result<Flow> {
        match frame.opcode {
            OpCode::Ping => {
                if !self.shared.state().is_closed() {
                    self.shared
                        .write_frames(vec![Frame::pong(&frame.payload)])
                        .await?;
                }
                Ok(Flow::Continue)
            }
            OpCode::Pong => {
                if let Some(keep_alive) = keep_alive {
                    keep_alive.on_pong();
                }
                Ok(Flow::Continue)
            }
            OpCode::Close => self.on_close(frame).await,
            _ => {
                if let Some(message) = self.half.on_frame(frame)? {
                    let _hold = keep_alive.map(KeepAlive::hold);
                    self.events
                        .message
                        .call(message, self.shared.cancel.clone())
                        .await;
                }
                Ok(Flow::Continue)
            }
        }
    }

    async fn on_close(&mut self, frame: Frame) -> Result<Flow> {
        let reason = CloseReason::parse(&frame.payload)?;
        if !frame.payload.is_empty() && !reason.code.is_allowed() {
            return Err(WebSocketError::InvalidCloseCode);
        }

        let mut action = CloseAction::Abort;
        self.shared.state.send_if_modified(|state| {
            let (next, next_action) = state.on_close_frame();
            action = next_action;

            #[cfg(feature = "logging")]
            log::debug!("{} connection {} -> {}", self.shared.role, state, next);

            let changed = *state != next;
            *state = next;
            changed
        });

        match action {
            CloseAction::Respond => {
                let echo = Frame::close_raw(&frame.payload);
                let res = self.shared.write_frames(vec![echo]).await;
                self.shared.state.send_if_modified(|state| {
                    let changed = !state.is_closed();
                    *state = state.on_close_response_sent();
                    changed
                });

                Ok(Flow::Stop(CloseEvent {
                    was_clean: res.is_ok(),
                    ..CloseEvent::clean(reason)
                }))
            }
            CloseAction::Complete => Ok(Flow::Stop(CloseEvent::clean(reason))),
            CloseAction::Abort => {
                #[cfg(feature = "logging")]
                log::warn!(
                    "{} received a close frame outside of the open state, dropping the connection",
                    self.shared.role
                );

                Ok(Flow::Stop(CloseEvent::abnormal()))
            }
        }
    }

    /// Ends the connection because of `err`.
    ///
    /// Protocol violations are answered with a close frame carrying the matching status,
    /// provided no close frame was sent yet. The error goes through the error chain.
    async fn fail(&mut self, err: WebSocketError, cancel: &CancellationToken) -> CloseEvent {
        #[cfg(feature = "logging")]
        log::debug!("{} connection failed: {err}", self.shared.role);

        let code = err.close_code();
        let mut close = CloseEvent::abnormal();

        if let Some(code) = code {
            if self.shared.transition(ConnectionState::on_close_initiated) {
                let reason = truncate(&err.to_string(), MAX_CONTROL_PAYLOAD - 2).to_owned();
                let frame = Frame::close_raw(CloseReason::new(code, reason.clone()).encode());
                // the peer may have stopped reading
                let write = self.shared.write_frames(vec![frame]);
                let _ = tokio::time::timeout(self.shared.close_timeout, write).await;
                close = CloseEvent {
                    code,
                    reason,
                    was_clean: false,
                };
            }
        }

        self.shared.force_close_state();
        self.events.error.call(Arc::new(err), cancel.clone()).await;
        close
    }
}

/// Cuts `s` to at most `max` bytes on a character boundary.
fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

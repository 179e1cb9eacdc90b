use crate::config::Configuration;
use crate::data_channel::DataChannel;
use crate::description::{IceCandidate, SessionDescription};
use crate::diagnostics::{diag, Diagnostics};
use crate::engine::{
    default_backend, engine_events, Backend, DataChannelInit, EngineEvent, EngineEvents,
    IceCandidateError, Notification, PeerConnectionEngine,
};
use crate::error::{Error, Result};
use crate::handler::{spawn, HandlerSlot, MaybeSendSync};
use crate::media::MediaStream;
use crate::state::{
    DescriptionSide, IceConnectionState, IceGatheringState, Negotiation, PeerConnectionState,
    SignalingState,
};
use arc_swap::ArcSwap;
use log::Level;
use std::fmt::Formatter;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

/// Settings of a single [PeerConnection] which are not part of the connection policy.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub diagnostics: Diagnostics,
}

impl Options {
    pub fn with_diagnostics(diagnostics: Diagnostics) -> Self {
        Options { diagnostics }
    }
}

/// WebRTC peer connection, independent of the engine running underneath.
///
/// The connection is the only owner of its state: engine progress is reported as events,
/// validated against the legal transitions and only then applied and passed on to the
/// registered handlers. Every event category has a single handler slot, registering a new
/// handler replaces the previous one. Events of one connection are delivered in the order the
/// engine detected them, on a task of their own.
///
/// Descriptions and candidates have to be exchanged with the remote peer by the application:
///
/// 1. Offerer calls [PeerConnection::create_offer] and [PeerConnection::set_local_description],
///    then sends the offer over.
/// 2. Answerer applies it with [PeerConnection::set_remote_description], then does the same
///    with [PeerConnection::create_answer] and sends the answer back.
/// 3. Offerer applies the answer. Both sides forward candidates coming from
///    [PeerConnection::on_ice_candidate] and feed the remote ones to
///    [PeerConnection::add_ice_candidate].
///
/// Use [PeerConnection::connected] in order to await for connection to be established.
/// Use [PeerConnection::close] in order to gracefully close the connection.
pub struct PeerConnection {
    shared: Arc<Shared>,
}

struct Shared {
    config: Configuration,
    backend: &'static str,
    engine: Box<dyn PeerConnectionEngine>,
    events: EngineEvents,
    negotiation: ArcSwap<Negotiation>,
    transport: watch::Sender<Transport>,
    /// Serializes create/set/add operations, so that a transition is checked, applied by the
    /// engine and committed as one step.
    op_lock: Mutex<()>,
    closed: CancellationToken,
    closing: AtomicBool,
    diagnostics: Diagnostics,
    handlers: Handlers,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Transport {
    gathering: IceGatheringState,
    ice: IceConnectionState,
    connection: PeerConnectionState,
}

struct Handlers {
    negotiation_needed: HandlerSlot<()>,
    ice_candidate: HandlerSlot<IceCandidate>,
    ice_candidate_error: HandlerSlot<IceCandidateError>,
    signaling_state_change: HandlerSlot<SignalingState>,
    ice_connection_state_change: HandlerSlot<IceConnectionState>,
    ice_gathering_state_change: HandlerSlot<IceGatheringState>,
    connection_state_change: HandlerSlot<PeerConnectionState>,
    data_channel: HandlerSlot<DataChannel>,
    add_stream: HandlerSlot<MediaStream>,
    remove_stream: HandlerSlot<MediaStream>,
}

impl Default for Handlers {
    fn default() -> Self {
        Handlers {
            negotiation_needed: HandlerSlot::new("on_negotiation_needed"),
            ice_candidate: HandlerSlot::new("on_ice_candidate"),
            ice_candidate_error: HandlerSlot::new("on_ice_candidate_error"),
            signaling_state_change: HandlerSlot::new("on_signaling_state_change"),
            ice_connection_state_change: HandlerSlot::new("on_ice_connection_state_change"),
            ice_gathering_state_change: HandlerSlot::new("on_ice_gathering_state_change"),
            connection_state_change: HandlerSlot::new("on_connection_state_change"),
            data_channel: HandlerSlot::new("on_data_channel"),
            add_stream: HandlerSlot::new("on_add_stream"),
            remove_stream: HandlerSlot::new("on_remove_stream"),
        }
    }
}

fn stream_closed() -> Error {
    Error::Closed("cannot add a stream to a closed connection".into())
}

impl PeerConnection {
    /// Creates a new connection on the engine built for the current target.
    pub async fn new(config: Configuration) -> Result<Self> {
        Self::with_options(config, Options::default()).await
    }

    pub async fn with_options(config: Configuration, options: Options) -> Result<Self> {
        Self::with_backend(config, options, default_backend()).await
    }

    /// Creates a new connection on top of the given `backend`.
    ///
    /// The configuration is validated before the backend is involved. The backend then fails
    /// with [Error::UnsupportedPolicy] for policy names it has no equivalent of and with
    /// [Error::Configuration] if it rejects the translated configuration.
    pub async fn with_backend(
        config: Configuration,
        options: Options,
        backend: Arc<dyn Backend>,
    ) -> Result<Self> {
        config.validate()?;
        let (events, queue) = engine_events();
        let engine = backend.connect(&config, events.clone()).await?;
        diag!(
            options.diagnostics,
            Level::Info,
            "peer connection created on {} backend",
            backend.name()
        );

        let closed = CancellationToken::new();
        let (transport, _) = watch::channel(Transport::default());
        let shared = Arc::new(Shared {
            config,
            backend: backend.name(),
            engine,
            events,
            negotiation: ArcSwap::from_pointee(Negotiation::default()),
            transport,
            op_lock: Mutex::new(()),
            closed: closed.clone(),
            closing: AtomicBool::new(false),
            diagnostics: options.diagnostics,
            handlers: Handlers::default(),
        });
        spawn(dispatch(Arc::downgrade(&shared), closed, queue));
        Ok(PeerConnection { shared })
    }

    pub fn configuration(&self) -> &Configuration {
        &self.shared.config
    }

    /// Name of the backend this connection runs on.
    pub fn backend(&self) -> &'static str {
        self.shared.backend
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.shared.negotiation.load().state()
    }

    pub fn ice_gathering_state(&self) -> IceGatheringState {
        self.shared.transport.borrow().gathering
    }

    pub fn ice_connection_state(&self) -> IceConnectionState {
        self.shared.transport.borrow().ice
    }

    pub fn connection_state(&self) -> PeerConnectionState {
        self.shared.transport.borrow().connection
    }

    /// Pending local description if an offer or a provisional answer is outstanding, the
    /// current one otherwise.
    pub fn local_description(&self) -> Option<SessionDescription> {
        self.shared.negotiation.load().local_description().cloned()
    }

    /// Pending remote description if an offer or a provisional answer is outstanding, the
    /// current one otherwise.
    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.shared.negotiation.load().remote_description().cloned()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    pub async fn create_offer(&self) -> Result<SessionDescription> {
        let shared = &self.shared;
        shared
            .exclusive(Error::connection_closed, async {
                let offer = shared.engine.create_offer().await?;
                diag!(shared.diagnostics, Level::Debug, "created offer");
                Ok(offer)
            })
            .await
    }

    /// Generates an answer to the remote offer. Only legal while a remote offer (or our own
    /// provisional answer to it) is pending.
    pub async fn create_answer(&self) -> Result<SessionDescription> {
        let shared = &self.shared;
        shared
            .exclusive(Error::connection_closed, async {
                let state = shared.negotiation.load().state();
                if !state.can_create_answer() {
                    return Err(Error::Negotiation(format!(
                        "cannot create answer in signaling state {state}"
                    )));
                }
                let answer = shared.engine.create_answer().await?;
                diag!(shared.diagnostics, Level::Debug, "created answer");
                Ok(answer)
            })
            .await
    }

    pub async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.shared.apply(DescriptionSide::Local, desc).await
    }

    pub async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.shared.apply(DescriptionSide::Remote, desc).await
    }

    /// Feeds a candidate discovered by the remote peer into the connectivity checks.
    ///
    /// Fails with [Error::Ice] when the candidate is malformed or no remote description has
    /// been set yet. Both are detected before the engine is involved.
    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let shared = &self.shared;
        shared
            .exclusive(Error::ice_closed, async {
                candidate.validate()?;
                if shared.negotiation.load().remote_description().is_none() {
                    return Err(Error::Ice(
                        "cannot add ice candidate before a remote description is set".into(),
                    ));
                }
                shared.engine.add_ice_candidate(&candidate).await
            })
            .await
    }

    /// Attaches the tracks of a media stream to this connection.
    pub async fn add_stream(&self, stream: &MediaStream) -> Result<()> {
        let shared = &self.shared;
        shared
            .exclusive(stream_closed, async {
                shared.engine.add_stream(stream).await?;
                diag!(shared.diagnostics, Level::Debug, "added stream '{}'", stream.id());
                Ok(())
            })
            .await
    }

    /// Opens a new ordered and reliable data channel.
    pub async fn create_data_channel(&self, label: &str) -> Result<DataChannel> {
        self.create_data_channel_with(label, DataChannelInit::default())
            .await
    }

    pub async fn create_data_channel_with(
        &self,
        label: &str,
        init: DataChannelInit,
    ) -> Result<DataChannel> {
        if label.len() > u16::MAX as usize {
            return Err(Error::Validation(
                "data channel label must not exceed 65535 bytes".into(),
            ));
        }
        let shared = &self.shared;
        let binding = shared
            .exclusive(
                Error::connection_channel_closed,
                shared.engine.create_data_channel(label, &init),
            )
            .await?;
        let dc = DataChannel::new(
            binding.engine,
            shared.diagnostics.clone(),
            shared.closed.child_token(),
        );
        dc.listen(binding.events);
        diag!(shared.diagnostics, Level::Debug, "created data channel '{label}'");
        Ok(dc)
    }

    /// Waits until the connection is established.
    ///
    /// Fails if the connection failed or was closed meanwhile.
    pub async fn connected(&self) -> Result<()> {
        let mut transport = self.shared.transport.subscribe();
        loop {
            let state = transport.borrow_and_update().connection;
            match state {
                PeerConnectionState::Connected => return Ok(()),
                PeerConnectionState::Failed => {
                    return Err(Error::Ice("peer connection failed".into()))
                }
                PeerConnectionState::Closed => return Err(Error::connection_closed()),
                _ => {}
            }
            if transport.changed().await.is_err() {
                return Err(Error::connection_closed());
            }
        }
    }

    /// Gracefully closes current [PeerConnection].
    ///
    /// Pending operations resolve with an error, data channels of this connection become
    /// closed and no further events are delivered. Closing a closed connection is a no-op.
    pub async fn close(&self) -> Result<()> {
        let shared = &self.shared;
        if shared.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        shared.closed.cancel();
        shared.negotiation.rcu(|current| {
            let mut next = Negotiation::clone(current);
            next.close();
            next
        });
        shared.transport.send_modify(|t| {
            t.ice = IceConnectionState::Closed;
            t.connection = PeerConnectionState::Closed;
        });
        diag!(shared.diagnostics, Level::Info, "peer connection closed");
        shared.engine.close().await
    }

    pub fn on_negotiation_needed<F>(&self, f: F)
    where
        F: Fn() + MaybeSendSync + 'static,
    {
        self.shared
            .handlers
            .negotiation_needed
            .set(Box::new(move |()| f()));
    }

    /// Registers the handler receiving local candidates, which have to be sent to the remote
    /// peer.
    pub fn on_ice_candidate<F>(&self, f: F)
    where
        F: Fn(IceCandidate) + MaybeSendSync + 'static,
    {
        self.shared.handlers.ice_candidate.set(Box::new(f));
    }

    pub fn on_ice_candidate_error<F>(&self, f: F)
    where
        F: Fn(IceCandidateError) + MaybeSendSync + 'static,
    {
        self.shared.handlers.ice_candidate_error.set(Box::new(f));
    }

    pub fn on_signaling_state_change<F>(&self, f: F)
    where
        F: Fn(SignalingState) + MaybeSendSync + 'static,
    {
        self.shared.handlers.signaling_state_change.set(Box::new(f));
    }

    pub fn on_ice_connection_state_change<F>(&self, f: F)
    where
        F: Fn(IceConnectionState) + MaybeSendSync + 'static,
    {
        self.shared
            .handlers
            .ice_connection_state_change
            .set(Box::new(f));
    }

    pub fn on_ice_gathering_state_change<F>(&self, f: F)
    where
        F: Fn(IceGatheringState) + MaybeSendSync + 'static,
    {
        self.shared
            .handlers
            .ice_gathering_state_change
            .set(Box::new(f));
    }

    pub fn on_connection_state_change<F>(&self, f: F)
    where
        F: Fn(PeerConnectionState) + MaybeSendSync + 'static,
    {
        self.shared.handlers.connection_state_change.set(Box::new(f));
    }

    /// Registers the handler receiving channels opened by the remote peer. The channel starts
    /// delivering its own events once this handler returns, so handlers registered on it from
    /// within don't miss any.
    pub fn on_data_channel<F>(&self, f: F)
    where
        F: Fn(DataChannel) + MaybeSendSync + 'static,
    {
        self.shared.handlers.data_channel.set(Box::new(f));
    }

    pub fn on_add_stream<F>(&self, f: F)
    where
        F: Fn(MediaStream) + MaybeSendSync + 'static,
    {
        self.shared.handlers.add_stream.set(Box::new(f));
    }

    pub fn on_remove_stream<F>(&self, f: F)
    where
        F: Fn(MediaStream) + MaybeSendSync + 'static,
    {
        self.shared.handlers.remove_stream.set(Box::new(f));
    }
}

impl Shared {
    /// Runs `op` exclusively with other create/set/add operations. Resolves with `on_close()`
    /// as soon as the connection gets closed, whether `op` started already or not.
    async fn exclusive<T, F>(&self, on_close: fn() -> Error, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.closed.is_cancelled() {
            return Err(on_close());
        }
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(on_close()),
            result = async {
                let _op = self.op_lock.lock().await;
                op.await
            } => result,
        }
    }

    async fn apply(&self, side: DescriptionSide, desc: SessionDescription) -> Result<()> {
        self.exclusive(Error::connection_closed, async {
            self.negotiation.load().check(side, &desc)?;
            match side {
                DescriptionSide::Local => self.engine.set_local_description(&desc).await?,
                DescriptionSide::Remote => self.engine.set_remote_description(&desc).await?,
            }
            diag!(
                self.diagnostics,
                Level::Debug,
                "applied {side} {} description",
                desc.sdp_type()
            );
            self.commit(side, desc);
            Ok(())
        })
        .await
    }

    fn commit(&self, side: DescriptionSide, desc: SessionDescription) {
        let prev = self.negotiation.rcu(|current| {
            let mut next = Negotiation::clone(current);
            next.commit(side, desc.clone());
            next
        });
        let state = self.negotiation.load().state();
        if state != prev.state() && !self.closed.is_cancelled() {
            diag!(
                self.diagnostics,
                Level::Debug,
                "signaling state {} -> {}",
                prev.state(),
                state
            );
            self.events.signaling(state);
        }
    }

    /// Moves one of the transport states to `next` if `allowed`. Returns `true` if the state
    /// has changed.
    fn advance<S: Copy>(
        &self,
        next: S,
        field: fn(&mut Transport) -> &mut S,
        allowed: fn(S, S) -> bool,
    ) -> bool {
        self.transport.send_if_modified(|t| {
            let current = field(t);
            if allowed(*current, next) {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    fn deliver(&self, notification: Notification) {
        let handlers = &self.handlers;
        let event = match notification {
            Notification::Signaling(state) => {
                handlers.signaling_state_change.emit(state);
                return;
            }
            Notification::Engine(event) => event,
        };
        match event {
            EngineEvent::NegotiationNeeded => {
                diag!(self.diagnostics, Level::Debug, "negotiation needed");
                handlers.negotiation_needed.emit(());
            }
            EngineEvent::IceCandidate(candidate) => {
                diag!(
                    self.diagnostics,
                    Level::Trace,
                    "local candidate: {}",
                    candidate.candidate()
                );
                handlers.ice_candidate.emit(candidate);
            }
            EngineEvent::IceCandidateError(e) => {
                diag!(
                    self.diagnostics,
                    Level::Warn,
                    "candidate gathering failed for {}: {} {}",
                    e.url,
                    e.error_code,
                    e.error_text
                );
                handlers.ice_candidate_error.emit(e);
            }
            EngineEvent::IceGatheringStateChange(state) => {
                if self.advance(
                    state,
                    |t| &mut t.gathering,
                    IceGatheringState::can_transition_to,
                ) {
                    diag!(self.diagnostics, Level::Debug, "ice gathering state: {state}");
                    handlers.ice_gathering_state_change.emit(state);
                } else {
                    self.ignored("ice gathering", state);
                }
            }
            EngineEvent::IceConnectionStateChange(state) => {
                if self.advance(state, |t| &mut t.ice, IceConnectionState::can_transition_to) {
                    diag!(self.diagnostics, Level::Debug, "ice connection state: {state}");
                    handlers.ice_connection_state_change.emit(state);
                } else {
                    self.ignored("ice connection", state);
                }
            }
            EngineEvent::ConnectionStateChange(state) => {
                if self.advance(
                    state,
                    |t| &mut t.connection,
                    PeerConnectionState::can_transition_to,
                ) {
                    diag!(self.diagnostics, Level::Info, "connection state: {state}");
                    handlers.connection_state_change.emit(state);
                } else {
                    self.ignored("connection", state);
                }
            }
            EngineEvent::DataChannel(binding) => {
                let dc = DataChannel::new(
                    binding.engine,
                    self.diagnostics.clone(),
                    self.closed.child_token(),
                );
                diag!(
                    self.diagnostics,
                    Level::Debug,
                    "remote peer opened data channel '{}'",
                    dc.label()
                );
                handlers.data_channel.emit(dc.clone());
                dc.listen(binding.events);
            }
            EngineEvent::AddStream(stream) => {
                diag!(self.diagnostics, Level::Debug, "remote stream '{}' added", stream.id());
                handlers.add_stream.emit(stream);
            }
            EngineEvent::RemoveStream(stream) => {
                diag!(self.diagnostics, Level::Debug, "remote stream '{}' removed", stream.id());
                handlers.remove_stream.emit(stream);
            }
        }
    }

    fn ignored(&self, kind: &str, state: impl std::fmt::Display) {
        diag!(
            self.diagnostics,
            Level::Debug,
            "ignoring illegal {kind} state transition to {state}"
        );
    }
}

/// Drains the connection's event queue until the connection is closed or dropped.
async fn dispatch(
    shared: Weak<Shared>,
    closed: CancellationToken,
    mut queue: UnboundedReceiver<Notification>,
) {
    loop {
        let notification = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            notification = queue.recv() => notification,
        };
        let Some(notification) = notification else { break };
        let Some(shared) = shared.upgrade() else { break };
        shared.deliver(notification);
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("label", &self.shared.diagnostics.label)
            .field("backend", &self.shared.backend)
            .field("signaling_state", &self.signaling_state())
            .field("connection_state", &self.connection_state())
            .finish()
    }
}

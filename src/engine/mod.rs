//! Capability surface every backend has to provide.
//!
//! A backend translates the portable [Configuration] into its native representation and hands
//! back a [PeerConnectionEngine]. From then on the engine reports what it detects (candidates,
//! state changes, incoming channels and streams) as [EngineEvent]s, in detection order, through
//! the [EngineEvents] sender it received at construction. It never decides on state itself:
//! [crate::PeerConnection] validates and applies every transition.

use crate::config::Configuration;
use crate::data_channel::Message;
use crate::description::{IceCandidate, SessionDescription};
use crate::error::{Error, Result};
use crate::handler::MaybeSendSync;
use crate::media::{MediaConstraints, MediaStream};
use crate::state::{
    IceConnectionState, IceGatheringState, PeerConnectionState, ReadyState, SignalingState,
};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

#[cfg(target_arch = "wasm32")]
pub mod browser;
#[cfg(not(target_arch = "wasm32"))]
pub mod native;
#[cfg(all(test, not(target_arch = "wasm32")))]
pub(crate) mod scripted;

/// Failure reported by the engine while gathering a local candidate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateError {
    pub address: Option<String>,
    pub port: Option<u16>,
    pub url: String,
    pub error_code: u16,
    pub error_text: String,
}

/// Notification emitted by a [PeerConnectionEngine].
pub enum EngineEvent {
    NegotiationNeeded,
    IceCandidate(IceCandidate),
    IceCandidateError(IceCandidateError),
    IceGatheringStateChange(IceGatheringState),
    IceConnectionStateChange(IceConnectionState),
    ConnectionStateChange(PeerConnectionState),
    DataChannel(ChannelBinding),
    AddStream(MediaStream),
    RemoveStream(MediaStream),
}

impl std::fmt::Debug for EngineEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineEvent::NegotiationNeeded => f.write_str("NegotiationNeeded"),
            EngineEvent::IceCandidate(c) => f.debug_tuple("IceCandidate").field(c).finish(),
            EngineEvent::IceCandidateError(e) => {
                f.debug_tuple("IceCandidateError").field(e).finish()
            }
            EngineEvent::IceGatheringStateChange(s) => {
                f.debug_tuple("IceGatheringStateChange").field(s).finish()
            }
            EngineEvent::IceConnectionStateChange(s) => {
                f.debug_tuple("IceConnectionStateChange").field(s).finish()
            }
            EngineEvent::ConnectionStateChange(s) => {
                f.debug_tuple("ConnectionStateChange").field(s).finish()
            }
            EngineEvent::DataChannel(b) => f
                .debug_tuple("DataChannel")
                .field(&b.engine.label())
                .finish(),
            EngineEvent::AddStream(s) => f.debug_tuple("AddStream").field(s).finish(),
            EngineEvent::RemoveStream(s) => f.debug_tuple("RemoveStream").field(s).finish(),
        }
    }
}

/// Notification emitted by a [DataChannelEngine].
#[derive(Debug)]
pub enum ChannelEvent {
    Open,
    Closing,
    Close,
    Error(Error),
    Message(Message),
}

/// Entry of a connection's event queue. Signaling state changes are produced by the connection
/// itself, but travel through the same queue so they keep their place among engine events.
#[derive(Debug)]
pub(crate) enum Notification {
    Engine(EngineEvent),
    Signaling(SignalingState),
}

/// Sending half of a connection's event queue.
#[derive(Debug, Clone)]
pub struct EngineEvents(UnboundedSender<Notification>);

impl EngineEvents {
    /// Queues `event` for delivery. Returns `false` once the connection stopped listening.
    pub fn emit(&self, event: EngineEvent) -> bool {
        self.0.send(Notification::Engine(event)).is_ok()
    }

    pub(crate) fn signaling(&self, state: SignalingState) -> bool {
        self.0.send(Notification::Signaling(state)).is_ok()
    }
}

pub(crate) fn engine_events() -> (EngineEvents, UnboundedReceiver<Notification>) {
    let (tx, rx) = unbounded_channel();
    (EngineEvents(tx), rx)
}

/// Sending half of a data channel's event queue.
#[derive(Debug, Clone)]
pub struct ChannelEvents(UnboundedSender<ChannelEvent>);

impl ChannelEvents {
    pub fn emit(&self, event: ChannelEvent) -> bool {
        self.0.send(event).is_ok()
    }
}

/// Creates the event queue for a new data channel. Backends create it together with the
/// channel and register their callbacks right away, so that nothing reported between the
/// channel's creation and its delivery to the application is lost.
pub fn channel_events() -> (ChannelEvents, UnboundedReceiver<ChannelEvent>) {
    let (tx, rx) = unbounded_channel();
    (ChannelEvents(tx), rx)
}

/// A backend data channel together with the queue its notifications arrive on.
pub struct ChannelBinding {
    pub engine: Box<dyn DataChannelEngine>,
    pub events: UnboundedReceiver<ChannelEvent>,
}

/// Options of a newly created data channel. Unset fields fall back to the backend defaults
/// (ordered and reliable).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataChannelInit {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ordered: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_packet_life_time: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retransmits: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    /// Stream id of a channel negotiated out-of-band by the application.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negotiated: Option<u16>,
}

#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
pub trait PeerConnectionEngine: MaybeSendSync {
    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()>;

    async fn create_data_channel(&self, label: &str, init: &DataChannelInit)
        -> Result<ChannelBinding>;

    async fn add_stream(&self, stream: &MediaStream) -> Result<()>;

    /// Releases backend resources. Called at most once per engine.
    async fn close(&self) -> Result<()>;
}

#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
pub trait DataChannelEngine: MaybeSendSync {
    fn label(&self) -> String;

    /// Stream id, `None` until the backend assigned one.
    fn id(&self) -> Option<u16>;

    fn ready_state(&self) -> ReadyState;

    async fn send(&self, data: Bytes, is_string: bool) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Factory of engines, selected once at composition time.
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
pub trait Backend: MaybeSendSync {
    fn name(&self) -> &'static str;

    /// Translates `config` and builds a new engine reporting to `events`.
    async fn connect(
        &self,
        config: &Configuration,
        events: EngineEvents,
    ) -> Result<Box<dyn PeerConnectionEngine>>;

    async fn get_user_media(&self, constraints: &MediaConstraints) -> Result<MediaStream>;
}

/// Backend built for the current target: webrtc-rs natively, the browser API on wasm.
pub fn default_backend() -> Arc<dyn Backend> {
    #[cfg(not(target_arch = "wasm32"))]
    {
        Arc::new(native::NativeBackend::default())
    }
    #[cfg(target_arch = "wasm32")]
    {
        Arc::new(browser::BrowserBackend::default())
    }
}

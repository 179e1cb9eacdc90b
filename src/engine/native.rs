//! Engine backed by [webrtc](https://webrtc.rs). Negotiation and connectivity run on the tokio
//! runtime; every operation is executed as a separate engine task the caller waits on.

use crate::completion;
use crate::config::{
    resolve_policy, Configuration, BUNDLE_POLICIES, ICE_TRANSPORT_POLICIES, RTCP_MUX_POLICIES,
};
use crate::data_channel::Message;
use crate::description::{IceCandidate, SdpType, SessionDescription};
use crate::engine::{
    channel_events, Backend, ChannelBinding, ChannelEvent, DataChannelEngine, DataChannelInit,
    EngineEvent, EngineEvents, PeerConnectionEngine,
};
use crate::error::{Error, Result};
use crate::media::{MediaConstraints, MediaStream, StreamHandle};
use crate::state::{IceConnectionState, IceGatheringState, PeerConnectionState, ReadyState};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

#[derive(Debug, Default, Clone, Copy)]
pub struct NativeBackend;

#[async_trait]
impl Backend for NativeBackend {
    fn name(&self) -> &'static str {
        "webrtc-rs"
    }

    async fn connect(
        &self,
        config: &Configuration,
        events: EngineEvents,
    ) -> Result<Box<dyn PeerConnectionEngine>> {
        let engine = NativeEngine::new(config, events).await?;
        Ok(Box::new(engine))
    }

    async fn get_user_media(&self, _constraints: &MediaConstraints) -> Result<MediaStream> {
        Err(Error::UnsupportedOperation(
            "media capture is not available on the native backend".into(),
        ))
    }
}

/// Translates the portable configuration into its webrtc-rs counterpart.
pub(crate) fn rtc_configuration(config: &Configuration) -> Result<RTCConfiguration> {
    let ice_servers = config
        .ice_servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect();

    let ice_transport_policy = match resolve_policy(
        "ice transport policy",
        &config.ice_transport_policy,
        ICE_TRANSPORT_POLICIES,
    )? {
        "relay" => RTCIceTransportPolicy::Relay,
        _ => RTCIceTransportPolicy::All,
    };
    let bundle_policy = match resolve_policy("bundle policy", &config.bundle_policy, BUNDLE_POLICIES)?
    {
        "max-compat" => RTCBundlePolicy::MaxCompat,
        "max-bundle" => RTCBundlePolicy::MaxBundle,
        _ => RTCBundlePolicy::Balanced,
    };
    let rtcp_mux_policy = match resolve_policy(
        "rtcp mux policy",
        &config.rtcp_mux_policy,
        RTCP_MUX_POLICIES,
    )? {
        "negotiate" => RTCRtcpMuxPolicy::Negotiate,
        _ => RTCRtcpMuxPolicy::Require,
    };

    Ok(RTCConfiguration {
        ice_servers,
        ice_transport_policy,
        bundle_policy,
        rtcp_mux_policy,
        peer_identity: config.peer_identity.clone(),
        ..Default::default()
    })
}

pub struct NativeEngine {
    _api: API,
    pc: Arc<RTCPeerConnection>,
}

impl NativeEngine {
    pub async fn new(config: &Configuration, events: EngineEvents) -> Result<Self> {
        let rtc_config = rtc_configuration(config)?;

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::Configuration(format!("codec registration failed: {e}")))?;

        // Interceptors provide NACKs, RTCP reports etc. and have to be registered per
        // connection.
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| Error::Configuration(format!("interceptor registration failed: {e}")))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| Error::Configuration(e.to_string()))?;
        let pc = Arc::new(pc);
        Self::listen(&pc, events);

        Ok(NativeEngine { _api: api, pc })
    }

    fn listen(pc: &RTCPeerConnection, events: EngineEvents) {
        {
            let events = events.clone();
            pc.on_negotiation_needed(Box::new(move || {
                events.emit(EngineEvent::NegotiationNeeded);
                Box::pin(async move {})
            }));
        }
        {
            let events = events.clone();
            pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                // `None` marks the end of gathering, which is reported as a gathering state
                // change on its own
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => {
                            events.emit(EngineEvent::IceCandidate(IceCandidate::new(
                                init.candidate,
                                init.sdp_mid,
                                init.sdp_mline_index,
                            )));
                        }
                        Err(e) => {
                            log::warn!(target: "rtcpeer", "failed to serialize local candidate: {e}")
                        }
                    }
                }
                Box::pin(async move {})
            }));
        }
        {
            let events = events.clone();
            pc.on_ice_gathering_state_change(Box::new(move |s: RTCIceGathererState| {
                let state = match s {
                    RTCIceGathererState::New => Some(IceGatheringState::New),
                    RTCIceGathererState::Gathering => Some(IceGatheringState::Gathering),
                    RTCIceGathererState::Complete => Some(IceGatheringState::Complete),
                    RTCIceGathererState::Closed | RTCIceGathererState::Unspecified => None,
                };
                if let Some(state) = state {
                    events.emit(EngineEvent::IceGatheringStateChange(state));
                }
                Box::pin(async move {})
            }));
        }
        {
            let events = events.clone();
            pc.on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
                if let Some(state) = ice_connection_state(s) {
                    events.emit(EngineEvent::IceConnectionStateChange(state));
                }
                Box::pin(async move {})
            }));
        }
        {
            let events = events.clone();
            pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                if let Some(state) = peer_connection_state(s) {
                    events.emit(EngineEvent::ConnectionStateChange(state));
                }
                Box::pin(async move {})
            }));
        }
        {
            let events = events.clone();
            pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                events.emit(EngineEvent::DataChannel(NativeDataChannel::bind(dc, true)));
                Box::pin(async move {})
            }));
        }
        {
            pc.on_track(Box::new(
                move |track: Arc<TrackRemote>,
                      _receiver: Arc<RTCRtpReceiver>,
                      _transceiver: Arc<RTCRtpTransceiver>| {
                    let stream = MediaStream::from_handle(
                        track.stream_id().to_string(),
                        StreamHandle {
                            local: Vec::new(),
                            remote: vec![track],
                        },
                    );
                    events.emit(EngineEvent::AddStream(stream));
                    Box::pin(async move {})
                },
            ));
        }
    }
}

fn ice_connection_state(s: RTCIceConnectionState) -> Option<IceConnectionState> {
    match s {
        RTCIceConnectionState::New => Some(IceConnectionState::New),
        RTCIceConnectionState::Checking => Some(IceConnectionState::Checking),
        RTCIceConnectionState::Connected => Some(IceConnectionState::Connected),
        RTCIceConnectionState::Completed => Some(IceConnectionState::Completed),
        RTCIceConnectionState::Disconnected => Some(IceConnectionState::Disconnected),
        RTCIceConnectionState::Failed => Some(IceConnectionState::Failed),
        RTCIceConnectionState::Closed => Some(IceConnectionState::Closed),
        RTCIceConnectionState::Unspecified => None,
    }
}

fn peer_connection_state(s: RTCPeerConnectionState) -> Option<PeerConnectionState> {
    match s {
        RTCPeerConnectionState::New => Some(PeerConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(PeerConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(PeerConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PeerConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(PeerConnectionState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription> {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(Error::Negotiation(
                "engine produced a session description of unspecified type".into(),
            ))
        }
    };
    Ok(SessionDescription::new(sdp_type, desc.sdp))
}

fn to_rtc(desc: &SessionDescription) -> Result<RTCSessionDescription> {
    let sdp = desc.sdp().to_owned();
    let parsed = match desc.sdp_type() {
        SdpType::Offer => RTCSessionDescription::offer(sdp),
        SdpType::Answer => RTCSessionDescription::answer(sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(sdp),
        SdpType::Rollback => {
            return Err(Error::UnsupportedOperation(
                "rollback is not supported by the webrtc-rs backend".into(),
            ))
        }
    };
    parsed.map_err(|e| Error::Negotiation(format!("malformed {} sdp: {e}", desc.sdp_type())))
}

#[async_trait]
impl PeerConnectionEngine for NativeEngine {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let pc = self.pc.clone();
        completion::run("create offer", Error::Negotiation, async move {
            let offer = pc
                .create_offer(None)
                .await
                .map_err(|e| Error::Negotiation(format!("create offer failed: {e}")))?;
            from_rtc(offer)
        })
        .await
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let pc = self.pc.clone();
        completion::run("create answer", Error::Negotiation, async move {
            let answer = pc
                .create_answer(None)
                .await
                .map_err(|e| Error::Negotiation(format!("create answer failed: {e}")))?;
            from_rtc(answer)
        })
        .await
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<()> {
        let desc = to_rtc(desc)?;
        let pc = self.pc.clone();
        completion::run("set local description", Error::Negotiation, async move {
            pc.set_local_description(desc)
                .await
                .map_err(|e| Error::Negotiation(format!("set local description failed: {e}")))
        })
        .await
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<()> {
        let desc = to_rtc(desc)?;
        let pc = self.pc.clone();
        completion::run("set remote description", Error::Negotiation, async move {
            pc.set_remote_description(desc)
                .await
                .map_err(|e| Error::Negotiation(format!("set remote description failed: {e}")))
        })
        .await
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate().to_owned(),
            sdp_mid: candidate.sdp_mid().map(str::to_owned),
            sdp_mline_index: candidate.sdp_m_line_index(),
            username_fragment: None,
        };
        let pc = self.pc.clone();
        completion::run("add ice candidate", Error::Ice, async move {
            pc.add_ice_candidate(init)
                .await
                .map_err(|e| Error::Ice(format!("add ice candidate failed: {e}")))
        })
        .await
    }

    async fn create_data_channel(
        &self,
        label: &str,
        init: &DataChannelInit,
    ) -> Result<ChannelBinding> {
        let options = RTCDataChannelInit {
            ordered: init.ordered,
            max_packet_life_time: init.max_packet_life_time,
            max_retransmits: init.max_retransmits,
            protocol: init.protocol.clone(),
            negotiated: init.negotiated,
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(options))
            .await
            .map_err(|e| Error::Channel(format!("create data channel '{label}' failed: {e}")))?;
        Ok(NativeDataChannel::bind(dc, init.negotiated.is_some()))
    }

    async fn add_stream(&self, stream: &MediaStream) -> Result<()> {
        if stream.local_tracks().is_empty() {
            return Err(Error::Validation(format!(
                "media stream '{}' has no local tracks to send",
                stream.id()
            )));
        }
        for track in stream.local_tracks() {
            let sender = self
                .pc
                .add_track(track.clone())
                .await
                .map_err(|e| Error::Negotiation(format!("add track failed: {e}")))?;
            // RTCP has to be drained for interceptors (NACK, reports) to work
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .map_err(|e| Error::Closed(format!("engine failed to close: {e}")))
    }
}

pub struct NativeDataChannel {
    dc: Arc<RTCDataChannel>,
    /// Stream id is known up front: negotiated out of band or announced by the remote peer.
    id_known: bool,
}

impl NativeDataChannel {
    /// Registers channel callbacks and wraps the channel into a [ChannelBinding].
    pub fn bind(dc: Arc<RTCDataChannel>, id_known: bool) -> ChannelBinding {
        let (events, rx) = channel_events();
        {
            let events = events.clone();
            dc.on_open(Box::new(move || {
                events.emit(ChannelEvent::Open);
                Box::pin(async move {})
            }));
        }
        {
            let events = events.clone();
            dc.on_close(Box::new(move || {
                events.emit(ChannelEvent::Close);
                Box::pin(async move {})
            }));
        }
        {
            let events = events.clone();
            dc.on_error(Box::new(move |e: webrtc::Error| {
                events.emit(ChannelEvent::Error(Error::Channel(format!(
                    "transport error: {e}"
                ))));
                Box::pin(async move {})
            }));
        }
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            events.emit(ChannelEvent::Message(Message {
                is_string: msg.is_string,
                data: msg.data,
            }));
            Box::pin(async move {})
        }));
        ChannelBinding {
            engine: Box::new(NativeDataChannel { dc, id_known }),
            events: rx,
        }
    }
}

#[async_trait]
impl DataChannelEngine for NativeDataChannel {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    fn id(&self) -> Option<u16> {
        // in-band channels get their stream id once the SCTP association is up
        if !self.id_known && self.ready_state() == ReadyState::Connecting {
            None
        } else {
            Some(self.dc.id())
        }
    }

    fn ready_state(&self) -> ReadyState {
        match self.dc.ready_state() {
            RTCDataChannelState::Open => ReadyState::Open,
            RTCDataChannelState::Closing => ReadyState::Closing,
            RTCDataChannelState::Closed => ReadyState::Closed,
            RTCDataChannelState::Connecting | RTCDataChannelState::Unspecified => {
                ReadyState::Connecting
            }
        }
    }

    async fn send(&self, data: Bytes, is_string: bool) -> Result<()> {
        let sent = if is_string {
            let text = String::from_utf8(data.to_vec())
                .map_err(|e| Error::Channel(format!("text message is not valid utf-8: {e}")))?;
            self.dc.send_text(text).await
        } else {
            self.dc.send(&data).await
        };
        sent.map(|_| ())
            .map_err(|e| Error::Channel(format!("send failed: {e}")))
    }

    async fn close(&self) -> Result<()> {
        self.dc
            .close()
            .await
            .map_err(|e| Error::Channel(format!("close failed: {e}")))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::IceServer;

    #[test]
    fn configuration_translation() {
        let config = Configuration::builder()
            .with_ice_server(
                IceServer::parse("stun:s.example.com, turn:t.example.com", &["u", "p"]).unwrap(),
            )
            .with_ice_transport_policy("RELAY")
            .with_bundle_policy("Max-Bundle")
            .with_peer_identity("peer@example.com")
            .build();
        let rtc = rtc_configuration(&config).unwrap();
        assert_eq!(rtc.ice_servers.len(), 1);
        assert_eq!(rtc.ice_servers[0].urls.len(), 2);
        assert_eq!(rtc.ice_servers[0].username, "u");
        assert_eq!(rtc.ice_servers[0].credential, "p");
        assert_eq!(rtc.ice_transport_policy, RTCIceTransportPolicy::Relay);
        assert_eq!(rtc.bundle_policy, RTCBundlePolicy::MaxBundle);
        assert_eq!(rtc.rtcp_mux_policy, RTCRtcpMuxPolicy::Require);
        assert_eq!(rtc.peer_identity, "peer@example.com");
    }

    #[test]
    fn unknown_policy_is_unsupported() {
        let config = Configuration::builder()
            .with_bundle_policy("max-everything")
            .build();
        let err = rtc_configuration(&config).err().unwrap();
        assert!(matches!(err, Error::UnsupportedPolicy(_)));
    }

    #[test]
    fn malformed_sdp_is_a_negotiation_error() {
        let err = to_rtc(&SessionDescription::offer("definitely not sdp")).unwrap_err();
        assert!(matches!(err, Error::Negotiation(_)));
    }

    #[test]
    fn rollback_is_rejected_before_reaching_webrtc() {
        let err = to_rtc(&SessionDescription::rollback()).unwrap_err();
        assert!(matches!(err, Error::UnsupportedOperation(_)));
    }
}

//! Engine backed by the browser's `RTCPeerConnection`. Everything runs on the single JS thread:
//! operations await the promises returned by the browser, notifications are taken from the
//! `on*` event handler properties.
//!
//! States are always read by name from the JS objects (`iceConnectionState` etc.) and parsed,
//! never derived from an enumeration's ordinal position.

use crate::config::{
    resolve_policy, Configuration, BUNDLE_POLICIES, ICE_TRANSPORT_POLICIES, RTCP_MUX_POLICIES,
};
use crate::data_channel::Message;
use crate::description::{IceCandidate, SdpType, SessionDescription};
use crate::engine::{
    channel_events, Backend, ChannelBinding, ChannelEvent, DataChannelEngine, DataChannelInit,
    EngineEvent, EngineEvents, IceCandidateError, PeerConnectionEngine,
};
use crate::error::{Error, Result};
use crate::media::{
    AudioMandatory, MediaConstraints, MediaStream, StreamHandle, TrackConstraints, VideoMandatory,
};
use crate::state::{IceConnectionState, IceGatheringState, PeerConnectionState, ReadyState};
use async_trait::async_trait;
use bytes::Bytes;
use js_sys::{Array, ArrayBuffer, Function, Object, Reflect, Uint8Array};
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use std::str::FromStr;
use wasm_bindgen::closure::Closure;
use wasm_bindgen::{JsCast, JsValue};
use wasm_bindgen_futures::JsFuture;
use web_sys::{RtcDataChannel, RtcPeerConnection, RtcSessionDescriptionInit};

fn get(target: &JsValue, key: &str) -> JsValue {
    Reflect::get(target, &JsValue::from_str(key)).unwrap_or(JsValue::UNDEFINED)
}

fn get_string(target: &JsValue, key: &str) -> Option<String> {
    get(target, key).as_string()
}

fn set(target: &JsValue, key: &str, value: impl Into<JsValue>) {
    // setting a property on a plain object or a DOM object can't fail
    let _ = Reflect::set(target, &JsValue::from_str(key), &value.into());
}

/// Calls `target.method(...args)`, turning a thrown exception into `Err`.
fn call(target: &JsValue, method: &str, args: &[JsValue]) -> std::result::Result<JsValue, JsValue> {
    let f: Function = get(target, method)
        .dyn_into()
        .map_err(|_| JsValue::from_str(&format!("{method} is not a function")))?;
    f.apply(target, &args.iter().collect::<Array>())
}

/// Renders an exception or promise rejection as `<name>: <message>`.
fn js_error(e: JsValue) -> String {
    match (get_string(&e, "name"), get_string(&e, "message")) {
        (Some(name), Some(message)) => format!("{name}: {message}"),
        (None, Some(message)) => message,
        _ => e.as_string().unwrap_or_else(|| format!("{e:?}")),
    }
}

fn read_state<S: FromStr>(target: &JsValue, key: &str) -> Option<S> {
    get_string(target, key).and_then(|name| name.parse().ok())
}

type Listener = Closure<dyn FnMut(JsValue)>;

/// Event handler closures registered on JS objects. They are unregistered before being
/// dropped, so the browser never calls into a freed closure.
#[derive(Default)]
struct Listeners(Vec<(JsValue, &'static str, Listener)>);

impl Listeners {
    fn add<F>(&mut self, target: &JsValue, event: &'static str, f: F)
    where
        F: FnMut(JsValue) + 'static,
    {
        let closure = Closure::wrap(Box::new(f) as Box<dyn FnMut(JsValue)>);
        set(target, &format!("on{event}"), closure.as_ref().clone());
        self.0.push((target.clone(), event, closure));
    }
}

impl Drop for Listeners {
    fn drop(&mut self) {
        for (target, event, _) in self.0.iter() {
            set(target, &format!("on{event}"), JsValue::NULL);
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BrowserBackend;

#[async_trait(?Send)]
impl Backend for BrowserBackend {
    fn name(&self) -> &'static str {
        "browser"
    }

    async fn connect(
        &self,
        config: &Configuration,
        events: EngineEvents,
    ) -> Result<Box<dyn PeerConnectionEngine>> {
        let engine = BrowserEngine::new(config, events)?;
        Ok(Box::new(engine))
    }

    async fn get_user_media(&self, constraints: &MediaConstraints) -> Result<MediaStream> {
        let window = web_sys::window().ok_or_else(|| {
            Error::UnsupportedOperation("media capture requires a browser window".into())
        })?;
        let devices = window.navigator().media_devices().map_err(|_| {
            Error::UnsupportedOperation("media devices are not available in this context".into())
        })?;
        let request = media_constraints(constraints);
        let promise = devices
            .get_user_media_with_constraints(request.unchecked_ref())
            .map_err(|e| Error::Capture(js_error(e)))?;
        let stream: web_sys::MediaStream = JsFuture::from(promise)
            .await
            .map_err(|e| Error::Capture(js_error(e)))?
            .unchecked_into();
        Ok(MediaStream::from_handle(stream.id(), StreamHandle(stream)))
    }
}

/// Translates the portable configuration into an `RTCConfiguration` dictionary.
pub(crate) fn rtc_configuration(config: &Configuration) -> Result<Object> {
    let servers = Array::new();
    for server in config.ice_servers.iter() {
        let entry = Object::new();
        let urls: Array = server.urls.iter().map(|url| JsValue::from_str(url)).collect();
        set(&entry, "urls", urls);
        if let Some(username) = &server.username {
            set(&entry, "username", username.as_str());
        }
        if let Some(credential) = &server.credential {
            set(&entry, "credential", credential.as_str());
        }
        set(&entry, "credentialType", server.credential_type.to_string());
        servers.push(&entry);
    }

    let rtc = Object::new();
    set(&rtc, "iceServers", servers);
    set(
        &rtc,
        "iceTransportPolicy",
        resolve_policy(
            "ice transport policy",
            &config.ice_transport_policy,
            ICE_TRANSPORT_POLICIES,
        )?,
    );
    set(
        &rtc,
        "bundlePolicy",
        resolve_policy("bundle policy", &config.bundle_policy, BUNDLE_POLICIES)?,
    );
    set(
        &rtc,
        "rtcpMuxPolicy",
        resolve_policy("rtcp mux policy", &config.rtcp_mux_policy, RTCP_MUX_POLICIES)?,
    );
    if !config.peer_identity.is_empty() {
        set(&rtc, "peerIdentity", config.peer_identity.as_str());
    }
    Ok(rtc)
}

fn description_from_js(value: &JsValue) -> Result<SessionDescription> {
    let sdp_type = get_string(value, "type")
        .ok_or_else(|| Error::Negotiation("session description without type".into()))?;
    let sdp_type = SdpType::from_str(&sdp_type).map_err(|e| Error::Negotiation(e.to_string()))?;
    let sdp = get_string(value, "sdp").unwrap_or_default();
    Ok(SessionDescription::new(sdp_type, sdp))
}

fn description_to_js(desc: &SessionDescription) -> RtcSessionDescriptionInit {
    let init = Object::new();
    set(&init, "type", desc.sdp_type().as_str());
    set(&init, "sdp", desc.sdp());
    init.unchecked_into()
}

pub struct BrowserEngine {
    pc: RtcPeerConnection,
    listeners: Listeners,
    stream_listeners: Rc<RefCell<Listeners>>,
}

impl BrowserEngine {
    pub fn new(config: &Configuration, events: EngineEvents) -> Result<Self> {
        let rtc = rtc_configuration(config)?;
        let pc = RtcPeerConnection::new_with_configuration(rtc.unchecked_ref())
            .map_err(|e| Error::Configuration(js_error(e)))?;
        let mut engine = BrowserEngine {
            pc,
            listeners: Listeners::default(),
            stream_listeners: Rc::default(),
        };
        engine.listen(events);
        Ok(engine)
    }

    fn listen(&mut self, events: EngineEvents) {
        let target: JsValue = self.pc.clone().into();
        let listeners = &mut self.listeners;
        {
            let events = events.clone();
            listeners.add(&target, "negotiationneeded", move |_| {
                events.emit(EngineEvent::NegotiationNeeded);
            });
        }
        {
            let events = events.clone();
            listeners.add(&target, "icecandidate", move |ev| {
                // a null candidate marks the end of gathering, reported by gathering state
                let candidate = get(&ev, "candidate");
                if candidate.is_null() || candidate.is_undefined() {
                    return;
                }
                events.emit(EngineEvent::IceCandidate(IceCandidate::new(
                    get_string(&candidate, "candidate").unwrap_or_default(),
                    get_string(&candidate, "sdpMid"),
                    get(&candidate, "sdpMLineIndex").as_f64().map(|i| i as u16),
                )));
            });
        }
        {
            let events = events.clone();
            listeners.add(&target, "icecandidateerror", move |ev| {
                events.emit(EngineEvent::IceCandidateError(IceCandidateError {
                    address: get_string(&ev, "address"),
                    port: get(&ev, "port").as_f64().map(|p| p as u16),
                    url: get_string(&ev, "url").unwrap_or_default(),
                    error_code: get(&ev, "errorCode").as_f64().unwrap_or_default() as u16,
                    error_text: get_string(&ev, "errorText").unwrap_or_default(),
                }));
            });
        }
        {
            let events = events.clone();
            let pc = target.clone();
            listeners.add(&target, "icegatheringstatechange", move |_| {
                if let Some(state) = read_state::<IceGatheringState>(&pc, "iceGatheringState") {
                    events.emit(EngineEvent::IceGatheringStateChange(state));
                }
            });
        }
        {
            let events = events.clone();
            let pc = target.clone();
            listeners.add(&target, "iceconnectionstatechange", move |_| {
                if let Some(state) = read_state::<IceConnectionState>(&pc, "iceConnectionState") {
                    events.emit(EngineEvent::IceConnectionStateChange(state));
                }
            });
        }
        {
            let events = events.clone();
            let pc = target.clone();
            listeners.add(&target, "connectionstatechange", move |_| {
                if let Some(state) = read_state::<PeerConnectionState>(&pc, "connectionState") {
                    events.emit(EngineEvent::ConnectionStateChange(state));
                }
            });
        }
        {
            let events = events.clone();
            listeners.add(&target, "datachannel", move |ev| {
                let dc: RtcDataChannel = get(&ev, "channel").unchecked_into();
                events.emit(EngineEvent::DataChannel(BrowserDataChannel::bind(dc)));
            });
        }
        {
            let seen: Rc<RefCell<HashSet<String>>> = Rc::default();
            let stream_listeners = self.stream_listeners.clone();
            listeners.add(&target, "track", move |ev| {
                let streams: Array = get(&ev, "streams").unchecked_into();
                for stream in streams.iter() {
                    let stream: web_sys::MediaStream = stream.unchecked_into();
                    let id = stream.id();
                    if !seen.borrow_mut().insert(id.clone()) {
                        continue;
                    }
                    {
                        // a remote stream is gone once its last track is
                        let events = events.clone();
                        let seen = seen.clone();
                        let removed = stream.clone();
                        stream_listeners
                            .borrow_mut()
                            .add(&stream, "removetrack", move |_| {
                                if removed.get_tracks().length() == 0
                                    && seen.borrow_mut().remove(&removed.id())
                                {
                                    events.emit(EngineEvent::RemoveStream(
                                        MediaStream::from_handle(
                                            removed.id(),
                                            StreamHandle(removed.clone()),
                                        ),
                                    ));
                                }
                            });
                    }
                    events.emit(EngineEvent::AddStream(MediaStream::from_handle(
                        id,
                        StreamHandle(stream),
                    )));
                }
            });
        }
    }
}

#[async_trait(?Send)]
impl PeerConnectionEngine for BrowserEngine {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = JsFuture::from(self.pc.create_offer())
            .await
            .map_err(|e| Error::Negotiation(format!("create offer failed: {}", js_error(e))))?;
        description_from_js(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = JsFuture::from(self.pc.create_answer())
            .await
            .map_err(|e| Error::Negotiation(format!("create answer failed: {}", js_error(e))))?;
        description_from_js(&answer)
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<()> {
        JsFuture::from(self.pc.set_local_description(&description_to_js(desc)))
            .await
            .map_err(|e| {
                Error::Negotiation(format!("set local description failed: {}", js_error(e)))
            })?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<()> {
        JsFuture::from(self.pc.set_remote_description(&description_to_js(desc)))
            .await
            .map_err(|e| {
                Error::Negotiation(format!("set remote description failed: {}", js_error(e)))
            })?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        let init = Object::new();
        set(&init, "candidate", candidate.candidate());
        if let Some(mid) = candidate.sdp_mid() {
            set(&init, "sdpMid", mid);
        }
        if let Some(index) = candidate.sdp_m_line_index() {
            set(&init, "sdpMLineIndex", index);
        }
        let failed = |e| Error::Ice(format!("add ice candidate failed: {}", js_error(e)));
        let promise = call(&self.pc, "addIceCandidate", &[init.into()]).map_err(failed)?;
        JsFuture::from(promise.unchecked_into::<js_sys::Promise>())
            .await
            .map_err(failed)?;
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
        init: &DataChannelInit,
    ) -> Result<ChannelBinding> {
        let dict = Object::new();
        if let Some(ordered) = init.ordered {
            set(&dict, "ordered", ordered);
        }
        if let Some(lifetime) = init.max_packet_life_time {
            set(&dict, "maxPacketLifeTime", lifetime);
        }
        if let Some(retransmits) = init.max_retransmits {
            set(&dict, "maxRetransmits", retransmits);
        }
        if let Some(protocol) = &init.protocol {
            set(&dict, "protocol", protocol.as_str());
        }
        if let Some(id) = init.negotiated {
            set(&dict, "negotiated", true);
            set(&dict, "id", id);
        }
        let dc = call(
            &self.pc,
            "createDataChannel",
            &[JsValue::from_str(label), dict.into()],
        )
        .map_err(|e| {
            Error::Channel(format!("create data channel '{label}' failed: {}", js_error(e)))
        })?;
        Ok(BrowserDataChannel::bind(dc.unchecked_into()))
    }

    async fn add_stream(&self, stream: &MediaStream) -> Result<()> {
        let js_stream = stream.as_web_sys();
        for track in js_stream.get_tracks().iter() {
            call(
                &self.pc,
                "addTrack",
                &[track, js_stream.clone().into()],
            )
            .map_err(|e| Error::Negotiation(format!("add track failed: {}", js_error(e))))?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pc.close();
        Ok(())
    }
}

pub struct BrowserDataChannel {
    dc: RtcDataChannel,
    _listeners: Listeners,
}

impl BrowserDataChannel {
    /// Registers channel event handlers and wraps the channel into a [ChannelBinding].
    pub fn bind(dc: RtcDataChannel) -> ChannelBinding {
        let target: JsValue = dc.clone().into();
        // binary messages are delivered as ArrayBuffers instead of Blobs
        set(&target, "binaryType", "arraybuffer");

        let (events, rx) = channel_events();
        let mut listeners = Listeners::default();
        {
            let events = events.clone();
            listeners.add(&target, "open", move |_| {
                events.emit(ChannelEvent::Open);
            });
        }
        {
            let events = events.clone();
            listeners.add(&target, "closing", move |_| {
                events.emit(ChannelEvent::Closing);
            });
        }
        {
            let events = events.clone();
            listeners.add(&target, "close", move |_| {
                events.emit(ChannelEvent::Close);
            });
        }
        {
            let events = events.clone();
            listeners.add(&target, "error", move |ev| {
                let error = get(&ev, "error");
                let reason = if error.is_undefined() || error.is_null() {
                    "unknown".to_string()
                } else {
                    js_error(error)
                };
                events.emit(ChannelEvent::Error(Error::Channel(format!(
                    "transport error: {reason}"
                ))));
            });
        }
        listeners.add(&target, "message", move |ev| {
            let data = get(&ev, "data");
            let msg = if let Some(text) = data.as_string() {
                Message::text(text)
            } else if data.is_instance_of::<ArrayBuffer>() {
                Message::binary(Uint8Array::new(&data).to_vec())
            } else {
                log::warn!(target: "rtcpeer", "unsupported data channel payload: {data:?}");
                return;
            };
            events.emit(ChannelEvent::Message(msg));
        });

        ChannelBinding {
            engine: Box::new(BrowserDataChannel {
                dc,
                _listeners: listeners,
            }),
            events: rx,
        }
    }
}

#[async_trait(?Send)]
impl DataChannelEngine for BrowserDataChannel {
    fn label(&self) -> String {
        self.dc.label()
    }

    fn id(&self) -> Option<u16> {
        self.dc.id()
    }

    fn ready_state(&self) -> ReadyState {
        read_state(&self.dc, "readyState").unwrap_or_default()
    }

    async fn send(&self, data: Bytes, is_string: bool) -> Result<()> {
        let payload: JsValue = if is_string {
            let text = std::str::from_utf8(&data)
                .map_err(|e| Error::Channel(format!("text message is not valid utf-8: {e}")))?;
            JsValue::from_str(text)
        } else {
            Uint8Array::from(&data[..]).into()
        };
        call(&self.dc, "send", &[payload])
            .map_err(|e| Error::Channel(format!("send failed: {}", js_error(e))))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.dc.close();
        Ok(())
    }
}

fn range(target: &Object, key: &str, min: Option<f64>, max: Option<f64>) {
    if min.is_none() && max.is_none() {
        return;
    }
    let constraint = Object::new();
    if let Some(min) = min {
        set(&constraint, "min", min);
    }
    if let Some(max) = max {
        set(&constraint, "max", max);
    }
    set(target, key, constraint);
}

fn video_constraints(v: &VideoMandatory) -> Object {
    let track = Object::new();
    range(&track, "width", v.min_width.map(f64::from), v.max_width.map(f64::from));
    range(&track, "height", v.min_height.map(f64::from), v.max_height.map(f64::from));
    range(&track, "frameRate", v.min_frame_rate, v.max_frame_rate);
    range(&track, "aspectRatio", v.min_aspect_rate, v.max_aspect_rate);
    if let Some(ratio) = v.aspect_rate {
        let aspect = get(&track, "aspectRatio");
        if aspect.is_undefined() {
            let ideal = Object::new();
            set(&ideal, "ideal", ratio);
            set(&track, "aspectRatio", ideal);
        } else {
            set(&aspect, "ideal", ratio);
        }
    }
    track
}

fn audio_constraints(a: &AudioMandatory) -> Object {
    let track = Object::new();
    if let Some(echo_cancellation) = a.echo_cancellation {
        set(&track, "echoCancellation", echo_cancellation);
    }
    range(
        &track,
        "channelCount",
        a.min_channel_count.map(f64::from),
        a.max_channel_count.map(f64::from),
    );
    range(
        &track,
        "sampleRate",
        a.min_sample_rate.map(f64::from),
        a.max_sample_rate.map(f64::from),
    );
    range(&track, "latency", a.min_latency, a.max_latency);
    range(&track, "volume", a.min_volume, a.max_volume);
    track
}

/// Builds a `MediaStreamConstraints` dictionary, translating mandatory min/max records into
/// constrainable property ranges.
fn media_constraints(c: &MediaConstraints) -> Object {
    let request = Object::new();
    let video: JsValue = match &c.video {
        TrackConstraints::Enabled(enabled) => JsValue::from_bool(*enabled),
        TrackConstraints::Constrained(v) => video_constraints(&v.mandatory).into(),
    };
    let audio: JsValue = match &c.audio {
        TrackConstraints::Enabled(enabled) => JsValue::from_bool(*enabled),
        TrackConstraints::Constrained(a) => audio_constraints(&a.mandatory).into(),
    };
    set(&request, "video", video);
    set(&request, "audio", audio);
    request
}

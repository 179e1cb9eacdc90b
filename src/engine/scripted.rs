//! Engine driven entirely by the test which owns its [Script].

use crate::config::Configuration;
use crate::data_channel::Message;
use crate::description::{IceCandidate, SessionDescription};
use crate::engine::{
    channel_events, Backend, ChannelBinding, ChannelEvents, DataChannelEngine, DataChannelInit,
    EngineEvent, EngineEvents, PeerConnectionEngine,
};
use crate::error::{Error, Result};
use crate::media::{MediaConstraints, MediaStream};
use crate::state::ReadyState;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub(crate) const OFFER_SDP: &str = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=scripted offer\r\n";
pub(crate) const ANSWER_SDP: &str = "v=0\r\no=- 2 1 IN IP4 127.0.0.1\r\ns=scripted answer\r\n";

#[derive(Default)]
pub(crate) struct Script {
    events: Mutex<Option<EngineEvents>>,
    hung: Mutex<HashSet<&'static str>>,
    rejected: Mutex<HashSet<&'static str>>,
    calls: Mutex<Vec<&'static str>>,
    channels: Mutex<Vec<(ScriptedChannel, ChannelEvents)>>,
    closes: AtomicUsize,
}

impl Script {
    /// Reports `event` as if the engine detected it.
    pub fn emit(&self, event: EngineEvent) -> bool {
        match &*self.events.lock().unwrap() {
            Some(events) => events.emit(event),
            None => false,
        }
    }

    /// Makes every following call of `op` never complete.
    pub fn hang(&self, op: &'static str) {
        self.hung.lock().unwrap().insert(op);
    }

    /// Makes every following call of `op` fail.
    pub fn reject(&self, op: &'static str) {
        self.rejected.lock().unwrap().insert(op);
    }

    /// Engine operations invoked so far, in call order.
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Announces a channel opened by the remote peer.
    pub fn remote_channel(&self, label: &str, id: u16) -> (ScriptedChannel, ChannelEvents) {
        let channel = ScriptedChannel::new(label, id);
        let (events, rx) = channel_events();
        self.emit(EngineEvent::DataChannel(ChannelBinding {
            engine: Box::new(channel.clone()),
            events: rx,
        }));
        (channel, events)
    }

    /// Channel created locally through the engine, together with its event queue.
    pub fn local_channel(&self, label: &str) -> Option<(ScriptedChannel, ChannelEvents)> {
        self.channels
            .lock()
            .unwrap()
            .iter()
            .find(|(c, _)| c.label == label)
            .cloned()
    }

    async fn enter(&self, op: &'static str) -> Result<()> {
        self.calls.lock().unwrap().push(op);
        let hung = self.hung.lock().unwrap().contains(op);
        if hung {
            std::future::pending::<()>().await;
        }
        if self.rejected.lock().unwrap().contains(op) {
            let msg = format!("{op} rejected by scripted engine");
            return Err(match op {
                "add_ice_candidate" => Error::Ice(msg),
                "create_data_channel" => Error::Channel(msg),
                _ => Error::Negotiation(msg),
            });
        }
        Ok(())
    }
}

pub(crate) struct ScriptedBackend {
    script: Arc<Script>,
}

impl ScriptedBackend {
    pub fn new() -> (Arc<Self>, Arc<Script>) {
        let script = Arc::new(Script::default());
        let backend = Arc::new(ScriptedBackend {
            script: script.clone(),
        });
        (backend, script)
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn connect(
        &self,
        _config: &Configuration,
        events: EngineEvents,
    ) -> Result<Box<dyn PeerConnectionEngine>> {
        *self.script.events.lock().unwrap() = Some(events);
        Ok(Box::new(ScriptedEngine {
            script: self.script.clone(),
        }))
    }

    async fn get_user_media(&self, _constraints: &MediaConstraints) -> Result<MediaStream> {
        Err(Error::Capture("no capture device".into()))
    }
}

struct ScriptedEngine {
    script: Arc<Script>,
}

#[async_trait]
impl PeerConnectionEngine for ScriptedEngine {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.script.enter("create_offer").await?;
        Ok(SessionDescription::offer(OFFER_SDP))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.script.enter("create_answer").await?;
        Ok(SessionDescription::answer(ANSWER_SDP))
    }

    async fn set_local_description(&self, _desc: &SessionDescription) -> Result<()> {
        self.script.enter("set_local_description").await
    }

    async fn set_remote_description(&self, _desc: &SessionDescription) -> Result<()> {
        self.script.enter("set_remote_description").await
    }

    async fn add_ice_candidate(&self, _candidate: &IceCandidate) -> Result<()> {
        self.script.enter("add_ice_candidate").await
    }

    async fn create_data_channel(
        &self,
        label: &str,
        init: &DataChannelInit,
    ) -> Result<ChannelBinding> {
        self.script.enter("create_data_channel").await?;
        let mut channels = self.script.channels.lock().unwrap();
        let id = init.negotiated.unwrap_or(channels.len() as u16 * 2);
        let channel = ScriptedChannel::new(label, id);
        let (events, rx) = channel_events();
        channels.push((channel.clone(), events));
        Ok(ChannelBinding {
            engine: Box::new(channel),
            events: rx,
        })
    }

    async fn add_stream(&self, _stream: &MediaStream) -> Result<()> {
        self.script.enter("add_stream").await
    }

    async fn close(&self) -> Result<()> {
        self.script.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Clone)]
pub(crate) struct ScriptedChannel {
    label: String,
    id: u16,
    sent: Arc<Mutex<Vec<Message>>>,
    close_requested: Arc<AtomicBool>,
}

impl ScriptedChannel {
    pub fn new(label: &str, id: u16) -> Self {
        ScriptedChannel {
            label: label.to_owned(),
            id,
            sent: Arc::default(),
            close_requested: Arc::default(),
        }
    }

    /// Messages handed to the engine so far.
    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }

    pub fn close_requested(&self) -> bool {
        self.close_requested.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataChannelEngine for ScriptedChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn id(&self) -> Option<u16> {
        Some(self.id)
    }

    fn ready_state(&self) -> ReadyState {
        ReadyState::Connecting
    }

    async fn send(&self, data: Bytes, is_string: bool) -> Result<()> {
        self.sent.lock().unwrap().push(Message { is_string, data });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.close_requested.store(true, Ordering::SeqCst);
        Ok(())
    }
}

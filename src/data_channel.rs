use crate::diagnostics::{diag, Diagnostics};
use crate::engine::{ChannelEvent, DataChannelEngine};
use crate::error::{Error, Result};
use crate::handler::{spawn, HandlerSlot, MaybeSendSync};
use crate::state::ReadyState;
use arc_swap::ArcSwap;
use bytes::Bytes;
use log::Level;
use std::pin::pin;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// One complete message received over a [DataChannel].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// `true` if the payload was sent as text, in which case it's valid UTF-8.
    pub is_string: bool,
    pub data: Bytes,
}

impl Message {
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Message {
            is_string: false,
            data: data.into(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Message {
            is_string: true,
            data: Bytes::from(text.into()),
        }
    }

    /// Returns the payload as text if it was sent as such.
    pub fn as_text(&self) -> Option<&str> {
        if self.is_string {
            std::str::from_utf8(&self.data).ok()
        } else {
            None
        }
    }
}

/// A labeled sub-stream multiplexed over a [crate::PeerConnection].
///
/// Handles are cheap to clone and all of them refer to the same channel. Notifications are
/// delivered in the order the engine reported them, for as long as the channel is open or
/// anybody keeps a handle to it.
#[derive(Clone)]
pub struct DataChannel {
    inner: Arc<DataChannelInner>,
}

struct DataChannelInner {
    engine: Arc<dyn DataChannelEngine>,
    label: String,
    status: ArcSwap<ChannelStatus>,
    changed: Notify,
    /// Cancelled when the owning connection closes.
    detached: CancellationToken,
    outgoing: UnboundedSender<Message>,
    diagnostics: Diagnostics,
    on_open: HandlerSlot<()>,
    on_close: HandlerSlot<()>,
    on_message: HandlerSlot<Message>,
    on_error: HandlerSlot<Error>,
}

#[derive(Debug, Clone)]
struct ChannelStatus {
    state: ReadyState,
    /// Failure reported by the engine, if any.
    reason: Option<Error>,
}

impl DataChannel {
    /// Wraps an engine channel. Outgoing messages start flowing right away, incoming
    /// notifications only after [DataChannel::listen] was called.
    pub(crate) fn new(
        engine: Box<dyn DataChannelEngine>,
        diagnostics: Diagnostics,
        detached: CancellationToken,
    ) -> Self {
        let engine: Arc<dyn DataChannelEngine> = Arc::from(engine);
        let (outgoing, outgoing_rx) = unbounded_channel();
        let inner = Arc::new(DataChannelInner {
            label: engine.label(),
            status: ArcSwap::from_pointee(ChannelStatus {
                state: engine.ready_state(),
                reason: None,
            }),
            engine,
            changed: Notify::new(),
            detached,
            outgoing,
            diagnostics,
            on_open: HandlerSlot::new("on_open"),
            on_close: HandlerSlot::new("on_close"),
            on_message: HandlerSlot::new("on_message"),
            on_error: HandlerSlot::new("on_error"),
        });
        spawn(write_loop(Arc::downgrade(&inner), outgoing_rx));
        DataChannel { inner }
    }

    /// Starts delivering engine notifications to the registered handlers.
    pub(crate) fn listen(&self, events: UnboundedReceiver<ChannelEvent>) {
        spawn(dispatch(self.inner.clone(), events));
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Stream id assigned to this channel. `None` until the engine assigned one.
    pub fn id(&self) -> Option<u16> {
        self.inner.engine.id()
    }

    pub fn ready_state(&self) -> ReadyState {
        if self.inner.detached.is_cancelled() {
            ReadyState::Closed
        } else {
            self.inner.status.load().state
        }
    }

    pub fn is_open(&self) -> bool {
        self.ready_state() == ReadyState::Open
    }

    /// Waits until the channel is ready to operate.
    ///
    /// # Returns
    ///
    /// If channel has been opened successfully, this method returns `Ok(true)`.
    /// If channel has been closed gracefully (or its connection was closed) it returns
    /// `Ok(false)`. If channel has been closed due to failure it returns `Err`.
    pub async fn ready(&self) -> Result<bool> {
        self.inner.ready().await
    }

    /// Enqueues a binary payload.
    ///
    /// Returns as soon as the payload is queued. Messages sent while the channel is still
    /// connecting are held back until it opens. Delivery failures are reported to the
    /// [DataChannel::on_error] handler, never through this call. It only fails when the channel
    /// is closing or closed already.
    pub fn send(&self, data: impl Into<Bytes>) -> Result<()> {
        self.enqueue(Message::binary(data))
    }

    /// Enqueues a text payload. See [DataChannel::send].
    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.enqueue(Message::text(text))
    }

    fn enqueue(&self, msg: Message) -> Result<()> {
        match self.ready_state() {
            ReadyState::Closing | ReadyState::Closed => Err(Error::channel_closed()),
            ReadyState::Connecting | ReadyState::Open => self
                .inner
                .outgoing
                .send(msg)
                .map_err(|_| Error::channel_closed()),
        }
    }

    /// Requests a graceful shutdown. Closing an already closed channel is a no-op, but a
    /// channel of a closed connection can't be closed anymore.
    pub async fn close(&self) -> Result<()> {
        if self.inner.detached.is_cancelled() {
            return Err(Error::channel_closed());
        }
        if self.inner.status.load().state == ReadyState::Closed {
            return Ok(());
        }
        self.inner.advance(ReadyState::Closing, None);
        diag!(
            self.inner.diagnostics,
            Level::Debug,
            "closing data channel '{}'",
            self.inner.label
        );
        self.inner.engine.close().await
    }

    pub fn on_open<F>(&self, f: F)
    where
        F: Fn() + MaybeSendSync + 'static,
    {
        self.inner.on_open.set(Box::new(move |()| f()));
    }

    pub fn on_close<F>(&self, f: F)
    where
        F: Fn() + MaybeSendSync + 'static,
    {
        self.inner.on_close.set(Box::new(move |()| f()));
    }

    /// Registers the handler receiving incoming messages, one complete message per call.
    pub fn on_message<F>(&self, f: F)
    where
        F: Fn(Message) + MaybeSendSync + 'static,
    {
        self.inner.on_message.set(Box::new(f));
    }

    pub fn on_error<F>(&self, f: F)
    where
        F: Fn(Error) + MaybeSendSync + 'static,
    {
        self.inner.on_error.set(Box::new(f));
    }
}

impl DataChannelInner {
    /// Moves the channel forward to `next`. Returns `false` if it's already there or past it.
    fn advance(&self, next: ReadyState, reason: Option<Error>) -> bool {
        let prev = self.status.rcu(|old| {
            if old.state.can_transition_to(next) {
                Arc::new(ChannelStatus {
                    state: next,
                    reason: reason.clone().or_else(|| old.reason.clone()),
                })
            } else {
                old.clone()
            }
        });
        let moved = prev.state.can_transition_to(next);
        if moved {
            self.changed.notify_waiters();
        }
        moved
    }

    async fn ready(&self) -> Result<bool> {
        loop {
            let mut notified = pin!(self.changed.notified());
            notified.as_mut().enable();
            if self.detached.is_cancelled() {
                return Ok(false);
            }
            let status = self.status.load_full();
            match status.state {
                ReadyState::Open => return Ok(true),
                ReadyState::Closing | ReadyState::Closed => {
                    return match &status.reason {
                        Some(reason) => Err(reason.clone()),
                        None => Ok(false),
                    }
                }
                ReadyState::Connecting => {
                    tokio::select! {
                        _ = notified => {}
                        _ = self.detached.cancelled() => {}
                    }
                }
            }
        }
    }

    /// Applies one engine notification. Returns `false` once no further notifications will
    /// follow.
    fn handle(&self, event: ChannelEvent) -> bool {
        match event {
            ChannelEvent::Open => {
                if self.advance(ReadyState::Open, None) {
                    diag!(self.diagnostics, Level::Debug, "data channel '{}' open", self.label);
                    self.on_open.emit(());
                }
            }
            ChannelEvent::Closing => {
                self.advance(ReadyState::Closing, None);
            }
            ChannelEvent::Close => {
                if self.advance(ReadyState::Closed, None) {
                    diag!(self.diagnostics, Level::Debug, "data channel '{}' closed", self.label);
                    self.on_close.emit(());
                }
                return false;
            }
            ChannelEvent::Error(e) => {
                diag!(
                    self.diagnostics,
                    Level::Warn,
                    "data channel '{}' failed: {}",
                    self.label,
                    e
                );
                // a failure before the channel opened means it never will
                if self.status.load().state == ReadyState::Connecting {
                    self.advance(ReadyState::Closed, Some(e.clone()));
                }
                self.on_error.emit(e);
            }
            ChannelEvent::Message(msg) => {
                if self.status.load().state != ReadyState::Closed {
                    self.on_message.emit(msg);
                }
            }
        }
        true
    }
}

/// Drains channel notifications. Keeps the channel alive until it closes, the same way an
/// engine keeps an open channel alive even if the application dropped every handle.
async fn dispatch(inner: Arc<DataChannelInner>, mut events: UnboundedReceiver<ChannelEvent>) {
    loop {
        let event = tokio::select! {
            biased;
            _ = inner.detached.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Some(event) => {
                if !inner.handle(event) {
                    break;
                }
            }
            None => {
                inner.advance(ReadyState::Closed, None);
                break;
            }
        }
    }
}

/// Hands queued messages to the engine one at a time, in the order they were sent.
async fn write_loop(inner: Weak<DataChannelInner>, mut outgoing: UnboundedReceiver<Message>) {
    while let Some(msg) = outgoing.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        match inner.ready().await {
            Ok(true) => {}
            _ => break,
        }
        if let Err(e) = inner.engine.send(msg.data, msg.is_string).await {
            diag!(
                inner.diagnostics,
                Level::Warn,
                "failed to send over data channel '{}': {}",
                inner.label,
                e
            );
            inner.on_error.emit(e);
        }
    }
}

impl std::fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataChannel")
            .field("label", &self.inner.label)
            .field("state", &self.ready_state())
            .finish()
    }
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod test {
    use super::*;
    use crate::engine::scripted::ScriptedChannel;
    use crate::engine::{channel_events, ChannelEvents};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn channel(label: &str) -> (DataChannel, ChannelEvents, ScriptedChannel, CancellationToken) {
        let engine = ScriptedChannel::new(label, 1);
        let (events, rx) = channel_events();
        let token = CancellationToken::new();
        let dc = DataChannel::new(
            Box::new(engine.clone()),
            Diagnostics::default(),
            token.clone(),
        );
        dc.listen(rx);
        (dc, events, engine, token)
    }

    #[tokio::test]
    async fn lifecycle_moves_forward() -> Result<()> {
        let (dc, events, _engine, _token) = channel("chat");
        assert_eq!(dc.label(), "chat");
        assert_eq!(dc.id(), Some(1));
        assert_eq!(dc.ready_state(), ReadyState::Connecting);

        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let tx = tx.clone();
            dc.on_open(move || {
                let _ = tx.send("open");
            });
        }
        dc.on_close(move || {
            let _ = tx.send("close");
        });

        events.emit(ChannelEvent::Open);
        assert!(dc.ready().await?);
        assert_eq!(rx.recv().await, Some("open"));

        // late or duplicate notifications never move the channel backwards
        events.emit(ChannelEvent::Open);
        events.emit(ChannelEvent::Close);
        assert_eq!(rx.recv().await, Some("close"));
        assert_eq!(dc.ready_state(), ReadyState::Closed);
        assert_eq!(dc.ready().await, Ok(false));
        assert!(dc.send("late").is_err());
        Ok(())
    }

    #[tokio::test]
    async fn messages_are_delivered_in_order() -> Result<()> {
        let (dc, events, _engine, _token) = channel("chat");
        let (tx, mut rx) = mpsc::unbounded_channel();
        dc.on_message(move |msg| {
            let _ = tx.send(msg);
        });
        events.emit(ChannelEvent::Open);
        for i in 0..10u8 {
            events.emit(ChannelEvent::Message(Message::binary(vec![i])));
        }
        events.emit(ChannelEvent::Message(Message::text("done")));

        for i in 0..10u8 {
            let msg = rx.recv().await.unwrap();
            assert!(!msg.is_string);
            assert_eq!(&msg.data[..], &[i]);
        }
        let last = rx.recv().await.unwrap();
        assert_eq!(last.as_text(), Some("done"));
        Ok(())
    }

    #[tokio::test]
    async fn sends_are_held_until_open() -> Result<()> {
        let (dc, events, engine, _token) = channel("chat");
        dc.send_text("first")?;
        dc.send(vec![1u8, 2, 3])?;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(engine.sent().is_empty());

        events.emit(ChannelEvent::Open);
        dc.ready().await?;
        tokio::time::timeout(Duration::from_secs(1), async {
            while engine.sent().len() < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        let sent = engine.sent();
        assert_eq!(sent[0], Message::text("first"));
        assert_eq!(sent[1], Message::binary(vec![1u8, 2, 3]));
        Ok(())
    }

    #[tokio::test]
    async fn failure_before_open_fails_ready() {
        let (dc, events, _engine, _token) = channel("chat");
        let (tx, mut rx) = mpsc::unbounded_channel();
        dc.on_error(move |e| {
            let _ = tx.send(e);
        });
        events.emit(ChannelEvent::Error(Error::Channel("sctp association lost".into())));
        let err = dc.ready().await.unwrap_err();
        assert_eq!(err, Error::Channel("sctp association lost".into()));
        assert!(matches!(rx.recv().await, Some(Error::Channel(_))));
    }

    #[tokio::test]
    async fn detached_channel_is_closed() {
        let (dc, events, _engine, token) = channel("chat");
        events.emit(ChannelEvent::Open);
        dc.ready().await.unwrap();

        token.cancel();
        assert_eq!(dc.ready_state(), ReadyState::Closed);
        assert_eq!(dc.ready().await, Ok(false));
        assert!(dc.send("x").unwrap_err().is_closed());
        assert!(matches!(dc.close().await, Err(Error::Channel(_))));
    }

    #[tokio::test]
    async fn close_is_forwarded_to_engine() -> Result<()> {
        let (dc, events, engine, _token) = channel("chat");
        events.emit(ChannelEvent::Open);
        dc.ready().await?;
        dc.close().await?;
        assert_eq!(dc.ready_state(), ReadyState::Closing);
        assert!(engine.close_requested());
        events.emit(ChannelEvent::Close);
        assert_eq!(dc.ready().await, Ok(false));
        // closing a closed channel is a no-op
        tokio::time::sleep(Duration::from_millis(10)).await;
        dc.close().await?;
        Ok(())
    }
}

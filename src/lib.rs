//! `rtcpeer` is a single WebRTC peer connection API running on top of two different engines:
//! - natively it drives [webrtc](https://webrtc.rs) on the tokio runtime,
//! - on `wasm32` it drives the browser's own `RTCPeerConnection`.
//!
//! Both are hidden behind the same [PeerConnection] and [DataChannel] types, sharing one
//! signaling state machine, one event model and one error taxonomy. Application code can be
//! written once and negotiate with either engine underneath.
//!
//! The crate doesn't define any signaling protocol. [SessionDescription]s and [IceCandidate]s
//! serialize to the browser dictionary format (`{type, sdp}` and
//! `{candidate, sdpMid, sdpMLineIndex}`) and have to be delivered to the remote peer by the
//! application, ie. via WebSockets. [Signal] can be used as an envelope for both.
//!
//! # Examples
//!
//! ```rust,no_run
//! use rtcpeer::{Configuration, Error, PeerConnection};
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let mut config = Configuration::new();
//!     config.add_ice_server("stun:stun.l.google.com:19302", &[])?;
//!
//!     let offerer = Arc::new(PeerConnection::new(config.clone()).await?);
//!     let answerer = Arc::new(PeerConnection::new(config).await?);
//!
//!     // candidates would normally travel over the application's signaling channel
//!     let (tx, mut rx) = mpsc::unbounded_channel();
//!     offerer.on_ice_candidate(move |candidate| {
//!         let _ = tx.send(candidate);
//!     });
//!     answerer.on_data_channel(|dc| {
//!         let label = dc.label().to_owned();
//!         dc.on_message(move |msg| {
//!             println!("{label}: {:?}", msg.as_text());
//!         });
//!     });
//!
//!     let dc = offerer.create_data_channel("chat").await?;
//!     let offer = offerer.create_offer().await?;
//!     offerer.set_local_description(offer.clone()).await?;
//!     answerer.set_remote_description(offer).await?;
//!     let answer = answerer.create_answer().await?;
//!     answerer.set_local_description(answer.clone()).await?;
//!     offerer.set_remote_description(answer).await?;
//!
//!     let remote = answerer.clone();
//!     tokio::spawn(async move {
//!         while let Some(candidate) = rx.recv().await {
//!             let _ = remote.add_ice_candidate(candidate).await;
//!         }
//!     });
//!
//!     offerer.connected().await?;
//!     if dc.ready().await? {
//!         dc.send_text("hello")?;
//!     }
//!
//!     offerer.close().await?;
//!     answerer.close().await?;
//!     Ok(())
//! }
//! ```

#[cfg(not(target_arch = "wasm32"))]
mod completion;
pub mod config;
pub mod data_channel;
pub mod description;
pub mod diagnostics;
pub mod engine;
pub mod error;
mod handler;
pub mod media;
pub mod peer_connection;
pub mod state;

pub use config::{Configuration, ConfigurationBuilder, IceCredentialType, IceServer};
pub use data_channel::{DataChannel, Message};
pub use description::{IceCandidate, SdpType, SessionDescription, Signal};
pub use diagnostics::Diagnostics;
pub use engine::{Backend, DataChannelInit, IceCandidateError};
pub use error::{Error, Result};
pub use handler::{MaybeSend, MaybeSendSync};
pub use media::{
    get_user_media, AudioConstraints, AudioMandatory, MediaConstraints, MediaStream,
    TrackConstraints, VideoConstraints, VideoMandatory,
};
pub use peer_connection::{Options, PeerConnection};
pub use state::{
    IceConnectionState, IceGatheringState, PeerConnectionState, ReadyState, SignalingState,
};

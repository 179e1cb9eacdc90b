//! Capture constraints and media stream handles.

use crate::engine::default_backend;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Mandatory video capture constraints. Unset fields are left to the capture backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoMandatory {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_frame_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_frame_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aspect_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_aspect_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_aspect_rate: Option<f64>,
}

/// Mandatory audio capture constraints. Unset fields are left to the capture backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioMandatory {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub echo_cancellation: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_channel_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_channel_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_sample_rate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_sample_rate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_latency: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_latency: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_volume: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_volume: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoConstraints {
    pub mandatory: VideoMandatory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConstraints {
    pub mandatory: AudioMandatory,
}

/// Either a plain on/off flag or a structured constraint record for one kind of track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TrackConstraints<T> {
    Enabled(bool),
    Constrained(T),
}

impl<T> TrackConstraints<T> {
    pub fn is_requested(&self) -> bool {
        match self {
            TrackConstraints::Enabled(enabled) => *enabled,
            TrackConstraints::Constrained(_) => true,
        }
    }
}

impl<T> From<bool> for TrackConstraints<T> {
    fn from(value: bool) -> Self {
        TrackConstraints::Enabled(value)
    }
}

impl From<VideoConstraints> for TrackConstraints<VideoConstraints> {
    fn from(value: VideoConstraints) -> Self {
        TrackConstraints::Constrained(value)
    }
}

impl From<AudioConstraints> for TrackConstraints<AudioConstraints> {
    fn from(value: AudioConstraints) -> Self {
        TrackConstraints::Constrained(value)
    }
}

/// Capture request passed to [get_user_media].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub video: TrackConstraints<VideoConstraints>,
    pub audio: TrackConstraints<AudioConstraints>,
}

impl MediaConstraints {
    pub fn new(
        video: impl Into<TrackConstraints<VideoConstraints>>,
        audio: impl Into<TrackConstraints<AudioConstraints>>,
    ) -> Self {
        MediaConstraints {
            video: video.into(),
            audio: audio.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.video.is_requested() && !self.audio.is_requested() {
            Err(Error::Validation(
                "media constraints must request at least one of audio or video".into(),
            ))
        } else {
            Ok(())
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
mod handle {
    use std::sync::Arc;
    use webrtc::track::track_local::TrackLocal;
    use webrtc::track::track_remote::TrackRemote;

    #[derive(Clone, Default)]
    pub(crate) struct StreamHandle {
        pub local: Vec<Arc<dyn TrackLocal + Send + Sync>>,
        pub remote: Vec<Arc<TrackRemote>>,
    }
}

#[cfg(target_arch = "wasm32")]
mod handle {
    #[derive(Clone)]
    pub(crate) struct StreamHandle(pub web_sys::MediaStream);
}

pub(crate) use handle::StreamHandle;

/// Opaque handle to a set of media tracks, owned by whoever captured or received it.
#[derive(Clone)]
pub struct MediaStream {
    id: String,
    pub(crate) handle: StreamHandle,
}

impl MediaStream {
    pub(crate) fn from_handle(id: impl Into<String>, handle: StreamHandle) -> Self {
        MediaStream {
            id: id.into(),
            handle,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl MediaStream {
    /// Wraps application provided local tracks (ie. a `TrackLocalStaticSample` fed by the
    /// application's own encoder) so they can be attached with
    /// [crate::PeerConnection::add_stream].
    pub fn from_tracks(
        id: impl Into<String>,
        tracks: Vec<std::sync::Arc<dyn webrtc::track::track_local::TrackLocal + Send + Sync>>,
    ) -> Self {
        MediaStream::from_handle(
            id,
            StreamHandle {
                local: tracks,
                remote: Vec::new(),
            },
        )
    }

    /// Tracks received from the remote peer.
    pub fn remote_tracks(&self) -> &[std::sync::Arc<webrtc::track::track_remote::TrackRemote>] {
        &self.handle.remote
    }

    pub fn local_tracks(
        &self,
    ) -> &[std::sync::Arc<dyn webrtc::track::track_local::TrackLocal + Send + Sync>] {
        &self.handle.local
    }
}

#[cfg(target_arch = "wasm32")]
impl MediaStream {
    pub fn as_web_sys(&self) -> &web_sys::MediaStream {
        &self.handle.0
    }
}

impl std::fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStream").field("id", &self.id).finish()
    }
}

/// Asks the capture backend for a stream matching `constraints`, suspending until access is
/// granted or denied.
///
/// Fails with [Error::UnsupportedOperation] on backends without capture support (the native
/// one), with [Error::Capture] when access is denied or no device is present.
pub async fn get_user_media(constraints: &MediaConstraints) -> Result<MediaStream> {
    constraints.validate()?;
    default_backend().get_user_media(constraints).await
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn constraints_wire_format() {
        let c = MediaConstraints::new(true, false);
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json, serde_json::json!({"video": true, "audio": false}));

        let c = MediaConstraints::new(
            VideoConstraints {
                mandatory: VideoMandatory {
                    max_width: Some(1280),
                    min_frame_rate: Some(15.0),
                    ..Default::default()
                },
            },
            true,
        );
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["video"]["mandatory"]["maxWidth"], 1280);
        assert_eq!(json["video"]["mandatory"]["minFrameRate"], 15.0);
        assert_eq!(json["audio"], true);
        let decoded: MediaConstraints = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, c);
    }

    #[test]
    fn at_least_one_track_required() {
        assert!(MediaConstraints::new(false, false).validate().is_err());
        assert!(MediaConstraints::new(false, true).validate().is_ok());
        let audio = AudioConstraints {
            mandatory: AudioMandatory {
                echo_cancellation: Some(true),
                ..Default::default()
            },
        };
        assert!(MediaConstraints::new(false, audio).validate().is_ok());
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[tokio::test]
    async fn capture_is_unsupported_natively() {
        let err = get_user_media(&MediaConstraints::new(true, true))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedOperation(_)));

        let err = get_user_media(&MediaConstraints::new(false, false))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}

//! Local media abstraction
//!
//! Camera and microphone access sits behind the [`MediaDevices`] trait so the call
//! session never talks to a platform API directly. A [`MediaStream`] is an owned
//! handle to a set of live tracks; whoever owns the local stream is responsible for
//! calling [`MediaStream::stop_all_tracks`] when the call ends.
//!
//! ```text
//! ┌─────────────────────┐    ┌─────────────────────┐    ┌─────────────────────┐
//! │    CallSession      │    │   MediaDevices      │    │  Platform devices   │
//! │                     │    │                     │    │                     │
//! │ place_call()        │───▶│ acquire()           │───▶│ camera / mic / mock │
//! │ end_call()          │    │                     │    │                     │
//! └─────────────────────┘    └─────────────────────┘    └─────────────────────┘
//! ```

pub mod mock;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

pub use mock::{MockBehavior, MockMediaDevices};

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Microphone or remote audio
    Audio,
    /// Camera or remote video
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// Which devices a call wants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Request a camera track
    pub video: bool,
    /// Request a microphone track
    pub audio: bool,
}

impl MediaConstraints {
    /// Camera and microphone
    pub fn audio_video() -> Self {
        Self {
            video: true,
            audio: true,
        }
    }

    /// Microphone only
    pub fn audio_only() -> Self {
        Self {
            video: false,
            audio: true,
        }
    }

    /// True when no device is requested at all
    pub fn is_empty(&self) -> bool {
        !self.video && !self.audio
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self::audio_video()
    }
}

/// Media device errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    /// The user (or platform policy) refused access
    #[error("permission to access media devices was denied")]
    PermissionDenied,

    /// No device of the requested kind exists
    #[error("no {kind} device found")]
    DeviceNotFound { kind: TrackKind },

    /// Constraints requested neither audio nor video
    #[error("media constraints request no devices")]
    EmptyConstraints,

    /// Platform-specific failure
    #[error("platform media error: {message}")]
    Platform { message: String },
}

/// Result type for media operations
pub type MediaResult<T> = std::result::Result<T, MediaError>;

/// A single audio or video track
///
/// Clones share the same liveness flag, so stopping any clone stops the track for
/// every holder, the way a device track behaves.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    label: String,
    live: Arc<AtomicBool>,
}

impl MediaTrack {
    /// Create a live track
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            label: label.into(),
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether the underlying device is still producing
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Stop the track; returns true if this call actually stopped it
    pub fn stop(&self) -> bool {
        self.live.swap(false, Ordering::AcqRel)
    }
}

/// An owned handle to live audio/video data
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    /// Create a stream from a set of tracks
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    /// Tracks of the given kind
    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(move |t| t.kind == kind)
    }

    /// Number of tracks still live
    pub fn active_tracks(&self) -> usize {
        self.tracks.iter().filter(|t| t.is_live()).count()
    }

    /// Whether any track is still live
    pub fn is_active(&self) -> bool {
        self.active_tracks() > 0
    }

    /// Stop every track; returns how many were live
    pub fn stop_all_tracks(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }
}

/// Capability to acquire local camera/microphone streams
///
/// Acquisition may suspend (permission prompts) and may fail; implementations must
/// not hold any device once they return an error.
#[async_trait::async_trait]
pub trait MediaDevices: Send + Sync + fmt::Debug {
    /// Acquire a stream satisfying the constraints
    async fn acquire(&self, constraints: &MediaConstraints) -> MediaResult<MediaStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_all_tracks_is_shared_across_clones() {
        let stream = MediaStream::new(vec![
            MediaTrack::new(TrackKind::Audio, "mic"),
            MediaTrack::new(TrackKind::Video, "cam"),
        ]);
        let held_elsewhere = stream.clone();

        assert_eq!(held_elsewhere.active_tracks(), 2);
        assert_eq!(stream.stop_all_tracks(), 2);
        assert_eq!(held_elsewhere.active_tracks(), 0);
        assert!(!held_elsewhere.is_active());

        // Second stop finds nothing live
        assert_eq!(stream.stop_all_tracks(), 0);
    }

    #[test]
    fn test_tracks_of_kind() {
        let stream = MediaStream::new(vec![
            MediaTrack::new(TrackKind::Audio, "mic"),
            MediaTrack::new(TrackKind::Video, "cam"),
        ]);
        assert_eq!(stream.tracks_of(TrackKind::Video).count(), 1);
        assert_eq!(stream.tracks_of(TrackKind::Audio).next().map(|t| t.label()), Some("mic"));
    }

    #[test]
    fn test_constraints() {
        assert!(!MediaConstraints::default().is_empty());
        assert!(MediaConstraints { video: false, audio: false }.is_empty());
        assert_eq!(MediaConstraints::audio_only().video, false);
    }
}

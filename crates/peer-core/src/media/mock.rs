//! Mock media devices
//!
//! Stands in for camera/microphone access in tests and in the demo CLI. Every track
//! handed out is remembered so callers can check that nothing is left running.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

use super::{MediaConstraints, MediaDevices, MediaError, MediaResult, MediaStream, MediaTrack, TrackKind};

/// How the mock responds to acquisition requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockBehavior {
    /// Hand out live tracks
    Grant,
    /// Fail as if the user refused the permission prompt
    Deny,
    /// Fail as if no camera/microphone is attached
    NoDevice,
}

/// In-memory [`MediaDevices`] implementation
#[derive(Debug)]
pub struct MockMediaDevices {
    behavior: Mutex<MockBehavior>,
    issued: Mutex<Vec<MediaTrack>>,
    attempts: AtomicUsize,
}

impl MockMediaDevices {
    /// Devices that grant every request
    pub fn new() -> Self {
        Self::with_behavior(MockBehavior::Grant)
    }

    /// Devices that refuse every request
    pub fn denying() -> Self {
        Self::with_behavior(MockBehavior::Deny)
    }

    pub fn with_behavior(behavior: MockBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            issued: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Change the behavior for subsequent requests
    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.lock() = behavior;
    }

    /// Number of acquisition attempts, successful or not
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Acquire)
    }

    /// Number of tracks ever handed out
    pub fn issued_tracks(&self) -> usize {
        self.issued.lock().len()
    }

    /// Number of handed-out tracks that are still live
    pub fn live_tracks(&self) -> usize {
        self.issued.lock().iter().filter(|t| t.is_live()).count()
    }
}

impl Default for MockMediaDevices {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MediaDevices for MockMediaDevices {
    async fn acquire(&self, constraints: &MediaConstraints) -> MediaResult<MediaStream> {
        self.attempts.fetch_add(1, Ordering::AcqRel);

        // Real devices suspend on the permission prompt
        tokio::task::yield_now().await;

        if constraints.is_empty() {
            return Err(MediaError::EmptyConstraints);
        }

        let behavior = self.behavior.lock().clone();
        match behavior {
            MockBehavior::Deny => return Err(MediaError::PermissionDenied),
            MockBehavior::NoDevice => {
                let kind = if constraints.video { TrackKind::Video } else { TrackKind::Audio };
                return Err(MediaError::DeviceNotFound { kind });
            }
            MockBehavior::Grant => {}
        }

        let mut tracks = Vec::with_capacity(2);
        if constraints.audio {
            tracks.push(MediaTrack::new(TrackKind::Audio, "mock-microphone"));
        }
        if constraints.video {
            tracks.push(MediaTrack::new(TrackKind::Video, "mock-camera"));
        }
        self.issued.lock().extend(tracks.iter().cloned());

        let stream = MediaStream::new(tracks);
        debug!("Mock devices issued stream {} with {} tracks", stream.id(), stream.tracks().len());
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_grant_tracks_are_counted() {
        let devices = MockMediaDevices::new();
        let stream = devices.acquire(&MediaConstraints::default()).await.unwrap();

        assert_eq!(stream.tracks().len(), 2);
        assert_eq!(devices.live_tracks(), 2);

        stream.stop_all_tracks();
        assert_eq!(devices.live_tracks(), 0);
        assert_eq!(devices.issued_tracks(), 2);
    }

    #[tokio::test]
    async fn test_deny_and_no_device() {
        let devices = MockMediaDevices::denying();
        let err = devices.acquire(&MediaConstraints::default()).await.unwrap_err();
        assert_eq!(err, MediaError::PermissionDenied);

        devices.set_behavior(MockBehavior::NoDevice);
        let err = devices.acquire(&MediaConstraints::audio_only()).await.unwrap_err();
        assert_eq!(err, MediaError::DeviceNotFound { kind: TrackKind::Audio });

        assert_eq!(devices.attempts(), 2);
        assert_eq!(devices.issued_tracks(), 0);
    }

    #[tokio::test]
    async fn test_empty_constraints_rejected() {
        let devices = MockMediaDevices::new();
        let err = devices
            .acquire(&MediaConstraints { video: false, audio: false })
            .await
            .unwrap_err();
        assert_eq!(err, MediaError::EmptyConstraints);
    }
}

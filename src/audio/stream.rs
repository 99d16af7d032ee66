//! Live streams and media tracks
//!
//! A `LiveStream` is the session's handle on device-provided tracks. Audio
//! tracks publish interleaved PCM16 into a shared `SignalFeed`; the recording
//! engine subscribes to the feed and the analyser taps it for visualization.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::waveform::Analyser;

/// Kind of media carried by a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Where a stream came from. Screen streams get end observers on their
/// video tracks so a revoked share stops the recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSource {
    Microphone,
    Camera,
    Screen,
    Custom,
}

/// PCM layout of the samples published on a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for SignalFormat {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 1,
        }
    }
}

/// One packet of interleaved samples as delivered by the device.
pub type SamplePacket = Arc<[i16]>;

/// Receiving end of a feed subscription.
pub type SampleReceiver = mpsc::UnboundedReceiver<SamplePacket>;

/// Fan-out of captured samples to the recorder(s) and the analyser.
///
/// `publish` is called from device callbacks, so it never waits on a
/// consumer: subscribers are unbounded and closed ones are pruned.
pub struct SignalFeed {
    format: SignalFormat,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SamplePacket>>>,
    analyser: Analyser,
}

impl SignalFeed {
    pub fn new(format: SignalFormat) -> Arc<Self> {
        Arc::new(Self {
            format,
            subscribers: Mutex::new(Vec::new()),
            analyser: Analyser::default(),
        })
    }

    pub fn format(&self) -> SignalFormat {
        self.format
    }

    pub fn analyser(&self) -> &Analyser {
        &self.analyser
    }

    /// Subscribe to every packet published from now on.
    pub fn subscribe(&self) -> SampleReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn publish(&self, samples: &[i16]) {
        self.analyser
            .push_interleaved(samples, self.format.channels as usize);

        let packet: SamplePacket = Arc::from(samples);
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(packet.clone()).is_ok());
    }
}

impl fmt::Debug for SignalFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalFeed")
            .field("format", &self.format)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

type StopHook = Box<dyn FnOnce() + Send>;

/// Callback fired when the platform ends a track.
pub type EndedObserver = Arc<dyn Fn(&MediaTrack) + Send + Sync>;

/// A single device track. Stopping is idempotent; only platform-initiated
/// ends (`end`) notify observers.
pub struct MediaTrack {
    id: Uuid,
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    ended: AtomicBool,
    feed: Option<Arc<SignalFeed>>,
    stop_hook: Mutex<Option<StopHook>>,
    observers: Mutex<Vec<EndedObserver>>,
}

impl MediaTrack {
    /// An audio track publishing into `feed`. `on_stop` releases the device.
    pub fn audio(
        label: impl Into<String>,
        feed: Arc<SignalFeed>,
        on_stop: impl FnOnce() + Send + 'static,
    ) -> Arc<Self> {
        Arc::new(Self::build(
            TrackKind::Audio,
            label.into(),
            Some(feed),
            Some(Box::new(on_stop)),
        ))
    }

    pub fn video(label: impl Into<String>, on_stop: impl FnOnce() + Send + 'static) -> Arc<Self> {
        Arc::new(Self::build(
            TrackKind::Video,
            label.into(),
            None,
            Some(Box::new(on_stop)),
        ))
    }

    fn build(
        kind: TrackKind,
        label: String,
        feed: Option<Arc<SignalFeed>>,
        stop_hook: Option<StopHook>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            label,
            enabled: AtomicBool::new(true),
            ended: AtomicBool::new(false),
            feed,
            stop_hook: Mutex::new(stop_hook),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn feed(&self) -> Option<&Arc<SignalFeed>> {
        self.feed.as_ref()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Disabled audio tracks keep running but publish silence.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Publish captured samples. Ignored once the track has ended.
    pub fn publish(&self, samples: &[i16]) {
        if self.is_ended() {
            return;
        }
        let Some(feed) = &self.feed else {
            return;
        };
        if self.is_enabled() {
            feed.publish(samples);
        } else {
            feed.publish(&vec![0i16; samples.len()]);
        }
    }

    /// Stop the track locally and release its device.
    pub fn stop(&self) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        self.run_stop_hook();
        log::debug!("Track stopped: {} ({:?})", self.label, self.kind);
    }

    /// The platform ended the track (device lost, sharing revoked).
    pub fn end(&self) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        self.run_stop_hook();
        log::info!("Track ended by platform: {} ({:?})", self.label, self.kind);

        let observers: Vec<EndedObserver> = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            observer(self);
        }
    }

    pub fn on_ended(&self, observer: EndedObserver) {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    fn run_stop_hook(&self) {
        let hook = self
            .stop_hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("label", &self.label)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// Handle on a set of tracks sharing one signal feed.
#[derive(Debug, Clone)]
pub struct LiveStream {
    id: Uuid,
    source: StreamSource,
    tracks: Vec<Arc<MediaTrack>>,
    feed: Arc<SignalFeed>,
}

impl LiveStream {
    pub fn new(source: StreamSource, feed: Arc<SignalFeed>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            tracks: Vec::new(),
            feed,
        }
    }

    /// A stream with one audio track whose samples are pushed by the caller
    /// (tests, custom sources). Returns the stream and its track.
    pub fn synthetic(format: SignalFormat) -> (Self, Arc<MediaTrack>) {
        let feed = SignalFeed::new(format);
        let track = MediaTrack::audio("synthetic", feed.clone(), || {});
        let stream = Self::new(StreamSource::Custom, feed).with_track(track.clone());
        (stream, track)
    }

    pub fn with_track(mut self, track: Arc<MediaTrack>) -> Self {
        self.add_track(track);
        self
    }

    pub fn add_track(&mut self, track: Arc<MediaTrack>) {
        self.tracks.push(track);
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn source(&self) -> StreamSource {
        self.source
    }

    pub fn feed(&self) -> &Arc<SignalFeed> {
        &self.feed
    }

    pub fn analyser(&self) -> &Analyser {
        self.feed.analyser()
    }

    pub fn format(&self) -> SignalFormat {
        self.feed.format()
    }

    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &Arc<MediaTrack>> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &Arc<MediaTrack>> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Video)
    }

    /// Move the audio tracks of `other` into this stream. A stream without
    /// audio of its own takes over the other stream's feed.
    pub fn merge_audio_from(&mut self, other: LiveStream) {
        if self.audio_tracks().next().is_none() {
            self.feed = other.feed.clone();
        }
        for track in other.tracks {
            if track.kind() == TrackKind::Audio {
                self.tracks.push(track);
            } else {
                track.stop();
            }
        }
    }

    /// Usable for recording: has tracks and none of them has ended.
    pub fn is_live(&self) -> bool {
        !self.tracks.is_empty() && !self.has_ended_track()
    }

    pub fn has_ended_track(&self) -> bool {
        self.tracks.iter().any(|t| t.is_ended())
    }

    pub fn has_live_audio(&self) -> bool {
        self.audio_tracks().any(|t| !t.is_ended())
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        for track in self.audio_tracks() {
            track.set_enabled(enabled);
        }
    }

    /// Stop every track. Safe to call repeatedly.
    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    /// A view sharing only the tracks of `kind`, for previews.
    pub fn view(&self, kind: TrackKind) -> Option<LiveStream> {
        let tracks: Vec<_> = self
            .tracks
            .iter()
            .filter(|t| t.kind() == kind)
            .cloned()
            .collect();
        if tracks.is_empty() {
            return None;
        }
        Some(LiveStream {
            id: self.id,
            source: self.source,
            tracks,
            feed: self.feed.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn stop_runs_hook_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_hook = calls.clone();
        let feed = SignalFeed::new(SignalFormat::default());
        let track = MediaTrack::audio("mic", feed, move || {
            calls_hook.fetch_add(1, Ordering::SeqCst);
        });

        track.stop();
        track.stop();
        track.end();

        assert!(track.is_ended());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn local_stop_does_not_notify_observers() {
        let notified = Arc::new(AtomicUsize::new(0));
        let n = notified.clone();
        let track = MediaTrack::video("screen", || {});
        track.on_ended(Arc::new(move |_| {
            n.fetch_add(1, Ordering::SeqCst);
        }));

        track.stop();
        assert_eq!(notified.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn platform_end_notifies_observers() {
        let notified = Arc::new(AtomicUsize::new(0));
        let n = notified.clone();
        let track = MediaTrack::video("screen", || {});
        track.on_ended(Arc::new(move |_| {
            n.fetch_add(1, Ordering::SeqCst);
        }));

        track.end();
        track.end();
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disabled_track_publishes_silence() {
        let (stream, track) = LiveStream::synthetic(SignalFormat::default());
        let mut rx = stream.feed().subscribe();

        stream.set_audio_enabled(false);
        track.publish(&[100, -100, 200]);
        stream.set_audio_enabled(true);
        track.publish(&[7]);

        assert_eq!(&*rx.recv().await.unwrap(), &[0, 0, 0]);
        assert_eq!(&*rx.recv().await.unwrap(), &[7]);
    }

    #[test]
    fn ended_track_marks_stream_not_live() {
        let (stream, track) = LiveStream::synthetic(SignalFormat::default());
        assert!(stream.is_live());
        track.end();
        assert!(!stream.is_live());
        assert!(stream.has_ended_track());
    }

    #[test]
    fn merge_adopts_feed_when_screen_has_no_audio() {
        let screen_feed = SignalFeed::new(SignalFormat::default());
        let mut screen = LiveStream::new(StreamSource::Screen, screen_feed)
            .with_track(MediaTrack::video("screen", || {}));
        let (mic, _) = LiveStream::synthetic(SignalFormat {
            sample_rate: 44_100,
            channels: 2,
        });

        screen.merge_audio_from(mic);

        assert_eq!(screen.tracks().len(), 2);
        assert_eq!(screen.format().sample_rate, 44_100);
        assert!(screen.view(TrackKind::Audio).is_some());
        assert_eq!(screen.view(TrackKind::Video).unwrap().tracks().len(), 1);
    }
}

// Copyright (C) 2025 Video Receiver contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

//! The reception session and its public control surface.
//!
//! A [`VideoReceiver`] owns one control thread that performs every graph
//! mutation and every bus-message reaction. The public entry points are
//! thread-safe posting stubs: they enqueue a task for the control thread and
//! return without blocking. State observable from the outside is mirrored
//! into atomics by the control thread and read through the accessors here;
//! edge notifications are delivered to [`VideoReceiver::subscribe`] channels.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{mpsc, Arc, LazyLock, Mutex as StdMutex};
use std::thread;
use std::time::{Duration, Instant};

mod controller;

use crate::recorder::FileFormat;
use crate::runtime::Runtime;
use controller::Task;

pub(crate) static CAT: LazyLock<gst::DebugCategory> = LazyLock::new(|| {
    gst::DebugCategory::new(
        "videoreceiver",
        gst::DebugColorFlags::empty(),
        Some("Video receiver session"),
    )
});

/// Top-level session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Streaming,
    Stopping,
    Failed,
}

/// Lifecycle of the decoding branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    Absent,
    Attaching,
    Active,
    Detaching,
}

/// Lifecycle of the recording branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Absent,
    AwaitingKeyframe,
    Active,
    Detaching,
}

/// Edge notifications emitted to subscribers.
///
/// Events carry no payload; they invite the subscriber to read the matching
/// accessor on [`VideoReceiver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverEvent {
    StreamingChanged,
    DecodingChanged,
    RecordingChanged,
    VideoFileChanged,
    ImageFileChanged,
    VideoSizeChanged,
    GotFirstRecordingKeyframe,
    RestartTimeout,
}

/// Session configuration that survives restarts.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Pause between an automatic stop and the restart that follows it.
    pub restart_delay: Duration,
    /// RTSP connect timeout, microsecond precision on the wire.
    pub rtsp_timeout: Duration,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        ReceiverConfig {
            restart_delay: Duration::from_millis(1389),
            rtsp_timeout: Duration::from_secs(5),
        }
    }
}

pub(crate) struct Shared {
    pub(crate) runtime: Runtime,
    pub(crate) config: ReceiverConfig,

    queue: Mutex<VecDeque<Task>>,
    cond: Condvar,

    session: AtomicU8,
    decoder: AtomicU8,
    recorder: AtomicU8,
    streaming: AtomicBool,
    decoding: AtomicBool,
    recording: AtomicBool,

    epoch: Instant,
    last_frame_ms: AtomicU64,

    video_size: StdMutex<(u32, u32)>,
    video_file: StdMutex<Option<PathBuf>>,
    image_file: StdMutex<Option<PathBuf>>,
    subscribers: StdMutex<Vec<mpsc::Sender<ReceiverEvent>>>,
}

impl Shared {
    fn new(runtime: Runtime, config: ReceiverConfig) -> Self {
        Shared {
            runtime,
            config,
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            session: AtomicU8::new(SessionState::Idle as u8),
            decoder: AtomicU8::new(DecoderState::Absent as u8),
            recorder: AtomicU8::new(RecorderState::Absent as u8),
            streaming: AtomicBool::new(false),
            decoding: AtomicBool::new(false),
            recording: AtomicBool::new(false),
            epoch: Instant::now(),
            last_frame_ms: AtomicU64::new(0),
            video_size: StdMutex::new((0, 0)),
            video_file: StdMutex::new(None),
            image_file: StdMutex::new(None),
            subscribers: StdMutex::new(Vec::new()),
        }
    }

    pub(crate) fn post(&self, task: Task) {
        self.queue.lock().push_back(task);
        self.cond.notify_one();
    }

    /// Pop the next task, waiting at most until `deadline`.
    pub(crate) fn next_task(&self, deadline: Instant) -> Option<Task> {
        let mut queue = self.queue.lock();
        loop {
            if let Some(task) = queue.pop_front() {
                return Some(task);
            }
            if self.cond.wait_until(&mut queue, deadline).timed_out() {
                return queue.pop_front();
            }
        }
    }

    pub(crate) fn emit(&self, event: ReceiverEvent) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|sender| sender.send(event).is_ok());
    }

    pub(crate) fn session(&self) -> SessionState {
        match self.session.load(Ordering::SeqCst) {
            0 => SessionState::Idle,
            1 => SessionState::Starting,
            2 => SessionState::Streaming,
            3 => SessionState::Stopping,
            _ => SessionState::Failed,
        }
    }

    pub(crate) fn set_session(&self, state: SessionState) {
        self.session.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn set_decoder_state(&self, state: DecoderState) {
        self.decoder.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn set_recorder_state(&self, state: RecorderState) {
        self.recorder.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn set_streaming(&self, streaming: bool) {
        if self.streaming.swap(streaming, Ordering::SeqCst) != streaming {
            self.emit(ReceiverEvent::StreamingChanged);
        }
    }

    pub(crate) fn set_decoding(&self, decoding: bool) {
        if self.decoding.swap(decoding, Ordering::SeqCst) != decoding {
            self.emit(ReceiverEvent::DecodingChanged);
        }
    }

    pub(crate) fn set_recording(&self, recording: bool) {
        if self.recording.swap(recording, Ordering::SeqCst) != recording {
            self.emit(ReceiverEvent::RecordingChanged);
        }
    }

    pub(crate) fn set_video_size(&self, size: (u32, u32)) {
        let changed = {
            let mut current = self.video_size.lock().unwrap();
            let changed = *current != size;
            *current = size;
            changed
        };
        if changed {
            self.emit(ReceiverEvent::VideoSizeChanged);
        }
    }

    pub(crate) fn set_video_file(&self, path: Option<PathBuf>) {
        *self.video_file.lock().unwrap() = path;
    }

    pub(crate) fn set_image_file(&self, path: Option<PathBuf>) {
        *self.image_file.lock().unwrap() = path;
    }

    /// Note a frame arrival on the rendering sink, feeding the watchdog.
    pub(crate) fn note_frame(&self) {
        let ms = self.epoch.elapsed().as_millis() as u64;
        self.last_frame_ms.store(ms, Ordering::Relaxed);
    }

    pub(crate) fn last_frame_age(&self, now: Instant) -> Duration {
        let now_ms = now.duration_since(self.epoch).as_millis() as u64;
        let last_ms = self.last_frame_ms.load(Ordering::Relaxed);
        Duration::from_millis(now_ms.saturating_sub(last_ms))
    }
}

/// A live video reception session.
///
/// Created idle; [`start`](Self::start) brings up the ingest, after which
/// the decoding and recording branches can be attached and detached
/// independently without disturbing the stream.
pub struct VideoReceiver {
    shared: Arc<Shared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl VideoReceiver {
    pub fn new(runtime: &Runtime, config: ReceiverConfig) -> Self {
        let shared = Arc::new(Shared::new(runtime.clone(), config));

        let thread_shared = shared.clone();
        let thread = thread::Builder::new()
            .name("videoreceiver".into())
            .spawn(move || controller::run(thread_shared))
            .expect("Failed to spawn receiver control thread");

        VideoReceiver {
            shared,
            thread: Some(thread),
        }
    }

    /// Start receiving from `uri`, restarting the stream whenever no frame
    /// arrives for `timeout` while decoding.
    pub fn start(&self, uri: &str, timeout: Duration) {
        self.shared.post(Task::Start {
            uri: uri.to_string(),
            timeout,
        });
    }

    /// Stop the session, draining both branches before teardown.
    pub fn stop(&self) {
        self.shared.post(Task::Stop);
    }

    /// Attach the decoding branch, rendering into `video_sink`.
    ///
    /// The sink is an opaque element with a single sink pad; the decoder
    /// negotiates caps and context against it.
    pub fn start_decoding(&self, video_sink: gst::Element) {
        self.shared.post(Task::StartDecoding { sink: video_sink });
    }

    /// Detach the decoding branch, leaving the stream running.
    pub fn stop_decoding(&self) {
        self.shared.post(Task::StopDecoding);
    }

    /// Attach the recording branch. The output file starts with a keyframe
    /// at presentation time zero.
    pub fn start_recording(&self, path: impl Into<PathBuf>, format: FileFormat) {
        self.shared.post(Task::StartRecording {
            path: path.into(),
            format,
        });
    }

    /// Detach the recording branch and finalize the output file.
    pub fn stop_recording(&self) {
        self.shared.post(Task::StopRecording);
    }

    /// Request a still image grab into `path`.
    pub fn grab_image(&self, path: impl Into<PathBuf>) {
        self.shared.post(Task::GrabImage { path: path.into() });
    }

    /// Subscribe to edge notifications.
    pub fn subscribe(&self) -> mpsc::Receiver<ReceiverEvent> {
        let (sender, receiver) = mpsc::channel();
        self.shared.subscribers.lock().unwrap().push(sender);
        receiver
    }

    pub fn session_state(&self) -> SessionState {
        self.shared.session()
    }

    pub fn decoder_state(&self) -> DecoderState {
        match self.shared.decoder.load(Ordering::SeqCst) {
            0 => DecoderState::Absent,
            1 => DecoderState::Attaching,
            2 => DecoderState::Active,
            _ => DecoderState::Detaching,
        }
    }

    pub fn recorder_state(&self) -> RecorderState {
        match self.shared.recorder.load(Ordering::SeqCst) {
            0 => RecorderState::Absent,
            1 => RecorderState::AwaitingKeyframe,
            2 => RecorderState::Active,
            _ => RecorderState::Detaching,
        }
    }

    /// Whether upstream data is flowing into the tee.
    pub fn is_streaming(&self) -> bool {
        self.shared.streaming.load(Ordering::SeqCst)
    }

    pub fn is_decoding(&self) -> bool {
        self.shared.decoding.load(Ordering::SeqCst)
    }

    pub fn is_recording(&self) -> bool {
        self.shared.recording.load(Ordering::SeqCst)
    }

    /// Video size discovered from the decoder's output caps, `(0, 0)` when
    /// unknown.
    pub fn video_size(&self) -> (u32, u32) {
        *self.shared.video_size.lock().unwrap()
    }

    pub fn video_file(&self) -> Option<PathBuf> {
        self.shared.video_file.lock().unwrap().clone()
    }

    pub fn image_file(&self) -> Option<PathBuf> {
        self.shared.image_file.lock().unwrap().clone()
    }
}

impl Drop for VideoReceiver {
    fn drop(&mut self) {
        self.shared.post(Task::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

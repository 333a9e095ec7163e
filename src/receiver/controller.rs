// Copyright (C) 2025 Video Receiver contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

//! The control thread.
//!
//! Owns the pipeline and performs every graph mutation. Tasks arrive over a
//! single FIFO shared by the public entry points and the bus pump; pad
//! probes and pad-added handlers post a task instead of touching state from
//! streaming threads. The two pad-local operations sanctioned outside this
//! thread are the idle-probe branch unlink and the keyframe gate's pad
//! offset, both of which only act on the pad they run on.
//!
//! The graph while both branches are live:
//!
//! ```text
//! sourcebin -> tee -> decode_valve -> decoder -> video_sink
//!                 \-> record_valve -> rebaser -> sinkbin[mux -> filesink]
//! ```

use gst::glib;
use gst::prelude::*;
use std::mem;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{DecoderState, ReceiverEvent, RecorderState, SessionState, Shared, CAT};
use crate::error::ReceiverError;
use crate::recorder::{self, FileFormat};
use crate::source;

const WATCHDOG_TICK: Duration = Duration::from_secs(1);

/// A unit of work for the control thread. FIFO, non-preemptible.
pub(crate) enum Task {
    Start { uri: String, timeout: Duration },
    Stop,
    StartDecoding { sink: gst::Element },
    StopDecoding,
    StartRecording { path: PathBuf, format: FileFormat },
    StopRecording,
    GrabImage { path: PathBuf },
    SourcePadAdded,
    DecoderPadAdded { pad: gst::Pad },
    RecorderKeyframe,
    Bus(BusEvent),
    Shutdown,
}

/// A framework bus message, translated for the control thread.
pub(crate) enum BusEvent {
    Error { origin: String, message: String },
    EndOfStream { origin: String },
    StateChanged,
    ForwardedEndOfStream { origin: String },
}

impl BusEvent {
    fn from_message(msg: &gst::Message) -> Option<BusEvent> {
        use gst::MessageView;

        let origin = || {
            msg.src()
                .map(|src| src.name().to_string())
                .unwrap_or_default()
        };

        match msg.view() {
            MessageView::Error(err) => Some(BusEvent::Error {
                origin: origin(),
                message: format!("{} ({:?})", err.error(), err.debug()),
            }),
            MessageView::Eos(_) => Some(BusEvent::EndOfStream { origin: origin() }),
            MessageView::StateChanged(_) => {
                if msg
                    .src()
                    .is_some_and(|src| src.is::<gst::Pipeline>())
                {
                    Some(BusEvent::StateChanged)
                } else {
                    None
                }
            }
            MessageView::Element(elem) => {
                let s = elem.structure()?;
                if s.name().as_str() != "GstBinForwarded" {
                    return None;
                }
                let forwarded = s.get::<gst::Message>("message").ok()?;
                if forwarded.type_() != gst::MessageType::Eos {
                    return None;
                }
                Some(BusEvent::ForwardedEndOfStream {
                    origin: forwarded
                        .src()
                        .map(|src| src.name().to_string())
                        .unwrap_or_default(),
                })
            }
            _ => None,
        }
    }
}

/// Named references into the live graph.
struct Graph {
    pipeline: gst::Pipeline,
    source: gst::Bin,
    tee: gst::Element,
    decode_valve: gst::Element,
    record_valve: gst::Element,
    /// True once the source bin's first dynamic pad was linked to the tee.
    source_linked: bool,
}

struct DecoderParts {
    sink: gst::Element,
    /// None while the attach waits for upstream data.
    decoder: Option<gst::Element>,
    /// Frame-arrival probe on the sink's sink pad.
    watch: Option<(gst::Pad, gst::PadProbeId)>,
}

enum DecoderBranch {
    Absent,
    Attaching(DecoderParts),
    Active(DecoderParts),
    Detaching(DecoderParts),
}

struct RecorderParts {
    rebaser: gst::Element,
    sink_bin: gst::Bin,
}

enum RecorderBranch {
    Absent,
    AwaitingKeyframe(RecorderParts),
    Active(RecorderParts),
    Detaching(RecorderParts),
}

struct Controller {
    shared: Arc<Shared>,
    graph: Option<Graph>,
    decoder: DecoderBranch,
    recorder: RecorderBranch,

    // Last start parameters, reused by the automatic restart.
    uri: String,
    timeout: Duration,

    pending_restart: Option<Instant>,
    resume_sink: Option<gst::Element>,
    next_tick: Instant,
    /// A branch detach that empties the pipeline of sinks makes the bin
    /// aggregate a pipeline-level EOS right after the forwarded one; that
    /// aggregate is expected and must not count as an unexpected EOS.
    swallow_pipeline_eos: bool,
}

pub(crate) fn run(shared: Arc<Shared>) {
    let mut controller = Controller {
        shared,
        graph: None,
        decoder: DecoderBranch::Absent,
        recorder: RecorderBranch::Absent,
        uri: String::new(),
        timeout: Duration::from_secs(5),
        pending_restart: None,
        resume_sink: None,
        next_tick: Instant::now() + WATCHDOG_TICK,
        swallow_pipeline_eos: false,
    };

    loop {
        let deadline = controller.wake_deadline();
        let task = controller.shared.next_task(deadline);
        match task {
            Some(Task::Shutdown) => {
                controller.stop_session();
                break;
            }
            Some(task) => controller.handle(task),
            None => controller.on_timer(),
        }
    }
}

impl Controller {
    fn handle(&mut self, task: Task) {
        match task {
            Task::Start { uri, timeout } => self.start_session(uri, timeout),
            Task::Stop => self.stop_session(),
            Task::StartDecoding { sink } => self.start_decoding(sink),
            Task::StopDecoding => self.stop_decoding(),
            Task::StartRecording { path, format } => self.start_recording(path, format),
            Task::StopRecording => self.stop_recording(),
            Task::GrabImage { path } => self.grab_image(path),
            Task::SourcePadAdded => self.handle_source_pad_added(),
            Task::DecoderPadAdded { pad } => self.handle_decoder_pad_added(pad),
            Task::RecorderKeyframe => self.handle_recorder_keyframe(),
            Task::Bus(event) => self.handle_bus_event(event),
            Task::Shutdown => unreachable!("handled by the loop"),
        }
    }

    fn wake_deadline(&self) -> Instant {
        match self.pending_restart {
            Some(at) => self.next_tick.min(at),
            None => self.next_tick,
        }
    }

    fn on_timer(&mut self) {
        let now = Instant::now();

        if self.pending_restart.is_some_and(|at| now >= at) {
            self.pending_restart = None;
            self.fire_restart();
        }

        if now >= self.next_tick {
            self.next_tick = now + WATCHDOG_TICK;
            self.watchdog_check(now);
        }
    }

    // Session

    fn start_session(&mut self, uri: String, timeout: Duration) {
        if self.graph.is_some()
            || !matches!(
                self.shared.session(),
                SessionState::Idle | SessionState::Failed
            )
        {
            gst::warning!(CAT, "Already running");
            return;
        }

        // An unusable URI leaves the session untouched; everything after
        // classification counts as a failed start.
        if let Err(err) = source::StreamKind::from_uri(&uri) {
            match err {
                ReceiverError::UriInvalid(_) => {
                    gst::warning!(CAT, "Not starting: {}", err);
                }
                err => {
                    gst::error!(CAT, "Not starting: {}", err);
                    self.shared.set_session(SessionState::Failed);
                }
            }
            return;
        }

        self.shared.set_session(SessionState::Starting);
        self.uri = uri.clone();
        self.timeout = timeout;

        let graph = match self.build_graph(&uri) {
            Ok(graph) => graph,
            Err(err) => {
                gst::error!(CAT, "Failed to build pipeline: {}", err);
                self.shared.set_session(SessionState::Failed);
                return;
            }
        };

        self.shared.runtime.dump_graph(&graph.pipeline, "pipeline-paused");

        if graph.pipeline.set_state(gst::State::Playing).is_err() {
            gst::error!(CAT, "Failed to start playback");
            if let Some(bus) = graph.pipeline.bus() {
                bus.disable_sync_message_emission();
            }
            let _ = graph.pipeline.set_state(gst::State::Null);
            self.shared.set_session(SessionState::Failed);
            return;
        }

        self.shared.runtime.dump_graph(&graph.pipeline, "pipeline-playing");
        self.graph = Some(graph);
        self.shared.set_session(SessionState::Streaming);
        gst::info!(CAT, "Running");
    }

    fn build_graph(&self, uri: &str) -> Result<Graph, ReceiverError> {
        let runtime = &self.shared.runtime;
        let rtsp_timeout_us = self.shared.config.rtsp_timeout.as_micros() as u64;

        let source = source::build(runtime, uri, rtsp_timeout_us)?;

        let tee = runtime.make_named("tee", "tee")?;
        // Both valves may dangle until a branch is attached.
        tee.set_property("allow-not-linked", true);

        let decode_valve = runtime.make_named("queue", "decode_valve")?;
        decode_valve.set_property_from_str("leaky", "downstream");
        decode_valve.set_property("max-size-buffers", 0u32);
        decode_valve.set_property("max-size-bytes", 0u32);
        decode_valve.set_property("max-size-time", 5.seconds());

        let record_valve = runtime.make_named("queue", "record_valve")?;

        let pipeline = gst::Pipeline::builder().name("receiver").build();
        runtime.track(&pipeline);
        pipeline.set_property("message-forward", true);

        pipeline
            .add_many([
                source.upcast_ref::<gst::Element>(),
                &tee,
                &decode_valve,
                &record_valve,
            ])
            .map_err(|err| ReceiverError::Pipeline(err.to_string()))?;

        tee.link(&decode_valve)
            .map_err(|_| ReceiverError::Pipeline("unable to link decoder queue".into()))?;
        tee.link(&record_valve)
            .map_err(|_| ReceiverError::Pipeline("unable to link recorder queue".into()))?;

        let poster = self.shared.clone();
        source.connect_pad_added(move |_, _| {
            poster.post(Task::SourcePadAdded);
        });

        let bus = pipeline.bus().expect("pipeline without bus");
        bus.enable_sync_message_emission();
        let poster = self.shared.clone();
        bus.connect_sync_message(None, move |_, msg| {
            if let Some(event) = BusEvent::from_message(msg) {
                poster.post(Task::Bus(event));
            }
        });

        Ok(Graph {
            pipeline,
            source,
            tee,
            decode_valve,
            record_valve,
            source_linked: false,
        })
    }

    fn stop_session(&mut self) {
        self.pending_restart = None;
        self.resume_sink = None;

        let Some(graph) = &self.graph else {
            gst::debug!(CAT, "No pipeline");
            self.shared.set_session(SessionState::Idle);
            return;
        };

        // The drain waits for the pipeline-level EOS, which only aggregates
        // across branch termini. Without one there is nothing to flush.
        let has_terminus = matches!(
            self.decoder,
            DecoderBranch::Active(_) | DecoderBranch::Detaching(_)
        ) || !matches!(self.recorder, RecorderBranch::Absent);

        if !graph.source_linked || !has_terminus {
            self.shutdown_pipeline(SessionState::Idle);
            gst::info!(CAT, "Stopped");
            return;
        }

        self.shared.set_session(SessionState::Stopping);

        let bus = graph.pipeline.bus().expect("pipeline without bus");
        bus.disable_sync_message_emission();
        graph.pipeline.send_event(gst::event::Eos::new());

        gst::debug!(CAT, "Waiting for the pipeline to drain");

        let msg = bus.timed_pop_filtered(
            gst::ClockTime::NONE,
            &[gst::MessageType::Eos, gst::MessageType::Error],
        );

        match msg {
            Some(msg) if matches!(msg.view(), gst::MessageView::Eos(_)) => {
                self.shutdown_pipeline(SessionState::Idle);
                gst::info!(CAT, "Stopped");
            }
            _ => {
                gst::error!(CAT, "Error stopping pipeline");
                self.shutdown_pipeline(SessionState::Failed);
            }
        }
    }

    fn shutdown_pipeline(&mut self, final_state: SessionState) {
        if let Some(graph) = &self.graph {
            if let Some(bus) = graph.pipeline.bus() {
                bus.disable_sync_message_emission();
            }
            let _ = graph.pipeline.set_state(gst::State::Null);
        }

        self.teardown_decoder_branch();
        self.teardown_recorder_branch();

        self.graph = None;
        self.swallow_pipeline_eos = false;
        self.shared.set_streaming(false);
        self.shared.set_session(final_state);
    }

    fn handle_source_pad_added(&mut self) {
        let Some(graph) = self.graph.as_mut() else {
            return;
        };
        if graph.source_linked {
            return;
        }

        if let Err(err) = graph.source.link(&graph.tee) {
            gst::error!(CAT, "Unable to link source: {}", err);
            return;
        }
        graph.source_linked = true;

        let pipeline = graph.pipeline.clone();
        self.shared.set_streaming(true);
        self.shared
            .runtime
            .dump_graph(&pipeline, "pipeline-new-source-pad");
        gst::debug!(CAT, "Upstream is live");

        // A decoder requested before the stream went live attaches now.
        if matches!(self.decoder, DecoderBranch::Attaching(_)) {
            self.attach_decoder();
        }
    }

    // Decoding branch

    fn start_decoding(&mut self, sink: gst::Element) {
        if self.graph.is_none() {
            gst::warning!(CAT, "Cannot decode without a pipeline");
            return;
        }
        match self.decoder {
            DecoderBranch::Absent => {}
            DecoderBranch::Detaching(_) => {
                gst::warning!(
                    CAT,
                    "{}, try again later",
                    ReceiverError::InvalidState("start-decoding", "detaching")
                );
                return;
            }
            _ => {
                gst::warning!(CAT, "Already decoding");
                return;
            }
        }

        let Some(pad) = sink.static_pad("sink") else {
            gst::error!(CAT, "Unable to find sink pad of video sink");
            return;
        };

        self.shared.note_frame();
        let poster = self.shared.clone();
        let watch = pad
            .add_probe(gst::PadProbeType::BUFFER, move |_, _| {
                poster.note_frame();
                gst::PadProbeReturn::Ok
            })
            .map(|id| (pad, id));

        self.decoder = DecoderBranch::Attaching(DecoderParts {
            sink,
            decoder: None,
            watch,
        });
        self.shared.set_decoder_state(DecoderState::Attaching);

        if self.graph.as_ref().is_some_and(|g| g.source_linked) {
            self.attach_decoder();
        } else {
            gst::debug!(CAT, "Upstream not live yet, deferring decoder attach");
        }
    }

    fn attach_decoder(&mut self) {
        let (pipeline, decode_valve) = match &self.graph {
            Some(graph) => (graph.pipeline.clone(), graph.decode_valve.clone()),
            None => return,
        };
        let sink = match &self.decoder {
            DecoderBranch::Attaching(parts) if parts.decoder.is_none() => parts.sink.clone(),
            _ => return,
        };

        let decoder = match self.shared.runtime.make("decodebin") {
            Ok(decoder) => decoder,
            Err(err) => {
                gst::error!(CAT, "Cannot attach decoder: {}", err);
                self.abort_decoder_attach();
                return;
            }
        };

        connect_autoplug_query(&decoder, &sink);

        let poster = self.shared.clone();
        decoder.connect_pad_added(move |_, pad| {
            poster.post(Task::DecoderPadAdded { pad: pad.clone() });
        });

        let linked = pipeline.add(&decoder).is_ok()
            && decoder.sync_state_with_parent().is_ok()
            && decode_valve.link(&decoder).is_ok();

        if !linked {
            gst::error!(CAT, "Unable to link decoder");
            let _ = pipeline.remove(&decoder);
            let _ = decoder.set_state(gst::State::Null);
            self.abort_decoder_attach();
            return;
        }

        if let DecoderBranch::Attaching(parts) = &mut self.decoder {
            parts.decoder = Some(decoder);
        }
        gst::debug!(CAT, "Decoder attached, waiting for its source pad");
    }

    fn abort_decoder_attach(&mut self) {
        if let DecoderBranch::Attaching(parts) =
            mem::replace(&mut self.decoder, DecoderBranch::Absent)
        {
            if let Some((pad, id)) = parts.watch {
                pad.remove_probe(id);
            }
        }
        self.shared.set_decoder_state(DecoderState::Absent);
    }

    fn handle_decoder_pad_added(&mut self, pad: gst::Pad) {
        let Some(graph) = &self.graph else {
            return;
        };
        let pipeline = graph.pipeline.clone();

        let (decoder, sink) = match &self.decoder {
            DecoderBranch::Attaching(parts) => match &parts.decoder {
                Some(decoder) => (decoder.clone(), parts.sink.clone()),
                None => return,
            },
            _ => return,
        };

        if pipeline.add(&sink).is_err() {
            gst::error!(CAT, "Unable to add video sink to the pipeline");
            return;
        }

        if sink.sync_state_with_parent().is_err() || decoder.link(&sink).is_err() {
            gst::error!(CAT, "Unable to link video sink");
            let _ = pipeline.remove(&sink);
            return;
        }

        let caps = pad.current_caps().unwrap_or_else(|| pad.query_caps(None));
        let size = gst_video::VideoInfo::from_caps(&caps)
            .map(|info| (info.width(), info.height()))
            .unwrap_or((0, 0));
        self.shared.set_video_size(size);

        self.shared.note_frame();
        if let DecoderBranch::Attaching(parts) =
            mem::replace(&mut self.decoder, DecoderBranch::Absent)
        {
            self.decoder = DecoderBranch::Active(parts);
        }
        self.shared.set_decoder_state(DecoderState::Active);
        self.shared.set_decoding(true);
        self.shared
            .runtime
            .dump_graph(&pipeline, "pipeline-decoding-start");
        gst::info!(CAT, "Decoding started");
    }

    fn stop_decoding(&mut self) {
        match self.decoder {
            DecoderBranch::Active(_) => {}
            DecoderBranch::Detaching(_) => {
                gst::debug!(CAT, "Decoder already detaching");
                return;
            }
            _ => {
                gst::warning!(CAT, "Not decoding");
                return;
            }
        }
        let Some(graph) = &self.graph else {
            return;
        };
        let Some(pad) = graph.decode_valve.static_pad("src") else {
            return;
        };

        if let DecoderBranch::Active(parts) =
            mem::replace(&mut self.decoder, DecoderBranch::Absent)
        {
            self.decoder = DecoderBranch::Detaching(parts);
        }
        self.shared.set_decoder_state(DecoderState::Detaching);
        schedule_branch_unlink(&pad);
    }

    fn shutdown_decoding_branch(&mut self) {
        if !matches!(self.decoder, DecoderBranch::Detaching(_)) {
            return;
        }
        if let DecoderBranch::Detaching(parts) =
            mem::replace(&mut self.decoder, DecoderBranch::Absent)
        {
            self.remove_decoder_parts(parts);
        }
        self.shared.set_decoder_state(DecoderState::Absent);
        self.shared.set_decoding(false);
        if matches!(self.recorder, RecorderBranch::Absent) {
            self.swallow_pipeline_eos = true;
        }
        if let Some(graph) = &self.graph {
            self.shared
                .runtime
                .dump_graph(&graph.pipeline, "pipeline-decoding-stopped");
        }
        gst::info!(CAT, "Decoding stopped");
    }

    fn teardown_decoder_branch(&mut self) {
        let parts = match mem::replace(&mut self.decoder, DecoderBranch::Absent) {
            DecoderBranch::Absent => return,
            DecoderBranch::Attaching(parts)
            | DecoderBranch::Active(parts)
            | DecoderBranch::Detaching(parts) => parts,
        };
        self.remove_decoder_parts(parts);
        self.shared.set_decoder_state(DecoderState::Absent);
        self.shared.set_decoding(false);
    }

    fn remove_decoder_parts(&self, parts: DecoderParts) {
        if let Some((pad, id)) = parts.watch {
            pad.remove_probe(id);
        }
        if let Some(graph) = &self.graph {
            if let Some(decoder) = &parts.decoder {
                let _ = graph.pipeline.remove(decoder);
                let _ = decoder.set_state(gst::State::Null);
            }
            if parts.sink.parent().is_some() {
                let _ = graph.pipeline.remove(&parts.sink);
            }
            let _ = parts.sink.set_state(gst::State::Null);
        }
    }

    // Recording branch

    fn start_recording(&mut self, path: PathBuf, format: FileFormat) {
        if self.graph.is_none() {
            gst::warning!(CAT, "Cannot record without a pipeline");
            return;
        }
        match self.recorder {
            RecorderBranch::Absent => {}
            RecorderBranch::Detaching(_) => {
                gst::warning!(
                    CAT,
                    "{}, try again later",
                    ReceiverError::InvalidState("start-recording", "detaching")
                );
                return;
            }
            _ => {
                gst::warning!(CAT, "Already recording");
                return;
            }
        }

        gst::debug!(CAT, "New video file: {}", path.display());
        self.shared.set_video_file(Some(path.clone()));
        self.shared.emit(ReceiverEvent::VideoFileChanged);

        let sink_bin = match recorder::build(&self.shared.runtime, &path, format) {
            Ok(bin) => bin,
            Err(err) => {
                gst::error!(CAT, "Cannot record: {}", err);
                return;
            }
        };
        let rebaser = match self.shared.runtime.make_named("timeshift", "rebaser") {
            Ok(rebaser) => rebaser,
            Err(err) => {
                gst::error!(CAT, "Cannot record: {}", err);
                return;
            }
        };

        let Some(graph) = &self.graph else {
            return;
        };
        let pipeline = graph.pipeline.clone();
        let record_valve = graph.record_valve.clone();

        let linked = pipeline
            .add_many([&rebaser, sink_bin.upcast_ref::<gst::Element>()])
            .is_ok()
            && gst::Element::link_many([
                &record_valve,
                &rebaser,
                sink_bin.upcast_ref::<gst::Element>(),
            ])
            .is_ok()
            && rebaser.sync_state_with_parent().is_ok()
            && sink_bin.sync_state_with_parent().is_ok();

        if !linked {
            gst::error!(CAT, "Failed to link queue and file sink");
            let _ = pipeline.remove(&rebaser);
            let _ = rebaser.set_state(gst::State::Null);
            if sink_bin.parent().is_some() {
                let _ = pipeline.remove(&sink_bin);
            }
            let _ = sink_bin.set_state(gst::State::Null);
            return;
        }

        let Some(pad) = record_valve.static_pad("src") else {
            return;
        };
        let poster = self.shared.clone();
        install_keyframe_gate(&pad, move || poster.post(Task::RecorderKeyframe));

        self.recorder = RecorderBranch::AwaitingKeyframe(RecorderParts { rebaser, sink_bin });
        self.shared
            .set_recorder_state(RecorderState::AwaitingKeyframe);
        self.shared.set_recording(true);
        self.shared
            .runtime
            .dump_graph(&pipeline, "pipeline-recording-start");
        gst::info!(CAT, "Recording started");
    }

    fn handle_recorder_keyframe(&mut self) {
        if !matches!(self.recorder, RecorderBranch::AwaitingKeyframe(_)) {
            return;
        }
        if let RecorderBranch::AwaitingKeyframe(parts) =
            mem::replace(&mut self.recorder, RecorderBranch::Absent)
        {
            self.recorder = RecorderBranch::Active(parts);
        }
        self.shared.set_recorder_state(RecorderState::Active);
        self.shared.emit(ReceiverEvent::GotFirstRecordingKeyframe);
        gst::debug!(CAT, "Got keyframe, recording is live");
    }

    fn stop_recording(&mut self) {
        match self.recorder {
            RecorderBranch::AwaitingKeyframe(_) | RecorderBranch::Active(_) => {}
            RecorderBranch::Detaching(_) => {
                gst::debug!(CAT, "Recorder already detaching");
                return;
            }
            RecorderBranch::Absent => {
                gst::warning!(CAT, "Not recording");
                return;
            }
        }
        let Some(graph) = &self.graph else {
            return;
        };
        let Some(pad) = graph.record_valve.static_pad("src") else {
            return;
        };

        let state = mem::replace(&mut self.recorder, RecorderBranch::Absent);
        if let RecorderBranch::AwaitingKeyframe(parts) | RecorderBranch::Active(parts) = state {
            self.recorder = RecorderBranch::Detaching(parts);
        }
        self.shared.set_recorder_state(RecorderState::Detaching);
        schedule_branch_unlink(&pad);
    }

    fn shutdown_recording_branch(&mut self) {
        if !matches!(self.recorder, RecorderBranch::Detaching(_)) {
            return;
        }
        if let RecorderBranch::Detaching(parts) =
            mem::replace(&mut self.recorder, RecorderBranch::Absent)
        {
            self.remove_recorder_parts(parts);
        }
        self.shared.set_recorder_state(RecorderState::Absent);
        self.shared.set_recording(false);
        if matches!(self.decoder, DecoderBranch::Absent) {
            self.swallow_pipeline_eos = true;
        }
        if let Some(graph) = &self.graph {
            self.shared
                .runtime
                .dump_graph(&graph.pipeline, "pipeline-recording-stopped");
        }
        gst::info!(CAT, "Recording stopped");
    }

    fn teardown_recorder_branch(&mut self) {
        let parts = match mem::replace(&mut self.recorder, RecorderBranch::Absent) {
            RecorderBranch::Absent => return,
            RecorderBranch::AwaitingKeyframe(parts)
            | RecorderBranch::Active(parts)
            | RecorderBranch::Detaching(parts) => parts,
        };
        self.remove_recorder_parts(parts);
        self.shared.set_recorder_state(RecorderState::Absent);
        self.shared.set_recording(false);
    }

    fn remove_recorder_parts(&self, parts: RecorderParts) {
        if let Some(graph) = &self.graph {
            let _ = graph.pipeline.remove(&parts.rebaser);
            let _ = parts.rebaser.set_state(gst::State::Null);
            let _ = graph.pipeline.remove(&parts.sink_bin);
            let _ = parts.sink_bin.set_state(gst::State::Null);
        }
    }

    // Still image grab. Declared for front ends; capture is not wired up.
    fn grab_image(&mut self, path: PathBuf) {
        // TODO: schedule the actual screenshot capture
        self.shared.set_image_file(Some(path));
        self.shared.emit(ReceiverEvent::ImageFileChanged);
    }

    // Bus

    fn handle_bus_event(&mut self, event: BusEvent) {
        match event {
            BusEvent::Error { origin, message } => {
                self.handle_error(&format!("{message} (from {origin})"));
            }
            BusEvent::EndOfStream { origin } => {
                if self.swallow_pipeline_eos {
                    self.swallow_pipeline_eos = false;
                    gst::debug!(CAT, "Ignoring EOS aggregated from a detached branch");
                    return;
                }
                gst::debug!(CAT, "EOS from {}", origin);
                self.handle_eos();
            }
            BusEvent::StateChanged => {
                gst::trace!(CAT, "Pipeline state changed");
            }
            BusEvent::ForwardedEndOfStream { origin } => {
                gst::debug!(CAT, "Forwarded EOS from {}", origin);
                self.handle_eos();
            }
        }
    }

    fn handle_eos(&mut self) {
        if matches!(self.decoder, DecoderBranch::Detaching(_)) {
            self.shutdown_decoding_branch();
        } else if matches!(self.recorder, RecorderBranch::Detaching(_)) {
            self.shutdown_recording_branch();
        } else {
            self.handle_error(&ReceiverError::UnexpectedEos.to_string());
        }
    }

    fn handle_error(&mut self, message: &str) {
        gst::error!(CAT, "Pipeline error: {}", message);

        if self.graph.is_none() {
            self.shared.set_session(SessionState::Failed);
            return;
        }

        let sink = match &self.decoder {
            DecoderBranch::Attaching(parts)
            | DecoderBranch::Active(parts)
            | DecoderBranch::Detaching(parts) => Some(parts.sink.clone()),
            DecoderBranch::Absent => None,
        };

        // The full stop drains what it can; the message that brought us
        // here is still queued on the bus, so the drain cannot block.
        self.stop_session();
        self.resume_sink = sink;
        self.pending_restart = Some(Instant::now() + self.shared.config.restart_delay);
    }

    // Watchdog & restart

    fn watchdog_check(&mut self, now: Instant) {
        if self.shared.session() != SessionState::Streaming
            || !matches!(self.decoder, DecoderBranch::Active(_))
        {
            return;
        }

        let age = self.shared.last_frame_age(now);
        if age <= self.timeout {
            return;
        }

        gst::warning!(CAT, "No frame for {:?}, restarting the stream", age);

        let sink = match &self.decoder {
            DecoderBranch::Attaching(parts)
            | DecoderBranch::Active(parts)
            | DecoderBranch::Detaching(parts) => Some(parts.sink.clone()),
            DecoderBranch::Absent => None,
        };

        self.stop_session();
        self.resume_sink = sink;
        self.pending_restart = Some(Instant::now() + self.shared.config.restart_delay);
    }

    fn fire_restart(&mut self) {
        self.shared.emit(ReceiverEvent::RestartTimeout);

        if self.uri.is_empty() {
            return;
        }

        gst::info!(CAT, "Restarting {}", self.uri);
        let uri = self.uri.clone();
        let timeout = self.timeout;
        self.start_session(uri, timeout);

        if self.shared.session() == SessionState::Streaming {
            if let Some(sink) = self.resume_sink.take() {
                self.start_decoding(sink);
            }
        }
    }
}

/// Branch-unlink protocol: once no buffer is in flight across the valve's
/// source pad, unlink the branch and push an EOS into the detached side. The
/// branch terminus posts the EOS, the bin wraps it as a forwarded message
/// and the bus pump routes it back here as a task.
fn schedule_branch_unlink(pad: &gst::Pad) {
    pad.add_probe(gst::PadProbeType::IDLE, move |pad, _| {
        if let Some(peer) = pad.peer() {
            let _ = pad.unlink(&peer);
            let _ = peer.send_event(gst::event::Eos::new());
            gst::debug!(CAT, obj = pad, "Branch EOS was sent");
        }
        gst::PadProbeReturn::Remove
    });
}

/// One-shot keyframe gate for the recording branch.
///
/// Drops every delta-unit buffer; the first keyframe rebases the pad so
/// that it presents at running time zero, then the probe removes itself.
pub(crate) fn install_keyframe_gate<F>(pad: &gst::Pad, on_keyframe: F) -> Option<gst::PadProbeId>
where
    F: Fn() + Send + Sync + 'static,
{
    pad.add_probe(gst::PadProbeType::BUFFER, move |pad, info| {
        let Some(gst::PadProbeData::Buffer(ref buffer)) = info.data else {
            return gst::PadProbeReturn::Ok;
        };

        if buffer.flags().contains(gst::BufferFlags::DELTA_UNIT) {
            return gst::PadProbeReturn::Drop;
        }

        if let Some(pts) = buffer.pts() {
            pad.set_offset(-(pts.nseconds() as i64));
        }

        gst::debug!(CAT, obj = pad, "Got keyframe, stop dropping buffers");
        on_keyframe();
        gst::PadProbeReturn::Remove
    })
}

/// Let the decoder negotiate caps and context against the real video sink
/// by forwarding its autoplug CAPS and CONTEXT queries to the sink's sink
/// pad.
fn connect_autoplug_query(decoder: &gst::Element, sink: &gst::Element) {
    let sink_weak = sink.downgrade();
    decoder.connect("autoplug-query", false, move |args| {
        let unhandled = Some(false.to_value());

        let Some(sink) = sink_weak.upgrade() else {
            return unhandled;
        };
        let Some(sinkpad) = sink.static_pad("sink") else {
            return unhandled;
        };

        // The query argument stays writable for the duration of the signal
        // emission.
        let query = unsafe {
            use glib::translate::ToGlibPtr;
            let value: *const glib::gobject_ffi::GValue = args[3].to_glib_none().0;
            let ptr = glib::gobject_ffi::g_value_get_boxed(value);
            gst::QueryRef::from_mut_ptr(ptr as *mut gst::ffi::GstQuery)
        };

        if matches!(query.view(), gst::QueryView::Context(_)) {
            return Some(sinkpad.query(query).to_value());
        }

        if let gst::QueryViewMut::Caps(caps_query) = query.view_mut() {
            let filter = caps_query.filter().map(|f| f.to_owned());
            let result = sinkpad.query_caps(filter.as_ref());
            let handled = !result.is_empty();
            caps_query.set_result(&result);
            return Some(handled.to_value());
        }

        unhandled
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Once;

    fn init() {
        static INIT: Once = Once::new();
        INIT.call_once(|| {
            gst::init().unwrap();
        });
    }

    fn buffer(pts: gst::ClockTime, delta: bool) -> gst::Buffer {
        let mut buffer = gst::Buffer::with_size(1).unwrap();
        {
            let buffer = buffer.get_mut().unwrap();
            buffer.set_pts(pts);
            if delta {
                buffer.set_flags(gst::BufferFlags::DELTA_UNIT);
            }
        }
        buffer
    }

    #[test]
    fn keyframe_gate_drops_until_keyframe_and_rebases() {
        init();

        let mut h = gst_check::Harness::new("identity");
        h.set_src_caps(gst::Caps::builder("video/x-h264").build());
        h.play();

        let srcpad = h.element().unwrap().static_pad("src").unwrap();
        let keyframes = Arc::new(AtomicUsize::new(0));
        let counter = keyframes.clone();
        install_keyframe_gate(&srcpad, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        // Delta units ahead of the first keyframe never reach downstream.
        h.push(buffer(gst::ClockTime::from_seconds(1), true)).unwrap();
        h.push(buffer(gst::ClockTime::from_seconds(2), true)).unwrap();
        assert!(h.try_pull().is_none());
        assert_eq!(keyframes.load(Ordering::SeqCst), 0);

        // The first keyframe passes and rebases the pad to present at zero.
        h.push(buffer(gst::ClockTime::from_seconds(3), false))
            .unwrap();
        let out = h.pull().unwrap();
        assert_eq!(out.pts(), Some(gst::ClockTime::from_seconds(3)));
        assert_eq!(srcpad.offset(), -(gst::ClockTime::from_seconds(3).nseconds() as i64));
        assert_eq!(keyframes.load(Ordering::SeqCst), 1);

        // The gate removed itself, delta units flow now.
        h.push(buffer(gst::ClockTime::from_seconds(4), true)).unwrap();
        assert!(h.try_pull().is_some());
        assert_eq!(keyframes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn bus_events_translate_messages() {
        init();

        let pipeline = gst::Pipeline::new();
        let msg = gst::message::Eos::builder().src(&pipeline).build();
        assert!(matches!(
            BusEvent::from_message(&msg),
            Some(BusEvent::EndOfStream { .. })
        ));

        // Arbitrary element messages are not bus events.
        let s = gst::Structure::builder("unrelated").build();
        let msg = gst::message::Element::builder(s).src(&pipeline).build();
        assert!(BusEvent::from_message(&msg).is_none());

        // A forwarded EOS element message is recognized.
        let inner = gst::message::Eos::builder().src(&pipeline).build();
        let s = gst::Structure::builder("GstBinForwarded")
            .field("message", inner)
            .build();
        let msg = gst::message::Element::builder(s).src(&pipeline).build();
        assert!(matches!(
            BusEvent::from_message(&msg),
            Some(BusEvent::ForwardedEndOfStream { .. })
        ));
    }
}

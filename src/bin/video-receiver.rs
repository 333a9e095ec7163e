// Copyright (C) 2025 Video Receiver contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use anyhow::Context;
use clap::Parser;
use gst::glib;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use gstvideoreceiver::{FileFormat, ReceiverConfig, Runtime, SessionState, VideoReceiver};

static CAT: LazyLock<gst::DebugCategory> = LazyLock::new(|| {
    gst::DebugCategory::new(
        "videoreceiverapp",
        gst::DebugColorFlags::empty(),
        Some("Video receiver front end"),
    )
});

const SIGINT: i32 = 2;

#[derive(Parser, Debug)]
#[command(about = "Receive, render and record a live video stream")]
struct Args {
    /// Source URI (udp://, udp265://, rtsp://, tcp://, mpegts://, tsusb://)
    uri: String,

    /// Watchdog timeout in seconds
    #[arg(short, long, default_value_t = 5)]
    timeout: u64,

    /// Don't decode and render video
    #[arg(short, long)]
    no_decode: bool,

    /// Stop decoding after this many seconds
    #[arg(long, value_name = "SECONDS")]
    stop_decoding: Option<u32>,

    /// Record video into this file
    #[arg(short, long, value_name = "FILE")]
    record: Option<std::path::PathBuf>,

    /// File format: 0 = Matroska, 1 = QuickTime, 2 = MP4
    #[arg(short, long, default_value_t = 0)]
    format: u32,

    /// Stop recording after this many seconds
    #[arg(long, value_name = "SECONDS")]
    stop_recording: Option<u32>,

    /// Video sink element factory
    #[arg(long, default_value = "autovideosink")]
    video_sink: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let format = FileFormat::try_from(args.format).context("invalid --format")?;

    let runtime = Runtime::new().context("failed to initialize the media framework")?;
    let receiver = Arc::new(VideoReceiver::new(&runtime, ReceiverConfig::default()));

    let events = receiver.subscribe();
    std::thread::spawn(move || {
        for event in events {
            gst::info!(CAT, "{:?}", event);
        }
    });

    receiver.start(&args.uri, Duration::from_secs(args.timeout));

    if !args.no_decode {
        let sink = runtime
            .make(&args.video_sink)
            .with_context(|| format!("video sink '{}' is not available", args.video_sink))?;
        receiver.start_decoding(sink);

        if let Some(secs) = args.stop_decoding.filter(|secs| *secs > 0) {
            let receiver = receiver.clone();
            glib::timeout_add_seconds_once(secs, move || receiver.stop_decoding());
        }
    }

    if let Some(path) = &args.record {
        receiver.start_recording(path.clone(), format);

        let secs = args.stop_recording.unwrap_or(15);
        if secs > 0 {
            let receiver = receiver.clone();
            glib::timeout_add_seconds_once(secs, move || receiver.stop_recording());
        }
    }

    let main_loop = glib::MainLoop::new(None, false);

    // A session that fails before it ever streamed is a startup failure.
    let failed = Arc::new(AtomicBool::new(false));
    let ever_streamed = Arc::new(AtomicBool::new(false));
    glib::timeout_add(Duration::from_millis(200), {
        let receiver = receiver.clone();
        let failed = failed.clone();
        let ever_streamed = ever_streamed.clone();
        let main_loop = main_loop.clone();
        move || {
            if receiver.is_streaming() {
                ever_streamed.store(true, Ordering::SeqCst);
            }
            if !ever_streamed.load(Ordering::SeqCst)
                && receiver.session_state() == SessionState::Failed
            {
                failed.store(true, Ordering::SeqCst);
                main_loop.quit();
                return glib::ControlFlow::Break;
            }
            glib::ControlFlow::Continue
        }
    });

    glib::unix_signal_add(SIGINT, {
        let main_loop = main_loop.clone();
        move || {
            main_loop.quit();
            glib::ControlFlow::Break
        }
    });

    main_loop.run();

    receiver.stop();

    // Let the session drain before the process goes away, so that a
    // recording in progress is finalized.
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while !matches!(
        receiver.session_state(),
        SessionState::Idle | SessionState::Failed
    ) && std::time::Instant::now() < deadline
    {
        std::thread::sleep(Duration::from_millis(50));
    }

    if failed.load(Ordering::SeqCst) {
        anyhow::bail!("failed to start streaming from {}", args.uri);
    }
    Ok(())
}

// Copyright (C) 2025 Video Receiver contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0
#![allow(clippy::non_send_fields_in_send_ty, unused_doc_comments)]

/**
 * plugin-videoreceiver:
 *
 * Live video reception engine for unmanned-vehicle ground stations: a
 * dynamically reconfigurable pipeline that ingests a network video stream
 * (RTP/UDP H.264 or H.265, RTSP, MPEG-TS over TCP or UDP, or a vendor USB
 * tunnel), optionally decodes and renders it, and optionally records it to a
 * container file. The decoding and recording branches can be attached,
 * detached, started and stopped independently at runtime without disturbing
 * the upstream ingest.
 *
 * The crate also registers one element, #timeshift, used on the recording
 * branch to offset buffer timestamps by a fixed amount.
 */
use gst::glib;

mod error;
pub mod receiver;
mod recorder;
mod runtime;
mod source;
mod timeshift;

pub use error::ReceiverError;
pub use receiver::{
    DecoderState, ReceiverConfig, ReceiverEvent, RecorderState, SessionState, VideoReceiver,
};
pub use recorder::FileFormat;
pub use runtime::Runtime;

fn plugin_init(plugin: &gst::Plugin) -> Result<(), glib::BoolError> {
    timeshift::register(plugin)?;
    Ok(())
}

gst::plugin_define!(
    videoreceiver,
    env!("CARGO_PKG_DESCRIPTION"),
    plugin_init,
    concat!(env!("CARGO_PKG_VERSION"), "-", env!("COMMIT_ID")),
    "MPL",
    env!("CARGO_PKG_NAME"),
    env!("CARGO_PKG_NAME"),
    env!("CARGO_PKG_REPOSITORY"),
    env!("BUILD_REL_DATE")
);

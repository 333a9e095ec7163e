// Copyright (C) 2025 Video Receiver contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use gst::prelude::*;
use std::sync::LazyLock;
use url::Url;

use crate::error::{ReceiverError, Result};
use crate::runtime::Runtime;

static CAT: LazyLock<gst::DebugCategory> = LazyLock::new(|| {
    gst::DebugCategory::new(
        "videorxsource",
        gst::DebugColorFlags::empty(),
        Some("Video receiver source bin builder"),
    )
});

/// Stream kind derived from the URI scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// `tcp://host:port`, MPEG-TS over TCP.
    TcpMpegTs,
    /// `mpegts://host:port`, MPEG-TS over UDP.
    UdpMpegTs,
    /// `udp://host:port`, RTP/H.264 over UDP.
    RtpH264,
    /// `udp265://host:port`, RTP/H.265 over UDP.
    RtpH265,
    /// `rtsp://...`.
    Rtsp,
    /// `tsusb://host:port`, vendor USB tunnel carried over UDP.
    UsbTunnel,
}

impl StreamKind {
    pub fn from_uri(uri: &str) -> Result<StreamKind> {
        if uri.is_empty() {
            return Err(ReceiverError::UriInvalid(uri.to_string()));
        }

        let url = Url::parse(uri).map_err(|_| ReceiverError::UriInvalid(uri.to_string()))?;

        match url.scheme() {
            "tcp" => Ok(StreamKind::TcpMpegTs),
            "mpegts" => Ok(StreamKind::UdpMpegTs),
            "udp" => Ok(StreamKind::RtpH264),
            "udp265" => Ok(StreamKind::RtpH265),
            "rtsp" => Ok(StreamKind::Rtsp),
            "tsusb" => Ok(StreamKind::UsbTunnel),
            scheme => Err(ReceiverError::SourceBuild(format!(
                "unsupported scheme '{scheme}'"
            ))),
        }
    }

    fn is_mpeg_ts(self) -> bool {
        matches!(self, StreamKind::TcpMpegTs | StreamKind::UdpMpegTs)
    }

    /// RTP caps filter applied on the ingest element, if any.
    fn rtp_caps(self) -> Option<gst::Caps> {
        let encoding = match self {
            StreamKind::RtpH264 => "H264",
            StreamKind::RtpH265 => "H265",
            _ => return None,
        };

        Some(
            gst::Caps::builder("application/x-rtp")
                .field("media", "video")
                .field("clock-rate", 90_000i32)
                .field("encoding-name", encoding)
                .build(),
        )
    }
}

/// Pad shape of the ingest element, discovered at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceShape {
    HasStaticPad { rtp: bool },
    HasDynamicPad,
}

fn host_and_port(url: &Url) -> Result<(String, u16)> {
    let host = url
        .host_str()
        .ok_or_else(|| ReceiverError::UriInvalid(url.to_string()))?;
    let port = url
        .port()
        .ok_or_else(|| ReceiverError::UriInvalid(url.to_string()))?;
    Ok((host.to_string(), port))
}

fn pad_is_rtp(pad: &gst::Pad) -> bool {
    let filter = gst::Caps::new_empty_simple("application/x-rtp");
    let caps = pad.query_caps(None);
    !caps.is_any() && caps.can_intersect(&filter)
}

fn make_ingest(runtime: &Runtime, kind: StreamKind, url: &Url, rtsp_timeout_us: u64) -> Result<gst::Element> {
    match kind {
        StreamKind::TcpMpegTs => {
            let (host, port) = host_and_port(url)?;
            let source = runtime.make_named("tcpclientsrc", "source")?;
            source.set_property("host", host.as_str());
            source.set_property("port", port as i32);
            Ok(source)
        }
        StreamKind::Rtsp => {
            let source = runtime.make_named("rtspsrc", "source")?;
            source.set_property("location", url.as_str());
            source.set_property("latency", 17u32);
            source.set_property("udp-reconnect", true);
            source.set_property("timeout", rtsp_timeout_us);
            Ok(source)
        }
        StreamKind::UdpMpegTs | StreamKind::RtpH264 | StreamKind::RtpH265 | StreamKind::UsbTunnel => {
            let (host, port) = host_and_port(url)?;
            let source = runtime.make_named("udpsrc", "source")?;
            source.set_property("uri", format!("udp://{host}:{port}"));
            if let Some(caps) = kind.rtp_caps() {
                source.set_property("caps", &caps);
            }
            Ok(source)
        }
    }
}

/// Link a freshly appeared ingest pad into the parser, inserting a jitter
/// buffer in front of the parser when the pad carries RTP.
fn link_dynamic_pad(runtime: &Runtime, bin: &gst::Bin, pad: &gst::Pad, parser: &gst::Element) {
    let mut srcpad = pad.clone();

    if pad_is_rtp(pad) {
        match runtime.make("rtpjitterbuffer") {
            Ok(buffer) => {
                // Errors here leave the pad linked straight to the parser.
                if bin.add(&buffer).is_ok()
                    && buffer.sync_state_with_parent().is_ok()
                    && pad.link(&buffer.static_pad("sink").unwrap()).is_ok()
                {
                    srcpad = buffer.static_pad("src").unwrap();
                } else {
                    gst::warning!(CAT, obj = bin, "Failed to insert RTP jitter buffer");
                    let _ = bin.remove(&buffer);
                }
            }
            Err(err) => {
                gst::warning!(CAT, obj = bin, "No RTP jitter buffer: {}", err);
            }
        }
    }

    let sinkpad = match parser.static_pad("sink") {
        Some(pad) => pad,
        None => {
            gst::error!(CAT, obj = bin, "Parser has no sink pad");
            return;
        }
    };

    if let Err(err) = srcpad.link(&sinkpad) {
        gst::error!(CAT, obj = bin, "Failed to link ingest pad: {:?}", err);
    }
}

/// Expose a parser output pad as a ghost pad on the source bin.
fn expose_parser_pad(bin: &gst::Bin, pad: &gst::Pad) {
    let ghost = match gst::GhostPad::builder_with_target(pad) {
        Ok(builder) => builder.name(pad.name().as_str()).build(),
        Err(err) => {
            gst::error!(CAT, obj = bin, "Failed to ghost parser pad: {}", err);
            return;
        }
    };

    if let Err(err) = ghost.set_active(true) {
        gst::error!(CAT, obj = bin, "Failed to activate ghost pad: {}", err);
        return;
    }

    if bin.add_pad(&ghost).is_err() {
        gst::error!(CAT, obj = bin, "Failed to add ghost pad to source bin");
    }
}

/// Assemble a self-contained source bin for `uri`.
///
/// The bin contains the ingest element, an optional RTP jitter buffer and a
/// parser (an MPEG-TS demuxer for `tcp://` and `mpegts://`, a parse bin for
/// everything else). Parsed elementary-stream pads surface as ghost pads on
/// the bin as the parser discovers them.
pub fn build(runtime: &Runtime, uri: &str, rtsp_timeout_us: u64) -> Result<gst::Bin> {
    let kind = StreamKind::from_uri(uri)?;
    let url = Url::parse(uri).map_err(|_| ReceiverError::UriInvalid(uri.to_string()))?;

    let source = make_ingest(runtime, kind, &url, rtsp_timeout_us)?;

    // Android does not reliably detect MPEG-TS through parsebin, so the
    // demuxer is selected explicitly for the TS schemes.
    let parser = if kind.is_mpeg_ts() {
        runtime.make_named("tsdemux", "parser")?
    } else {
        runtime.make_named("parsebin", "parser")?
    };

    let bin = gst::Bin::builder().name("sourcebin").build();
    runtime.track(&bin);

    bin.add_many([&source, &parser])
        .map_err(|err| ReceiverError::SourceBuild(err.to_string()))?;

    let static_pads = source.src_pads();
    let shape = if static_pads.is_empty() {
        SourceShape::HasDynamicPad
    } else {
        SourceShape::HasStaticPad {
            rtp: static_pads.iter().any(pad_is_rtp),
        }
    };

    gst::debug!(CAT, obj = bin, "Source for {:?} has shape {:?}", kind, shape);

    match shape {
        SourceShape::HasStaticPad { rtp: true } => {
            let buffer = runtime.make("rtpjitterbuffer")?;
            bin.add(&buffer)
                .map_err(|err| ReceiverError::SourceBuild(err.to_string()))?;
            gst::Element::link_many([&source, &buffer, &parser])
                .map_err(|err| ReceiverError::SourceBuild(err.to_string()))?;
        }
        SourceShape::HasStaticPad { rtp: false } => {
            source
                .link(&parser)
                .map_err(|err| ReceiverError::SourceBuild(err.to_string()))?;
        }
        SourceShape::HasDynamicPad => {
            let runtime = runtime.clone();
            let bin_weak = bin.downgrade();
            let parser_weak = parser.downgrade();
            source.connect_pad_added(move |_, pad| {
                let (Some(bin), Some(parser)) = (bin_weak.upgrade(), parser_weak.upgrade()) else {
                    return;
                };
                link_dynamic_pad(&runtime, &bin, pad, &parser);
            });
        }
    }

    let bin_weak = bin.downgrade();
    parser.connect_pad_added(move |_, pad| {
        let Some(bin) = bin_weak.upgrade() else {
            return;
        };
        expose_parser_pad(&bin, pad);
    });

    Ok(bin)
}

// Copyright (C) 2025 Video Receiver contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use gst::prelude::*;
use std::path::Path;
use std::sync::LazyLock;

use crate::error::{ReceiverError, Result};
use crate::runtime::Runtime;

static CAT: LazyLock<gst::DebugCategory> = LazyLock::new(|| {
    gst::DebugCategory::new(
        "videorxrecorder",
        gst::DebugColorFlags::empty(),
        Some("Video receiver file sink builder"),
    )
});

/// Container format for recorded files.
///
/// The tag is what crosses the API; the file extension is a presentation
/// concern left to front ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Matroska,
    QuickTime,
    Mp4,
}

impl FileFormat {
    fn muxer(self) -> &'static str {
        match self {
            FileFormat::Matroska => "matroskamux",
            FileFormat::QuickTime => "qtmux",
            FileFormat::Mp4 => "mp4mux",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            FileFormat::Matroska => "mkv",
            FileFormat::QuickTime => "mov",
            FileFormat::Mp4 => "mp4",
        }
    }
}

impl TryFrom<u32> for FileFormat {
    type Error = ReceiverError;

    fn try_from(value: u32) -> Result<FileFormat> {
        match value {
            0 => Ok(FileFormat::Matroska),
            1 => Ok(FileFormat::QuickTime),
            2 => Ok(FileFormat::Mp4),
            n => Err(ReceiverError::RecorderBuild(format!(
                "unsupported file format {n}"
            ))),
        }
    }
}

/// Assemble a sink bin that muxes one video stream into `path`.
///
/// The bin contains the muxer and a file writer; a requested `video_%u`
/// muxer pad is exposed as the bin's single ghost sink pad.
pub fn build(runtime: &Runtime, path: &Path, format: FileFormat) -> Result<gst::Bin> {
    let location = path
        .to_str()
        .ok_or_else(|| ReceiverError::RecorderBuild(format!("non-UTF-8 path {path:?}")))?;

    let mux = runtime.make(format.muxer())?;
    let sink = runtime.make("filesink")?;
    sink.set_property("location", location);

    let bin = gst::Bin::builder().name("sinkbin").build();
    runtime.track(&bin);

    let pad = mux
        .request_pad_simple("video_%u")
        .ok_or_else(|| ReceiverError::RecorderBuild("muxer refused a video pad".to_string()))?;

    bin.add_many([&mux, &sink])
        .map_err(|err| ReceiverError::RecorderBuild(err.to_string()))?;

    mux.link(&sink)
        .map_err(|err| ReceiverError::RecorderBuild(err.to_string()))?;

    let ghost = gst::GhostPad::builder_with_target(&pad)
        .map_err(|err| ReceiverError::RecorderBuild(err.to_string()))?
        .name("sink")
        .build();

    bin.add_pad(&ghost)
        .map_err(|err| ReceiverError::RecorderBuild(err.to_string()))?;

    gst::debug!(
        CAT,
        obj = bin,
        "Built {:?} sink bin writing to {}",
        format,
        location
    );

    Ok(bin)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_tags_map_to_muxers() {
        assert_eq!(FileFormat::Matroska.muxer(), "matroskamux");
        assert_eq!(FileFormat::QuickTime.muxer(), "qtmux");
        assert_eq!(FileFormat::Mp4.muxer(), "mp4mux");
    }

    #[test]
    fn format_tags_map_to_extensions() {
        assert_eq!(FileFormat::Matroska.extension(), "mkv");
        assert_eq!(FileFormat::QuickTime.extension(), "mov");
        assert_eq!(FileFormat::Mp4.extension(), "mp4");
    }

    #[test]
    fn format_indices_follow_the_wire_order() {
        assert_eq!(FileFormat::try_from(0).unwrap(), FileFormat::Matroska);
        assert_eq!(FileFormat::try_from(1).unwrap(), FileFormat::QuickTime);
        assert_eq!(FileFormat::try_from(2).unwrap(), FileFormat::Mp4);
        assert!(matches!(
            FileFormat::try_from(3),
            Err(ReceiverError::RecorderBuild(_))
        ));
    }
}

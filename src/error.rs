// Copyright (C) 2025 Video Receiver contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

/// Errors surfaced by the reception engine.
///
/// Build-time errors unwind locally and leave the session in its prior
/// state; runtime errors go through the bus and trigger a stop followed by a
/// scheduled restart.
#[derive(Debug, thiserror::Error)]
pub enum ReceiverError {
    #[error("invalid URI '{0}'")]
    UriInvalid(String),

    #[error("required element '{0}' is not available")]
    Unavailable(String),

    #[error("failed to build source: {0}")]
    SourceBuild(String),

    #[error("failed to build recorder: {0}")]
    RecorderBuild(String),

    #[error("pipeline error: {0}")]
    Pipeline(String),

    #[error("unexpected end of stream")]
    UnexpectedEos,

    #[error("{0} not allowed while {1}")]
    InvalidState(&'static str, &'static str),
}

pub type Result<T> = std::result::Result<T, ReceiverError>;

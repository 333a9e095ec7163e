// Copyright (C) 2025 Video Receiver contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

/**
 * SECTION:element-timeshift
 *
 * Offsets the presentation and decode timestamps of every buffer by a fixed
 * signed amount. With `timestamp-shift=0` the element is pure passthrough.
 *
 * Used on the recording branch so that timestamp policy can be adjusted
 * without touching external elements.
 *
 * ## Example launch line
 * ```
 * gst-launch-1.0 videotestsrc ! timeshift timestamp-shift=-1000000000 ! fakesink
 * ```
 */
use gst::glib;
use gst::prelude::*;

mod imp;

glib::wrapper! {
    pub struct TimeShift(ObjectSubclass<imp::TimeShift>) @extends gst_base::BaseTransform, gst::Element, gst::Object;
}

pub fn register(plugin: &gst::Plugin) -> Result<(), glib::BoolError> {
    gst::Element::register(
        Some(plugin),
        "timeshift",
        gst::Rank::NONE,
        TimeShift::static_type(),
    )
}

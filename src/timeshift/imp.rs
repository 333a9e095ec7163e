// Copyright (C) 2025 Video Receiver contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use gst::glib;
use gst::glib::Properties;
use gst::prelude::*;
use gst::subclass::prelude::*;
use gst_base::prelude::*;
use gst_base::subclass::prelude::*;
use std::sync::{LazyLock, Mutex};

static CAT: LazyLock<gst::DebugCategory> = LazyLock::new(|| {
    gst::DebugCategory::new(
        "timeshift",
        gst::DebugColorFlags::empty(),
        Some("Buffer timestamp shifter"),
    )
});

const DEFAULT_TIMESTAMP_SHIFT: i64 = 0;

#[derive(Debug)]
struct Settings {
    shift: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            shift: DEFAULT_TIMESTAMP_SHIFT,
        }
    }
}

#[derive(Properties, Default)]
#[properties(wrapper_type = super::TimeShift)]
pub struct TimeShift {
    #[property(name = "timestamp-shift", nick = "Timestamp shift",
               blurb = "Signed shift in nanoseconds applied to the PTS and DTS of every buffer",
               get = Self::shift, set = Self::set_shift, type = i64)]
    settings: Mutex<Settings>,
}

impl TimeShift {
    fn shift(&self) -> i64 {
        self.settings.lock().unwrap().shift
    }

    fn set_shift(&self, shift: i64) {
        let mut settings = self.settings.lock().unwrap();
        gst::info!(
            CAT,
            imp = self,
            "Changing timestamp-shift from {} to {}",
            settings.shift,
            shift
        );
        settings.shift = shift;
        drop(settings);

        self.obj().set_passthrough(shift == 0);
    }
}

fn shifted(ts: gst::ClockTime, shift: i64) -> gst::ClockTime {
    match ts.nseconds().checked_add_signed(shift) {
        Some(ns) => gst::ClockTime::from_nseconds(ns),
        None => gst::ClockTime::ZERO,
    }
}

#[glib::object_subclass]
impl ObjectSubclass for TimeShift {
    const NAME: &'static str = "GstTimeShift";
    type Type = super::TimeShift;
    type ParentType = gst_base::BaseTransform;
}

#[glib::derived_properties]
impl ObjectImpl for TimeShift {
    fn constructed(&self) {
        self.parent_constructed();

        self.obj().set_passthrough(true);
    }
}

impl GstObjectImpl for TimeShift {}

impl ElementImpl for TimeShift {
    fn metadata() -> Option<&'static gst::subclass::ElementMetadata> {
        static ELEMENT_METADATA: LazyLock<gst::subclass::ElementMetadata> = LazyLock::new(|| {
            gst::subclass::ElementMetadata::new(
                "Timestamp shifter",
                "Filter/Video",
                "Offsets buffer presentation and decode timestamps by a fixed amount",
                "Video Receiver contributors",
            )
        });

        Some(&*ELEMENT_METADATA)
    }

    fn pad_templates() -> &'static [gst::PadTemplate] {
        static PAD_TEMPLATES: LazyLock<Vec<gst::PadTemplate>> = LazyLock::new(|| {
            let caps = gst::Caps::new_any();

            let sink_pad_template = gst::PadTemplate::new(
                "sink",
                gst::PadDirection::Sink,
                gst::PadPresence::Always,
                &caps,
            )
            .unwrap();

            let src_pad_template = gst::PadTemplate::new(
                "src",
                gst::PadDirection::Src,
                gst::PadPresence::Always,
                &caps,
            )
            .unwrap();

            vec![sink_pad_template, src_pad_template]
        });

        PAD_TEMPLATES.as_ref()
    }
}

impl BaseTransformImpl for TimeShift {
    const MODE: gst_base::subclass::BaseTransformMode =
        gst_base::subclass::BaseTransformMode::AlwaysInPlace;
    const PASSTHROUGH_ON_SAME_CAPS: bool = false;
    const TRANSFORM_IP_ON_PASSTHROUGH: bool = false;

    fn transform_ip(&self, buf: &mut gst::BufferRef) -> Result<gst::FlowSuccess, gst::FlowError> {
        let shift = self.settings.lock().unwrap().shift;
        if shift == 0 {
            return Ok(gst::FlowSuccess::Ok);
        }

        if let Some(pts) = buf.pts() {
            buf.set_pts(shifted(pts, shift));
        }

        if let Some(dts) = buf.dts() {
            buf.set_dts(shifted(dts, shift));
        }

        gst::trace!(
            CAT,
            imp = self,
            "Shifted buffer to pts {:?} dts {:?}",
            buf.pts(),
            buf.dts()
        );

        Ok(gst::FlowSuccess::Ok)
    }
}

// Copyright (C) 2025 Video Receiver contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use gst::prelude::*;

fn init() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        gst::init().unwrap();
        gstvideoreceiver::plugin_register_static()
            .expect("Failed to register videoreceiver plugin");
    });
}

fn push_buffer(
    h: &mut gst_check::Harness,
    pts: impl Into<Option<gst::ClockTime>>,
    dts: impl Into<Option<gst::ClockTime>>,
) -> gst::Buffer {
    let mut buffer = gst::Buffer::with_size(4).unwrap();
    {
        let buffer = buffer.get_mut().unwrap();
        buffer.set_pts(pts);
        buffer.set_dts(dts);
    }
    h.push(buffer).unwrap();
    h.pull().unwrap()
}

#[test]
fn zero_shift_is_passthrough() {
    init();

    let mut h = gst_check::Harness::new("timeshift");
    h.set_src_caps(gst::Caps::builder("video/x-h264").build());
    h.play();

    let out = push_buffer(
        &mut h,
        gst::ClockTime::from_seconds(1),
        gst::ClockTime::from_mseconds(900),
    );
    assert_eq!(out.pts(), Some(gst::ClockTime::from_seconds(1)));
    assert_eq!(out.dts(), Some(gst::ClockTime::from_mseconds(900)));
}

#[test]
fn positive_shift_moves_both_timestamps() {
    init();

    let mut h = gst_check::Harness::new("timeshift");
    h.element()
        .unwrap()
        .set_property("timestamp-shift", 500_000_000i64);
    h.set_src_caps(gst::Caps::builder("video/x-h264").build());
    h.play();

    let out = push_buffer(
        &mut h,
        gst::ClockTime::from_seconds(1),
        gst::ClockTime::from_mseconds(900),
    );
    assert_eq!(out.pts(), Some(gst::ClockTime::from_mseconds(1500)));
    assert_eq!(out.dts(), Some(gst::ClockTime::from_mseconds(1400)));
}

#[test]
fn negative_shift_clamps_at_zero() {
    init();

    let mut h = gst_check::Harness::new("timeshift");
    h.element()
        .unwrap()
        .set_property("timestamp-shift", -2_000_000_000i64);
    h.set_src_caps(gst::Caps::builder("video/x-h264").build());
    h.play();

    let out = push_buffer(&mut h, gst::ClockTime::from_seconds(3), gst::ClockTime::NONE);
    assert_eq!(out.pts(), Some(gst::ClockTime::SECOND));
    assert_eq!(out.dts(), gst::ClockTime::NONE);

    let out = push_buffer(&mut h, gst::ClockTime::SECOND, gst::ClockTime::NONE);
    assert_eq!(out.pts(), Some(gst::ClockTime::ZERO));
}

#[test]
fn untimestamped_buffers_pass_unchanged() {
    init();

    let mut h = gst_check::Harness::new("timeshift");
    h.element()
        .unwrap()
        .set_property("timestamp-shift", 250_000_000i64);
    h.set_src_caps(gst::Caps::builder("video/x-h264").build());
    h.play();

    let out = push_buffer(&mut h, gst::ClockTime::NONE, gst::ClockTime::NONE);
    assert_eq!(out.pts(), gst::ClockTime::NONE);
    assert_eq!(out.dts(), gst::ClockTime::NONE);
}

#[test]
fn shift_property_roundtrips() {
    init();

    let element = gst::ElementFactory::make("timeshift").build().unwrap();
    assert_eq!(element.property::<i64>("timestamp-shift"), 0);

    element.set_property("timestamp-shift", -1_389i64);
    assert_eq!(element.property::<i64>("timestamp-shift"), -1_389);
}

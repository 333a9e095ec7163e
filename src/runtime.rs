// Copyright (C) 2025 Video Receiver contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use gst::glib;
use gst::prelude::*;
use std::sync::LazyLock;
use std::sync::{Arc, Mutex, Once};

use crate::error::{ReceiverError, Result};

static CAT: LazyLock<gst::DebugCategory> = LazyLock::new(|| {
    gst::DebugCategory::new(
        "videorxruntime",
        gst::DebugColorFlags::empty(),
        Some("Video receiver framework context"),
    )
});

/// Process-wide framework context.
///
/// The only holder of process-wide framework handles: it initializes
/// GStreamer once, registers the crate's own elements, and creates every
/// element the engine uses. Each created element is also noted in a weak-ref
/// ledger so tests can assert that a torn-down session leaves nothing alive.
#[derive(Clone)]
pub struct Runtime {
    ledger: Arc<Mutex<Vec<glib::WeakRef<gst::Element>>>>,
}

impl Runtime {
    pub fn new() -> Result<Self> {
        gst::init().map_err(|err| ReceiverError::Unavailable(format!("gstreamer: {err}")))?;

        static REGISTER: Once = Once::new();
        REGISTER.call_once(|| {
            crate::plugin_register_static().expect("Failed to register videoreceiver plugin");
        });

        Ok(Runtime {
            ledger: Default::default(),
        })
    }

    /// Create an element by factory name.
    pub fn make(&self, factory: &str) -> Result<gst::Element> {
        let elem = gst::ElementFactory::make(factory)
            .build()
            .map_err(|_| ReceiverError::Unavailable(factory.to_string()))?;
        self.track(&elem);
        Ok(elem)
    }

    /// Create a named element by factory name.
    pub fn make_named(&self, factory: &str, name: &str) -> Result<gst::Element> {
        let elem = gst::ElementFactory::make(factory)
            .name(name)
            .build()
            .map_err(|_| ReceiverError::Unavailable(factory.to_string()))?;
        self.track(&elem);
        Ok(elem)
    }

    /// Note an element in the leak ledger.
    pub fn track(&self, elem: &impl IsA<gst::Element>) {
        let weak = elem.upcast_ref::<gst::Element>().downgrade();
        self.ledger.lock().unwrap().push(weak);
    }

    /// Number of ledger elements still alive anywhere in the process.
    pub fn live_element_count(&self) -> usize {
        let mut ledger = self.ledger.lock().unwrap();
        ledger.retain(|weak| weak.upgrade().is_some());
        ledger.len()
    }

    /// Dump the graph as a dot file, keyed by `label`.
    ///
    /// No-op unless `GST_DEBUG_DUMP_DOT_DIR` is set.
    pub fn dump_graph(&self, bin: &impl IsA<gst::Bin>, label: &str) {
        gst::debug!(CAT, "dumping pipeline graph '{}'", label);
        bin.debug_to_dot_file_with_ts(gst::DebugGraphDetails::all(), label);
    }
}

// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Diagnostics: structured logging and the optional fault record ring.

pub mod log;

#[cfg(feature = "fault_trace_ring")]
pub mod ring;

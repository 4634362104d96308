// SPDX-License-Identifier: PMPL-1.0-or-later

//! chaos-agent — single-host fault injection with reliable recovery.
//!
//! The agent degrades a running host on purpose and undoes it afterwards.
//! Each fault is an [`injector::Injector`] looked up through the
//! [`injector::Registry`] and driven through the same lifecycle:
//! default, validate, inject, recover.
//!
//! FAULTS:
//! 1. **diskio/burn**: a detached helper saturates a directory's device with
//!    direct I/O.
//! 2. **network/delay**: a tc rule tree adds latency to all egress traffic or
//!    to a filtered subset (or to everything except that subset).

pub mod config;
pub mod error;
pub mod host;
pub mod injector;
pub mod testing;
pub mod units;

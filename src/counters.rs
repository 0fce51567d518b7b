// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Types for working with and exposing packet statistic counters.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::{
    ip::{Ipv4Counters, LinkLocalCounters},
    SyncCtx,
};

/// An atomic counter for packet statistics, e.g. IPv4 packets received.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub(crate) fn increment(&self) {
        // Use relaxed ordering since we do not use packet counter values to
        // synchronize other accesses.  See:
        // https://doc.rust-lang.org/nomicon/atomics.html#relaxed
        let Self(v) = self;
        let _: u64 = v.fetch_add(1, Ordering::Relaxed);
    }

    /// Atomically retrieves the counter value as a `u64`.
    pub fn get(&self) -> u64 {
        // Use relaxed ordering since we do not use packet counter values to
        // synchronize other accesses.  See:
        // https://doc.rust-lang.org/nomicon/atomics.html#relaxed
        let Self(v) = self;
        v.load(Ordering::Relaxed)
    }
}

/// Stack counters for export outside of core.
pub struct StackCounters<'a> {
    /// IPv4 layer counters.
    pub ipv4: &'a Ipv4Counters,
    /// Link-local negotiation counters.
    pub link_local: &'a LinkLocalCounters,
}

/// Visitor for stack counters.
pub trait CounterVisitor {
    /// Performs a user-defined operation on stack counters.
    fn visit_counters(&self, counters: StackCounters<'_>);
}

/// Provides access to stack counters via a visitor.
///
/// Counters are kept outside of the stack lock, so this never blocks on
/// packet processing.
pub fn inspect_counters<V: CounterVisitor>(core_ctx: &SyncCtx, visitor: &V) {
    let counters = StackCounters {
        ipv4: core_ctx.state.ipv4_counters(),
        link_local: core_ctx.state.link_local_counters(),
    };
    visitor.visit_counters(counters);
}

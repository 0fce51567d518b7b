// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! An IPv4 network layer.
//!
//! This crate implements the IPv4 layer of a small network stack: per-device
//! address configuration, validation of received datagrams, fragment
//! reassembly, the transmit pipeline and RFC 3927 link-local address
//! negotiation. Everything below IP (link-layer framing, ARP) and above it
//! (ICMP, IGMP, UDP, TCP) is reached through the bindings traits collected in
//! [`BindingsContext`].
//!
//! All mutable state lives behind a single lock held by [`SyncCtx`]. Every
//! public entry point acquires that lock once and releases it before
//! returning; timers requested through [`TimerContext`] are delivered back
//! through [`handle_timer`], which takes the same lock.

#![deny(missing_docs, unreachable_patterns, clippy::useless_conversion, clippy::redundant_clone)]

extern crate alloc;

mod context;
mod counters;
mod state;
mod time;

#[cfg(test)]
pub(crate) mod testutil;

// Allow direct public access to the error module. This module is unlikely to
// evolve poorly or have sealed traits.
pub mod error;

/// The device layer.
pub mod device {
    pub(crate) mod arp;
    pub(crate) mod base;

    pub(crate) use base::*;

    // Re-exported freestanding functions.
    pub use base::{add_ethernet_device, get_device_mac, get_device_mtu, set_device_enabled};

    // Re-exported types.
    pub use arp::ArpDispatcher;
    pub use base::{
        DeviceId, DeviceLayerEventDispatcher, DeviceSendFrameError, FrameDestination,
        LinkDestination, Mac,
    };
}

/// The IPv4 layer.
pub mod ip {
    pub(crate) mod address;
    pub(crate) mod base;
    pub(crate) mod device;
    pub(crate) mod forwarding;
    pub(crate) mod header;
    pub(crate) mod icmp;
    pub(crate) mod link_local;
    pub(crate) mod options;
    pub(crate) mod reassembly;

    // Re-exported freestanding functions.
    pub use address::{is_valid_host_address, is_valid_host_address_with_mask, is_valid_subnet_mask};
    pub use base::{
        receive_ipv4_packet, retransmit_ipv4_packet, send_ipv4_packet, set_reassembly_timeout,
    };
    pub use device::api::{
        add_ipv4_addr_static, commit_dynamic_ipv4_addr, del_all_ipv4_addrs, del_ipv4_addr,
        get_all_ipv4_addrs, get_default_gateway, get_ipv4_addr_entries, get_subnet_mask,
        is_configured_on, is_host_address, join_multicast_group, leave_multicast_group,
        notify_address_conflict, start_dynamic_ipv4_addr, stop_dynamic_ipv4_addr,
    };
    pub use forwarding::classify_destination;
    pub use link_local::{start_link_local, stop_link_local};

    // Re-exported types.
    pub use base::{HopLimits, Ipv4Counters, SendIpv4Params, TxFlags};
    pub use device::state::{AddrConfigMode, Ipv4AddressEntry};
    pub use device::Ipv4DeviceEvent;
    pub use forwarding::Ipv4Destination;
    pub use header::Ipv4Proto;
    pub use icmp::{IcmpErrorDispatcher, Icmpv4Error, Icmpv4ErrorKind};
    pub use link_local::{
        ArpRetries, ArpRetryTimeout, LinkLocalCounters, LinkLocalResult, LinkLocalStart,
    };
    pub use options::{
        Ipv4TimestampContext, RouteOption, SecurityOption, TimestampOption, TxOption,
    };
    pub use reassembly::ReassemblyTimeout;
}

/// Transport layer sinks.
pub mod transport;

pub use context::{
    BindingsContext, EventContext, InstantContext, RngContext, SyncCtx, TimerContext,
};
pub use counters::{inspect_counters, Counter, CounterVisitor, StackCounters};
pub use state::{Ipv4StateBuilder, StackStateBuilder};
pub use time::{handle_timer, Instant, TimerId};

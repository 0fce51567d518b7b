// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The Address Resolution Protocol (ARP) hooks used by the IPv4 layer.
//!
//! ARP itself is implemented outside of this crate. Link-local negotiation
//! only needs to look up the neighbor cache and to emit probes and
//! announcements (RFC 5227 sections 2.1.1 and 2.3).

use std::net::Ipv4Addr;

use crate::device::{DeviceId, Mac};

/// The ARP operations used by the IPv4 layer.
pub trait ArpDispatcher {
    /// Looks up `addr` in the neighbor cache of `device`.
    ///
    /// Returns the hardware address if an entry is resolved.
    fn lookup(&mut self, device: &DeviceId, addr: Ipv4Addr) -> Option<Mac>;

    /// Sends an ARP probe for `addr`: an ARP request with an unspecified
    /// sender protocol address.
    fn send_probe(&mut self, device: &DeviceId, addr: Ipv4Addr);

    /// Sends an ARP announcement for `addr`: an ARP request with `addr` as
    /// both the sender and target protocol address.
    fn send_announcement(&mut self, device: &DeviceId, addr: Ipv4Addr);
}

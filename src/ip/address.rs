// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! IPv4 address classification and validity rules.

use std::net::Ipv4Addr;

/// The "this host" address, `0.0.0.0`.
pub(crate) const THIS_HOST: Ipv4Addr = Ipv4Addr::UNSPECIFIED;

/// The limited broadcast address, `255.255.255.255`.
pub(crate) const LIMITED_BROADCAST: Ipv4Addr = Ipv4Addr::BROADCAST;

const LOOPBACK_NET: u32 = 0x7F00_0000;
const LOOPBACK_MASK: u32 = 0xFF00_0000;

/// The link-local network, `169.254.0.0/16`.
pub(crate) const LINK_LOCAL_NET: u32 = 0xA9FE_0000;
/// The mask of the link-local network.
pub(crate) const LINK_LOCAL_MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 0, 0);
/// The lowest address a link-local host may use (RFC 3927 section 2.1).
pub(crate) const LINK_LOCAL_HOST_MIN: Ipv4Addr = Ipv4Addr::new(169, 254, 1, 0);
/// The highest address a link-local host may use (RFC 3927 section 2.1).
pub(crate) const LINK_LOCAL_HOST_MAX: Ipv4Addr = Ipv4Addr::new(169, 254, 254, 255);

/// Shortest prefix accepted for a configured subnet mask.
pub(crate) const MIN_PREFIX_LEN: u32 = 2;
/// Longest prefix accepted for a configured subnet mask; a /31 or /32 leaves
/// no room for both a network and a broadcast address.
pub(crate) const MAX_PREFIX_LEN: u32 = 30;

/// The classful address categories of RFC 791.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum AddrClass {
    A,
    B,
    C,
    D,
    E,
}

impl AddrClass {
    pub(crate) fn of(addr: Ipv4Addr) -> AddrClass {
        let [first, ..] = addr.octets();
        match first {
            0..=127 => AddrClass::A,
            128..=191 => AddrClass::B,
            192..=223 => AddrClass::C,
            224..=239 => AddrClass::D,
            240..=255 => AddrClass::E,
        }
    }

    /// The natural network mask of a unicast class.
    pub(crate) fn network_mask(self) -> Option<u32> {
        match self {
            AddrClass::A => Some(0xFF00_0000),
            AddrClass::B => Some(0xFFFF_0000),
            AddrClass::C => Some(0xFFFF_FF00),
            AddrClass::D | AddrClass::E => None,
        }
    }
}

pub(crate) fn is_loopback(addr: Ipv4Addr) -> bool {
    u32::from(addr) & LOOPBACK_MASK == LOOPBACK_NET
}

pub(crate) fn is_link_local(addr: Ipv4Addr) -> bool {
    u32::from(addr) & u32::from(LINK_LOCAL_MASK) == LINK_LOCAL_NET
}

/// Is `addr` in the range a link-local host may claim?
pub(crate) fn is_link_local_host(addr: Ipv4Addr) -> bool {
    (LINK_LOCAL_HOST_MIN..=LINK_LOCAL_HOST_MAX).contains(&addr)
}

pub(crate) fn is_multicast(addr: Ipv4Addr) -> bool {
    AddrClass::of(addr) == AddrClass::D
}

pub(crate) fn is_class_e(addr: Ipv4Addr) -> bool {
    // The limited broadcast address is numerically part of class E.
    AddrClass::of(addr) == AddrClass::E && addr != LIMITED_BROADCAST
}

/// Is `addr` the all-ones broadcast of its classful network?
pub(crate) fn is_classful_broadcast(addr: Ipv4Addr) -> bool {
    AddrClass::of(addr).network_mask().map_or(false, |mask| {
        let host = !mask;
        u32::from(addr) & host == host
    })
}

/// Returns the prefix length of a contiguous mask.
pub(crate) fn prefix_len(mask: Ipv4Addr) -> Option<u32> {
    let mask = u32::from(mask);
    let len = mask.leading_ones();
    (mask.checked_shl(len).unwrap_or(0) == 0).then_some(len)
}

/// Returns whether `mask` is usable as a host's subnet mask.
///
/// The mask must be contiguous and leave at least two host bits while
/// keeping at least two network bits.
pub fn is_valid_subnet_mask(mask: Ipv4Addr) -> bool {
    prefix_len(mask).map_or(false, |len| (MIN_PREFIX_LEN..=MAX_PREFIX_LEN).contains(&len))
}

/// Returns whether `addr` may be assigned to a host.
///
/// The unspecified and limited broadcast addresses, the `0.0.0.0/8` "this
/// network" block, loopback, multicast and reserved (class E) addresses are
/// rejected, as are link-local addresses outside of the range hosts may
/// claim.
pub fn is_valid_host_address(addr: Ipv4Addr) -> bool {
    let [first, ..] = addr.octets();
    if addr == THIS_HOST || addr == LIMITED_BROADCAST || first == 0 {
        return false;
    }
    if is_loopback(addr) || is_multicast(addr) || is_class_e(addr) {
        return false;
    }
    if is_link_local(addr) && !is_link_local_host(addr) {
        return false;
    }
    true
}

/// Returns whether `addr` may be assigned to a host on a subnet described by
/// `mask`.
///
/// In addition to [`is_valid_host_address`], the host portion of `addr` must
/// be neither all zeros (the subnet's network address) nor all ones (the
/// subnet's broadcast address).
pub fn is_valid_host_address_with_mask(addr: Ipv4Addr, mask: Ipv4Addr) -> bool {
    if !is_valid_host_address(addr) || !is_valid_subnet_mask(mask) {
        return false;
    }
    let host_mask = !u32::from(mask);
    let host = u32::from(addr) & host_mask;
    host != 0 && host != host_mask
}

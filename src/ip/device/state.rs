// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! State for an IPv4 device.

use alloc::vec::Vec;
use std::net::Ipv4Addr;

use crate::ip::link_local::LinkLocalState;

/// How an address came to be configured.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AddrConfigMode {
    /// Configured by the administrator.
    Static,
    /// Committed by a dynamic protocol such as DHCP.
    Dynamic,
    /// Claimed through RFC 3927 link-local negotiation.
    LinkLocal,
}

/// An address assigned to a device, along with its subnet configuration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Ipv4AddressEntry {
    pub(crate) addr: Ipv4Addr,
    pub(crate) subnet_mask: Ipv4Addr,
    pub(crate) default_gateway: Option<Ipv4Addr>,
    pub(crate) config_mode: AddrConfigMode,
    pub(crate) is_valid: bool,
}

impl Ipv4AddressEntry {
    pub(crate) fn new(
        addr: Ipv4Addr,
        subnet_mask: Ipv4Addr,
        default_gateway: Option<Ipv4Addr>,
        config_mode: AddrConfigMode,
    ) -> Ipv4AddressEntry {
        Ipv4AddressEntry { addr, subnet_mask, default_gateway, config_mode, is_valid: true }
    }

    /// The host address.
    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    /// The subnet mask.
    pub fn subnet_mask(&self) -> Ipv4Addr {
        self.subnet_mask
    }

    /// The default gateway, if any.
    pub fn default_gateway(&self) -> Option<Ipv4Addr> {
        self.default_gateway
    }

    /// How the address was configured.
    pub fn config_mode(&self) -> AddrConfigMode {
        self.config_mode
    }

    /// False once another host has been seen claiming this address.
    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    fn host_mask(&self) -> u32 {
        !u32::from(self.subnet_mask)
    }

    /// Is `addr` on this entry's subnet?
    pub(crate) fn subnet_contains(&self, addr: Ipv4Addr) -> bool {
        let mask = u32::from(self.subnet_mask);
        u32::from(addr) & mask == u32::from(self.addr) & mask
    }

    /// Is `addr` the directed broadcast address of this entry's subnet?
    pub(crate) fn is_subnet_broadcast(&self, addr: Ipv4Addr) -> bool {
        let host = self.host_mask();
        self.subnet_contains(addr) && u32::from(addr) & host == host
    }
}

/// The IPv4 state held by a device.
#[derive(Default)]
pub(crate) struct Ipv4DeviceState {
    pub(crate) addrs: Vec<Ipv4AddressEntry>,
    /// Set while a dynamic configuration protocol owns the device; permits
    /// sending and receiving with an unspecified source.
    pub(crate) dynamic_init: bool,
    pub(crate) multicast_groups: Vec<Ipv4Addr>,
    pub(crate) link_local: Option<LinkLocalState>,
    /// Generation of the next link-local candidate; survives stop and restart.
    pub(crate) link_local_generation: u64,
}

impl Ipv4DeviceState {
    pub(crate) fn find_addr(&self, addr: Ipv4Addr) -> Option<&Ipv4AddressEntry> {
        self.addrs.iter().find(|entry| entry.addr == addr)
    }

    pub(crate) fn find_addr_mut(&mut self, addr: Ipv4Addr) -> Option<&mut Ipv4AddressEntry> {
        self.addrs.iter_mut().find(|entry| entry.addr == addr)
    }

    pub(crate) fn has_addr(&self, addr: Ipv4Addr) -> bool {
        self.find_addr(addr).is_some()
    }

    pub(crate) fn is_member_of(&self, group: Ipv4Addr) -> bool {
        self.multicast_groups.contains(&group)
    }
}

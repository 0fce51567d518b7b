// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! An IPv4 device: the per-device address table.

pub(crate) mod api;
pub(crate) mod state;

use alloc::vec::Vec;
use std::net::Ipv4Addr;

use tracing::debug;

use crate::{
    device::{DeviceId, Devices},
    error::{AddIpAddrError, NotFoundError},
    ip::{
        address::{is_valid_host_address_with_mask, is_valid_subnet_mask},
        device::state::{Ipv4AddressEntry, Ipv4DeviceState},
        link_local::LinkLocalResult,
    },
    transport::TransportDispatcher,
};

/// Events emitted from IPv4 devices.
#[derive(Debug, Eq, PartialEq, Clone)]
pub enum Ipv4DeviceEvent<DeviceId> {
    /// Another host on the link was seen using one of our addresses.
    AddressConflict {
        /// The device the conflict was observed on.
        device: DeviceId,
        /// The conflicting address.
        addr: Ipv4Addr,
    },
    /// Link-local negotiation on a device finished.
    LinkLocalCompleted {
        /// The device negotiation ran on.
        device: DeviceId,
        /// The outcome of the negotiation.
        result: LinkLocalResult,
    },
}

/// Checks that `addr`/`mask`/`gateway` may be added to the table.
fn validate_addr_entry(
    devices: &Devices,
    addr: Ipv4Addr,
    subnet_mask: Ipv4Addr,
    default_gateway: Option<Ipv4Addr>,
) -> Result<(), AddIpAddrError> {
    if !is_valid_subnet_mask(subnet_mask) {
        return Err(AddIpAddrError::InvalidMask);
    }
    if !is_valid_host_address_with_mask(addr, subnet_mask) {
        return Err(AddIpAddrError::InvalidAddr);
    }
    if let Some(gateway) = default_gateway {
        let mask = u32::from(subnet_mask);
        if gateway == addr
            || u32::from(gateway) & mask != u32::from(addr) & mask
            || !is_valid_host_address_with_mask(gateway, subnet_mask)
        {
            return Err(AddIpAddrError::InvalidGateway);
        }
    }
    if find_addr_entry(devices, addr).is_some() {
        return Err(AddIpAddrError::Exists);
    }
    Ok(())
}

/// Adds `entry` to the address table of `device`.
pub(crate) fn add_ipv4_addr_entry(
    devices: &mut Devices,
    max_addrs: usize,
    device: &DeviceId,
    entry: Ipv4AddressEntry,
) -> Result<(), AddIpAddrError> {
    let num_addrs =
        devices.get(device).map_err(|NotFoundError| AddIpAddrError::DeviceNotFound)?.ip.addrs.len();
    let Ipv4AddressEntry { addr, subnet_mask, default_gateway, config_mode, is_valid: _ } = &entry;
    validate_addr_entry(devices, *addr, *subnet_mask, *default_gateway)?;
    if num_addrs >= max_addrs {
        return Err(AddIpAddrError::AddressTableFull);
    }
    debug!("adding {:?} address {} to device {:?}", config_mode, addr, device);
    devices
        .get_mut(device)
        .map_err(|NotFoundError| AddIpAddrError::DeviceNotFound)?
        .ip
        .addrs
        .push(entry);
    Ok(())
}

/// Removes every address of `state` for which `f` returns true.
///
/// Transport connections bound to each address are closed before the address
/// is released.
pub(crate) fn del_ipv4_addr_entries_with<
    BC: TransportDispatcher,
    F: FnMut(&Ipv4AddressEntry) -> bool,
>(
    state: &mut Ipv4DeviceState,
    bindings_ctx: &mut BC,
    mut f: F,
) -> Vec<Ipv4AddressEntry> {
    let (removed, kept): (Vec<_>, Vec<_>) =
        core::mem::take(&mut state.addrs).into_iter().partition(|entry| f(entry));
    state.addrs = kept;
    for entry in removed.iter() {
        debug!("removing address {}", entry.addr);
        bindings_ctx.close_connections_bound_to(entry.addr);
    }
    removed
}

/// Removes `addr` from the address table of `device`.
pub(crate) fn del_ipv4_addr_entry<BC: TransportDispatcher>(
    devices: &mut Devices,
    bindings_ctx: &mut BC,
    device: &DeviceId,
    addr: Ipv4Addr,
) -> Result<Ipv4AddressEntry, NotFoundError> {
    let state = &mut devices.get_mut(device)?.ip;
    del_ipv4_addr_entries_with(state, bindings_ctx, |entry| entry.addr == addr)
        .pop()
        .ok_or(NotFoundError)
}

/// Finds the device holding `addr` and its table entry.
pub(crate) fn find_addr_entry(
    devices: &Devices,
    addr: Ipv4Addr,
) -> Option<(DeviceId, &Ipv4AddressEntry)> {
    devices.iter().find_map(|(id, state)| state.ip.find_addr(addr).map(|entry| (id, entry)))
}

/// Is `addr` configured on any device?
pub(crate) fn is_host_address(devices: &Devices, addr: Ipv4Addr) -> bool {
    find_addr_entry(devices, addr).is_some()
}

// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Address table API.
//!
//! Each function takes the stack lock for its whole duration, so every
//! operation is atomic with respect to packet processing.

use alloc::vec::Vec;
use std::net::Ipv4Addr;

use tracing::debug;

use crate::{
    context::{BindingsContext, SyncCtx},
    device::DeviceId,
    error::{AddIpAddrError, DynamicAddrError, NotFoundError},
    ip::{
        address::is_multicast,
        device::{
            add_ipv4_addr_entry, del_ipv4_addr_entries_with, del_ipv4_addr_entry,
            find_addr_entry,
            state::{AddrConfigMode, Ipv4AddressEntry},
            Ipv4DeviceEvent,
        },
        link_local,
    },
    EventContext as _,
};

/// Adds a statically configured address to `device`.
///
/// `subnet_mask` must be contiguous with a prefix length between 2 and 30,
/// `addr` must be a valid host on that subnet, and `default_gateway`, if
/// given, must be a different valid host on the same subnet.
pub fn add_ipv4_addr_static(
    core_ctx: &SyncCtx,
    device: &DeviceId,
    addr: Ipv4Addr,
    subnet_mask: Ipv4Addr,
    default_gateway: Option<Ipv4Addr>,
) -> Result<(), AddIpAddrError> {
    let mut core_ctx = core_ctx.lock();
    let max_addrs = core_ctx.locked.ipv4.config.max_addrs_per_device;
    add_ipv4_addr_entry(
        &mut core_ctx.locked.devices,
        max_addrs,
        device,
        Ipv4AddressEntry::new(addr, subnet_mask, default_gateway, AddrConfigMode::Static),
    )
}

/// Removes `addr` from `device`.
///
/// Transport connections bound to `addr` are closed first.
pub fn del_ipv4_addr<BC: BindingsContext>(
    core_ctx: &SyncCtx,
    bindings_ctx: &mut BC,
    device: &DeviceId,
    addr: Ipv4Addr,
) -> Result<(), NotFoundError> {
    let mut core_ctx = core_ctx.lock();
    del_ipv4_addr_entry(&mut core_ctx.locked.devices, bindings_ctx, device, addr).map(|_| ())
}

/// Removes every address from `device`.
pub fn del_all_ipv4_addrs<BC: BindingsContext>(
    core_ctx: &SyncCtx,
    bindings_ctx: &mut BC,
    device: &DeviceId,
) -> Result<(), NotFoundError> {
    let mut core_ctx = core_ctx.lock();
    let state = &mut core_ctx.locked.devices.get_mut(device)?.ip;
    let removed = del_ipv4_addr_entries_with(state, bindings_ctx, |_| true);
    debug!("removed {} addresses from {:?}", removed.len(), device);
    Ok(())
}

/// Puts `device` into the dynamic-init state.
///
/// While in this state the device may send and receive datagrams with the
/// unspecified source address, as required by DHCP.
pub fn start_dynamic_ipv4_addr(
    core_ctx: &SyncCtx,
    device: &DeviceId,
) -> Result<(), DynamicAddrError> {
    let mut core_ctx = core_ctx.lock();
    let state = &mut core_ctx
        .locked
        .devices
        .get_mut(device)
        .map_err(|NotFoundError| DynamicAddrError::DeviceNotFound)?
        .ip;
    if state.dynamic_init {
        return Err(DynamicAddrError::AlreadyInDynamicInit);
    }
    state.dynamic_init = true;
    Ok(())
}

/// Commits a dynamically obtained address and leaves the dynamic-init state.
///
/// On failure the device remains in the dynamic-init state.
pub fn commit_dynamic_ipv4_addr(
    core_ctx: &SyncCtx,
    device: &DeviceId,
    addr: Ipv4Addr,
    subnet_mask: Ipv4Addr,
    default_gateway: Option<Ipv4Addr>,
) -> Result<(), DynamicAddrError> {
    let mut core_ctx = core_ctx.lock();
    let max_addrs = core_ctx.locked.ipv4.config.max_addrs_per_device;
    let devices = &mut core_ctx.locked.devices;
    let dynamic_init = devices
        .get(device)
        .map_err(|NotFoundError| DynamicAddrError::DeviceNotFound)?
        .ip
        .dynamic_init;
    if !dynamic_init {
        return Err(DynamicAddrError::NotInDynamicInit);
    }
    add_ipv4_addr_entry(
        devices,
        max_addrs,
        device,
        Ipv4AddressEntry::new(addr, subnet_mask, default_gateway, AddrConfigMode::Dynamic),
    )?;
    devices
        .get_mut(device)
        .map_err(|NotFoundError| DynamicAddrError::DeviceNotFound)?
        .ip
        .dynamic_init = false;
    Ok(())
}

/// Leaves the dynamic-init state and releases every dynamically committed
/// address of `device`.
///
/// Fails with [`DynamicAddrError::NotInDynamicInit`] when there is nothing to
/// stop.
pub fn stop_dynamic_ipv4_addr<BC: BindingsContext>(
    core_ctx: &SyncCtx,
    bindings_ctx: &mut BC,
    device: &DeviceId,
) -> Result<(), DynamicAddrError> {
    let mut core_ctx = core_ctx.lock();
    let state = &mut core_ctx
        .locked
        .devices
        .get_mut(device)
        .map_err(|NotFoundError| DynamicAddrError::DeviceNotFound)?
        .ip;
    let was_init = core::mem::replace(&mut state.dynamic_init, false);
    let removed = del_ipv4_addr_entries_with(state, bindings_ctx, |entry| {
        entry.config_mode == AddrConfigMode::Dynamic
    });
    if !was_init && removed.is_empty() {
        return Err(DynamicAddrError::NotInDynamicInit);
    }
    debug!("stopped dynamic configuration on {:?}, released {:?}", device, removed);
    Ok(())
}

/// Gets every address configured on `device`.
pub fn get_all_ipv4_addrs(
    core_ctx: &SyncCtx,
    device: &DeviceId,
) -> Result<Vec<Ipv4Addr>, NotFoundError> {
    let core_ctx = core_ctx.lock();
    let state = core_ctx.locked.devices.get(device)?;
    Ok(state.ip.addrs.iter().map(|entry| entry.addr).collect())
}

/// Gets the full table entries of `device`.
pub fn get_ipv4_addr_entries(
    core_ctx: &SyncCtx,
    device: &DeviceId,
) -> Result<Vec<Ipv4AddressEntry>, NotFoundError> {
    let core_ctx = core_ctx.lock();
    Ok(core_ctx.locked.devices.get(device)?.ip.addrs.clone())
}

/// Gets the subnet mask configured with `addr`.
pub fn get_subnet_mask(core_ctx: &SyncCtx, addr: Ipv4Addr) -> Result<Ipv4Addr, NotFoundError> {
    let core_ctx = core_ctx.lock();
    find_addr_entry(&core_ctx.locked.devices, addr)
        .map(|(_, entry)| entry.subnet_mask)
        .ok_or(NotFoundError)
}

/// Gets the default gateway configured with `addr`.
pub fn get_default_gateway(
    core_ctx: &SyncCtx,
    addr: Ipv4Addr,
) -> Result<Option<Ipv4Addr>, NotFoundError> {
    let core_ctx = core_ctx.lock();
    find_addr_entry(&core_ctx.locked.devices, addr)
        .map(|(_, entry)| entry.default_gateway)
        .ok_or(NotFoundError)
}

/// Is `addr` configured on any device?
pub fn is_host_address(core_ctx: &SyncCtx, addr: Ipv4Addr) -> bool {
    let core_ctx = core_ctx.lock();
    crate::ip::device::is_host_address(&core_ctx.locked.devices, addr)
}

/// Is `addr` configured on `device`?
pub fn is_configured_on(core_ctx: &SyncCtx, device: &DeviceId, addr: Ipv4Addr) -> bool {
    let core_ctx = core_ctx.lock();
    core_ctx.locked.devices.get(device).map_or(false, |state| state.ip.has_addr(addr))
}

/// Reports that another host on the link of `device` claims `addr`.
///
/// A configured address is marked invalid and an
/// [`Ipv4DeviceEvent::AddressConflict`] is emitted. A link-local candidate
/// still being probed is abandoned in favor of a new one.
pub fn notify_address_conflict<BC: BindingsContext>(
    core_ctx: &SyncCtx,
    bindings_ctx: &mut BC,
    device: &DeviceId,
    addr: Ipv4Addr,
) -> Result<(), NotFoundError> {
    let mut core_ctx = core_ctx.lock();
    let state = &mut core_ctx.locked.devices.get_mut(device)?.ip;
    let configured = match state.find_addr_mut(addr) {
        Some(entry) => {
            entry.is_valid = false;
            bindings_ctx.on_event(Ipv4DeviceEvent::AddressConflict { device: *device, addr });
            true
        }
        None => false,
    };
    let candidate = link_local::handle_address_conflict(&mut core_ctx, bindings_ctx, device, addr);
    if configured || candidate {
        Ok(())
    } else {
        Err(NotFoundError)
    }
}

/// Joins `device` to the multicast `group`.
pub fn join_multicast_group(
    core_ctx: &SyncCtx,
    device: &DeviceId,
    group: Ipv4Addr,
) -> Result<(), AddIpAddrError> {
    if !is_multicast(group) {
        return Err(AddIpAddrError::InvalidAddr);
    }
    let mut core_ctx = core_ctx.lock();
    let state = &mut core_ctx
        .locked
        .devices
        .get_mut(device)
        .map_err(|NotFoundError| AddIpAddrError::DeviceNotFound)?
        .ip;
    if state.is_member_of(group) {
        return Err(AddIpAddrError::Exists);
    }
    state.multicast_groups.push(group);
    Ok(())
}

/// Removes `device` from the multicast `group`.
pub fn leave_multicast_group(
    core_ctx: &SyncCtx,
    device: &DeviceId,
    group: Ipv4Addr,
) -> Result<(), NotFoundError> {
    let mut core_ctx = core_ctx.lock();
    let state = &mut core_ctx.locked.devices.get_mut(device)?.ip;
    let index = state.multicast_groups.iter().position(|g| *g == group).ok_or(NotFoundError)?;
    let _: Ipv4Addr = state.multicast_groups.swap_remove(index);
    Ok(())
}

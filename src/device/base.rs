// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The device layer: device identifiers, per-device state and the link-layer
//! dispatcher.

use alloc::vec::Vec;
use core::fmt::{self, Debug, Display, Formatter};
use std::net::Ipv4Addr;

use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    context::{BindingsContext, SyncCtx},
    error::NotFoundError,
    ip::{device::state::Ipv4DeviceState, link_local},
};

/// An Ethernet MAC address.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Mac([u8; 6]);

impl Mac {
    /// The broadcast MAC address.
    pub const BROADCAST: Mac = Mac([0xFF; 6]);

    /// Constructs a new MAC address.
    pub const fn new(bytes: [u8; 6]) -> Mac {
        Mac(bytes)
    }

    /// Gets the bytes of the MAC address.
    pub fn bytes(&self) -> [u8; 6] {
        let Self(bytes) = self;
        *bytes
    }
}

impl Display for Mac {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let Self([b0, b1, b2, b3, b4, b5]) = self;
        write!(f, "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}", b0, b1, b2, b3, b4, b5)
    }
}

impl Debug for Mac {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// An opaque identifier for a device.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct DeviceId(usize);

impl DeviceId {
    #[cfg(test)]
    pub(crate) fn new_for_test(index: usize) -> DeviceId {
        DeviceId(index)
    }
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let Self(index) = self;
        write!(f, "Ethernet({})", index)
    }
}

impl Debug for DeviceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// The type of address used as the destination address in a device-layer
/// frame.
///
/// `FrameDestination` is used to implement RFC 1122 section 3.2.2, which
/// governs when to avoid sending an ICMP error message.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FrameDestination {
    /// A unicast address - one which is neither multicast nor broadcast.
    Unicast,
    /// A multicast address.
    Multicast,
    /// A broadcast address.
    Broadcast,
}

impl FrameDestination {
    /// Is this `FrameDestination::Multicast`?
    pub(crate) fn is_multicast(self) -> bool {
        self == FrameDestination::Multicast
    }

    /// Is this `FrameDestination::Broadcast`?
    pub(crate) fn is_broadcast(self) -> bool {
        self == FrameDestination::Broadcast
    }
}

/// The link-layer destination of an outgoing IPv4 datagram.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LinkDestination {
    /// The frame is sent to the hardware address of this on-link neighbor,
    /// which the link layer resolves.
    Unicast(Ipv4Addr),
    /// The frame is sent to the link broadcast address.
    Broadcast,
    /// The frame is sent to the hardware address mapped from this IPv4
    /// multicast group.
    Multicast(Ipv4Addr),
}

/// An error encountered when sending a frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeviceSendFrameError {
    /// The device is not ready to send frames.
    #[error("device not ready")]
    DeviceNotReady,
    /// The device has no buffer space for the frame.
    #[error("no buffer space")]
    NoBuffers,
}

/// An object which can dispatch link-layer frames to device drivers.
pub trait DeviceLayerEventDispatcher {
    /// Send a fully formed IPv4 datagram to a device driver.
    ///
    /// The driver is responsible for link-layer framing and for resolving
    /// `dst` to a hardware address.
    fn send_ipv4_frame(
        &mut self,
        device: &DeviceId,
        dst: LinkDestination,
        frame: Vec<u8>,
    ) -> Result<(), DeviceSendFrameError>;
}

/// The state associated with a single device.
pub(crate) struct DeviceState {
    pub(crate) mac: Mac,
    pub(crate) mtu: u32,
    pub(crate) enabled: bool,
    pub(crate) ip: Ipv4DeviceState,
}

/// The collection of devices known to the stack.
#[derive(Default)]
pub(crate) struct Devices {
    devices: Vec<DeviceState>,
}

impl Devices {
    pub(crate) fn add(&mut self, mac: Mac, mtu: u32) -> DeviceId {
        let id = DeviceId(self.devices.len());
        self.devices.push(DeviceState { mac, mtu, enabled: false, ip: Ipv4DeviceState::default() });
        id
    }

    pub(crate) fn get(&self, device: &DeviceId) -> Result<&DeviceState, NotFoundError> {
        let DeviceId(index) = device;
        self.devices.get(*index).ok_or(NotFoundError)
    }

    pub(crate) fn get_mut(&mut self, device: &DeviceId) -> Result<&mut DeviceState, NotFoundError> {
        let DeviceId(index) = device;
        self.devices.get_mut(*index).ok_or(NotFoundError)
    }

    /// Iterates over every device and its state.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (DeviceId, &DeviceState)> + '_ {
        self.devices.iter().enumerate().map(|(i, state)| (DeviceId(i), state))
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (DeviceId, &mut DeviceState)> + '_ {
        self.devices.iter_mut().enumerate().map(|(i, state)| (DeviceId(i), state))
    }
}

/// Adds a new Ethernet device to the stack.
///
/// The device starts out disabled; call [`set_device_enabled`] once the link
/// is up.
pub fn add_ethernet_device(core_ctx: &SyncCtx, mac: Mac, mtu: u32) -> DeviceId {
    let mut core_ctx = core_ctx.lock();
    let id = core_ctx.locked.devices.add(mac, mtu);
    debug!("adding Ethernet device {:?} with MTU {}", id, mtu);
    id
}

/// Enables or disables a device.
///
/// Disabling a device that is running link-local negotiation stops the
/// negotiation and reports its failure.
pub fn set_device_enabled<BC: BindingsContext>(
    core_ctx: &SyncCtx,
    bindings_ctx: &mut BC,
    device: &DeviceId,
    enabled: bool,
) -> Result<(), NotFoundError> {
    let mut core_ctx = core_ctx.lock();
    let state = core_ctx.locked.devices.get_mut(device)?;
    if state.enabled == enabled {
        return Ok(());
    }
    state.enabled = enabled;
    trace!("set_device_enabled: {:?} enabled={}", device, enabled);
    if !enabled {
        link_local::handle_link_down(&mut core_ctx, bindings_ctx, device);
    }
    Ok(())
}

/// Gets the hardware address of a device.
pub fn get_device_mac(core_ctx: &SyncCtx, device: &DeviceId) -> Result<Mac, NotFoundError> {
    let core_ctx = core_ctx.lock();
    core_ctx.locked.devices.get(device).map(|state| state.mac)
}

/// Gets the MTU of a device.
pub fn get_device_mtu(core_ctx: &SyncCtx, device: &DeviceId) -> Result<u32, NotFoundError> {
    let core_ctx = core_ctx.lock();
    core_ctx.locked.devices.get(device).map(|state| state.mtu)
}

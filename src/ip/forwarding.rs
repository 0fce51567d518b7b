// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Destination classification and next-hop selection.

use std::net::Ipv4Addr;

use tracing::trace;

use crate::{
    context::SyncCtx,
    device::{DeviceId, Devices, LinkDestination},
    error::NextHopUnreachableError,
    ip::{
        address::{is_link_local, is_loopback, is_multicast, LIMITED_BROADCAST, LINK_LOCAL_MASK},
        device::is_host_address,
    },
};

/// Where an outgoing datagram is headed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Ipv4Destination {
    /// This host; the datagram never reaches the link.
    LocalHost,
    /// Every host on the link.
    Broadcast,
    /// The members of a multicast group.
    Multicast,
    /// A neighbor on the egress device's subnet.
    LocalNet,
    /// A remote host, reached through this gateway.
    DefaultGateway(Ipv4Addr),
}

impl Ipv4Destination {
    /// The link-layer destination for a datagram to `dst`, or `None` for
    /// datagrams that stay on this host.
    pub(crate) fn link_destination(self, dst: Ipv4Addr) -> Option<LinkDestination> {
        match self {
            Ipv4Destination::LocalHost => None,
            Ipv4Destination::Broadcast => Some(LinkDestination::Broadcast),
            Ipv4Destination::Multicast => Some(LinkDestination::Multicast(dst)),
            Ipv4Destination::LocalNet => Some(LinkDestination::Unicast(dst)),
            Ipv4Destination::DefaultGateway(gateway) => Some(LinkDestination::Unicast(gateway)),
        }
    }
}

/// Classifies `dst` for a datagram from `src` leaving through `device`.
///
/// Rules are applied in order: an address of this host or a loopback
/// endpoint stays local; link-local traffic is on-link; the limited
/// broadcast and multicast groups are sent as such; a destination on one of
/// `device`'s subnets is on-link (or a subnet broadcast); anything else goes
/// through the default gateway configured with `src`, or with any address of
/// `device` when `src` has none.
pub(crate) fn classify(
    devices: &Devices,
    device: &DeviceId,
    src: Ipv4Addr,
    dst: Ipv4Addr,
) -> Result<Ipv4Destination, NextHopUnreachableError> {
    if is_host_address(devices, dst) || is_loopback(src) || is_loopback(dst) {
        return Ok(Ipv4Destination::LocalHost);
    }
    if is_link_local(src) || is_link_local(dst) {
        let host_mask = !u32::from(LINK_LOCAL_MASK);
        return Ok(if u32::from(dst) & host_mask == host_mask {
            Ipv4Destination::Broadcast
        } else {
            Ipv4Destination::LocalNet
        });
    }
    if dst == LIMITED_BROADCAST {
        return Ok(Ipv4Destination::Broadcast);
    }
    if is_multicast(dst) {
        return Ok(Ipv4Destination::Multicast);
    }

    let addrs = devices.get(device).map(|state| state.ip.addrs.as_slice()).unwrap_or(&[]);
    if let Some(entry) = addrs.iter().find(|entry| entry.subnet_contains(dst)) {
        return Ok(if entry.is_subnet_broadcast(dst) {
            Ipv4Destination::Broadcast
        } else {
            Ipv4Destination::LocalNet
        });
    }

    addrs
        .iter()
        .find(|entry| entry.addr == src)
        .and_then(|entry| entry.default_gateway)
        .or_else(|| addrs.iter().find_map(|entry| entry.default_gateway))
        .map(Ipv4Destination::DefaultGateway)
        .ok_or_else(|| {
            trace!("no route from {} to {} on {:?}", src, dst, device);
            NextHopUnreachableError
        })
}

/// Classifies the destination of a datagram from `src` to `dst` leaving
/// through `device`.
pub fn classify_destination(
    core_ctx: &SyncCtx,
    device: &DeviceId,
    src: Ipv4Addr,
    dst: Ipv4Addr,
) -> Result<Ipv4Destination, NextHopUnreachableError> {
    let core_ctx = core_ctx.lock();
    classify(&core_ctx.locked.devices, device, src, dst)
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::testutil::{FakeCtx, FakeCtxBuilder, FAKE_CONFIG_V4};

    const LOCAL: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
    const GATEWAY: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);
    const MASK_24: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

    fn new_ctx(gateway: Option<Ipv4Addr>) -> (FakeCtx, DeviceId) {
        let mut builder = FakeCtxBuilder::default();
        let device = builder.add_device(FAKE_CONFIG_V4.local_mac);
        builder.add_device_ip(device, LOCAL, MASK_24, gateway);
        let (ctx, devices) = builder.build();
        (ctx, devices[device])
    }

    #[test_case(LOCAL, Ok(Ipv4Destination::LocalHost); "own address")]
    #[test_case(Ipv4Addr::new(127, 0, 0, 1), Ok(Ipv4Destination::LocalHost); "loopback")]
    #[test_case(Ipv4Addr::new(192, 168, 1, 255), Ok(Ipv4Destination::Broadcast); "subnet broadcast")]
    #[test_case(Ipv4Addr::BROADCAST, Ok(Ipv4Destination::Broadcast); "limited broadcast")]
    #[test_case(Ipv4Addr::new(192, 168, 1, 50), Ok(Ipv4Destination::LocalNet); "on subnet")]
    #[test_case(Ipv4Addr::new(224, 0, 0, 251), Ok(Ipv4Destination::Multicast); "multicast")]
    #[test_case(Ipv4Addr::new(169, 254, 3, 4), Ok(Ipv4Destination::LocalNet); "link-local")]
    #[test_case(Ipv4Addr::new(169, 254, 255, 255), Ok(Ipv4Destination::Broadcast);
        "link-local broadcast")]
    #[test_case(Ipv4Addr::new(8, 8, 8, 8), Ok(Ipv4Destination::DefaultGateway(GATEWAY));
        "remote via gateway")]
    fn classify_with_gateway(
        dst: Ipv4Addr,
        expected: Result<Ipv4Destination, NextHopUnreachableError>,
    ) {
        let (FakeCtx { core_ctx, bindings_ctx: _ }, device) = new_ctx(Some(GATEWAY));
        assert_eq!(classify_destination(&core_ctx, &device, LOCAL, dst), expected);
    }

    #[test]
    fn remote_without_gateway_is_unreachable() {
        let (FakeCtx { core_ctx, bindings_ctx: _ }, device) = new_ctx(None);
        assert_eq!(
            classify_destination(&core_ctx, &device, LOCAL, Ipv4Addr::new(10, 0, 0, 1)),
            Err(NextHopUnreachableError)
        );
        // On-link destinations need no gateway.
        assert_eq!(
            classify_destination(&core_ctx, &device, LOCAL, Ipv4Addr::new(192, 168, 1, 50)),
            Ok(Ipv4Destination::LocalNet)
        );
    }

    #[test]
    fn link_destinations() {
        let dst = Ipv4Addr::new(192, 168, 1, 50);
        assert_eq!(Ipv4Destination::LocalHost.link_destination(dst), None);
        assert_eq!(
            Ipv4Destination::LocalNet.link_destination(dst),
            Some(LinkDestination::Unicast(dst))
        );
        assert_eq!(
            Ipv4Destination::DefaultGateway(GATEWAY).link_destination(dst),
            Some(LinkDestination::Unicast(GATEWAY))
        );
        assert_eq!(
            Ipv4Destination::Multicast.link_destination(dst),
            Some(LinkDestination::Multicast(dst))
        );
    }
}

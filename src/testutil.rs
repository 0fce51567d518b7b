// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Testing-related utilities.

use alloc::{sync::Arc, vec::Vec};
use std::{collections::HashMap, net::Ipv4Addr};

use parking_lot::Mutex;
use rand::{CryptoRng, RngCore, SeedableRng};
use rand_xorshift::XorShiftRng;
use tracing::Subscriber;
use tracing_subscriber::{
    fmt::{
        format::{self, FormatEvent, FormatFields},
        FmtContext,
    },
    registry::LookupSpan,
};

use crate::{
    context::{testutil::FakeFrameCtx, SyncCtx},
    device::{
        self, arp::ArpDispatcher, DeviceId, DeviceLayerEventDispatcher, DeviceSendFrameError,
        LinkDestination, Mac,
    },
    ip::{
        self,
        device::Ipv4DeviceEvent,
        icmp::{IcmpErrorDispatcher, Icmpv4Error},
        options::Ipv4TimestampContext,
    },
    state::StackStateBuilder,
    time::TimerId,
    transport::{ReceivedIpv4Meta, TransportDispatcher, TransportReceiveError},
};

/// A wrapper which implements `RngCore` and `CryptoRng` for any `RngCore`.
///
/// # Security
///
/// This is obviously insecure. Don't use it except in testing!
#[derive(Clone, Debug)]
pub(crate) struct FakeCryptoRng<R>(Arc<Mutex<R>>);

impl Default for FakeCryptoRng<XorShiftRng> {
    fn default() -> FakeCryptoRng<XorShiftRng> {
        FakeCryptoRng::new_xorshift(12957992561116578403)
    }
}

impl FakeCryptoRng<XorShiftRng> {
    /// Creates a new [`FakeCryptoRng<XorShiftRng>`] from a seed.
    pub(crate) fn new_xorshift(seed: u128) -> FakeCryptoRng<XorShiftRng> {
        Self(Arc::new(Mutex::new(new_rng(seed))))
    }
}

impl<R: RngCore> RngCore for FakeCryptoRng<R> {
    fn next_u32(&mut self) -> u32 {
        self.0.lock().next_u32()
    }
    fn next_u64(&mut self) -> u64 {
        self.0.lock().next_u64()
    }
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.0.lock().fill_bytes(dest)
    }
    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.0.lock().try_fill_bytes(dest)
    }
}

impl<R: RngCore> CryptoRng for FakeCryptoRng<R> {}

impl<R: SeedableRng> SeedableRng for FakeCryptoRng<R> {
    type Seed = R::Seed;

    fn from_seed(seed: Self::Seed) -> Self {
        Self(Arc::new(Mutex::new(R::from_seed(seed))))
    }
}

/// Create a new deterministic RNG from a seed.
pub(crate) fn new_rng(mut seed: u128) -> XorShiftRng {
    if seed == 0 {
        // XorShiftRng can't take 0 seeds
        seed = 1;
    }
    XorShiftRng::from_seed(seed.to_ne_bytes())
}

struct SimpleFormatter;

impl<S, N> FormatEvent<S, N> for SimpleFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Install a logger for tests.
///
/// Call this method at the beginning of the test for which logging is desired.
/// This function sets global program state, so all tests that run after this
/// function is called will use the logger.
pub(crate) fn set_logger_for_test() {
    tracing::subscriber::set_global_default(
        tracing_subscriber::fmt()
            .event_format(SimpleFormatter)
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .finish(),
    )
    .unwrap_or({
        // Ignore errors caused by some other test invocation having already set
        // the global default subscriber.
    })
}

/// Everything the fake bindings record or answer with.
#[derive(Default)]
pub(crate) struct FakeBindingsCtxState {
    /// Frames handed to the link layer.
    pub(crate) frames: FakeFrameCtx<(DeviceId, LinkDestination)>,
    /// Datagrams handed to the transport sinks.
    pub(crate) delivered: Vec<(DeviceId, ReceivedIpv4Meta, Vec<u8>)>,
    /// When set, the transport sinks refuse every datagram with this error.
    pub(crate) transport_error: Option<TransportReceiveError>,
    pub(crate) closed_connections: Vec<Ipv4Addr>,
    pub(crate) icmp_errors: Vec<(DeviceId, Ipv4Addr, Ipv4Addr, Icmpv4Error, Vec<u8>)>,
    /// The fake ARP neighbor cache.
    pub(crate) arp_neighbors: HashMap<(DeviceId, Ipv4Addr), Mac>,
    pub(crate) arp_probes: Vec<(DeviceId, Ipv4Addr)>,
    pub(crate) arp_announcements: Vec<(DeviceId, Ipv4Addr)>,
    /// The value returned for the IP timestamp option clock.
    pub(crate) timestamp: u32,
}

/// The fake bindings context used by the tests in this crate.
pub(crate) type FakeBindingsCtx = crate::context::testutil::FakeBindingsCtx<
    TimerId,
    Ipv4DeviceEvent<DeviceId>,
    FakeBindingsCtxState,
>;

impl DeviceLayerEventDispatcher for FakeBindingsCtx {
    fn send_ipv4_frame(
        &mut self,
        device: &DeviceId,
        dst: LinkDestination,
        frame: Vec<u8>,
    ) -> Result<(), DeviceSendFrameError> {
        let frames = &mut self.state_mut().frames;
        let meta = (*device, dst);
        if frames.should_error_for_frame(&meta) {
            return Err(DeviceSendFrameError::NoBuffers);
        }
        frames.push(meta, frame);
        Ok(())
    }
}

impl ArpDispatcher for FakeBindingsCtx {
    fn lookup(&mut self, device: &DeviceId, addr: Ipv4Addr) -> Option<Mac> {
        self.state().arp_neighbors.get(&(*device, addr)).copied()
    }

    fn send_probe(&mut self, device: &DeviceId, addr: Ipv4Addr) {
        self.state_mut().arp_probes.push((*device, addr))
    }

    fn send_announcement(&mut self, device: &DeviceId, addr: Ipv4Addr) {
        self.state_mut().arp_announcements.push((*device, addr))
    }
}

impl TransportDispatcher for FakeBindingsCtx {
    fn receive_ipv4_packet(
        &mut self,
        device: &DeviceId,
        meta: &ReceivedIpv4Meta,
        body: &[u8],
    ) -> Result<(), TransportReceiveError> {
        let state = self.state_mut();
        if let Some(err) = state.transport_error {
            return Err(err);
        }
        state.delivered.push((*device, meta.clone(), body.to_vec()));
        Ok(())
    }

    fn close_connections_bound_to(&mut self, addr: Ipv4Addr) {
        self.state_mut().closed_connections.push(addr)
    }
}

impl IcmpErrorDispatcher for FakeBindingsCtx {
    fn send_icmpv4_error(
        &mut self,
        device: &DeviceId,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        error: Icmpv4Error,
        original: &[u8],
    ) {
        self.state_mut().icmp_errors.push((*device, src_ip, dst_ip, error, original.to_vec()))
    }
}

impl Ipv4TimestampContext for FakeBindingsCtx {
    fn ipv4_timestamp(&mut self) -> u32 {
        self.state().timestamp
    }
}

/// A fake stack: the core context and the fake bindings it talks to.
pub(crate) struct FakeCtx {
    pub(crate) core_ctx: SyncCtx,
    pub(crate) bindings_ctx: FakeBindingsCtx,
}

/// A configuration for a simple network.
///
/// `FakeEventDispatcherConfig` describes a simple network with two IPv4
/// hosts - one remote and one local - both on the same Ethernet network.
pub(crate) struct FakeEventDispatcherConfig {
    /// The IPv4 address of our local host.
    pub(crate) local_ip: Ipv4Addr,
    /// The MAC address of our local host.
    pub(crate) local_mac: Mac,
    /// The IPv4 address of the remote host.
    pub(crate) remote_ip: Ipv4Addr,
    /// The MAC address of the remote host.
    pub(crate) remote_mac: Mac,
    /// The mask of the subnet shared by the two hosts.
    pub(crate) subnet_mask: Ipv4Addr,
}

/// A `FakeEventDispatcherConfig` with reasonable values for an IPv4 network.
pub(crate) const FAKE_CONFIG_V4: FakeEventDispatcherConfig = FakeEventDispatcherConfig {
    local_ip: Ipv4Addr::new(192, 168, 0, 1),
    local_mac: Mac::new([0, 1, 2, 3, 4, 5]),
    remote_ip: Ipv4Addr::new(192, 168, 0, 2),
    remote_mac: Mac::new([6, 7, 8, 9, 10, 11]),
    subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
};

const DEFAULT_MTU: u32 = 1500;

/// A builder for [`FakeCtx`]s.
///
/// Devices are added with [`add_device`] and referred to by the index it
/// returns until [`build`] turns them into [`DeviceId`]s. Every device is
/// enabled when built.
///
/// [`add_device`]: FakeCtxBuilder::add_device
/// [`build`]: FakeCtxBuilder::build
#[derive(Default)]
pub(crate) struct FakeCtxBuilder {
    stack_builder: StackStateBuilder,
    devices: Vec<Mac>,
    addrs: Vec<(usize, Ipv4Addr, Ipv4Addr, Option<Ipv4Addr>)>,
}

impl FakeCtxBuilder {
    /// Gets the stack configuration the context will be built with.
    pub(crate) fn stack_builder(&mut self) -> &mut StackStateBuilder {
        &mut self.stack_builder
    }

    /// Adds an Ethernet device with a 1500-byte MTU, returning its index.
    pub(crate) fn add_device(&mut self, mac: Mac) -> usize {
        let idx = self.devices.len();
        self.devices.push(mac);
        idx
    }

    /// Statically configures `addr` on the device at index `device`.
    pub(crate) fn add_device_ip(
        &mut self,
        device: usize,
        addr: Ipv4Addr,
        subnet_mask: Ipv4Addr,
        default_gateway: Option<Ipv4Addr>,
    ) {
        assert!(device < self.devices.len(), "no device with index {}", device);
        self.addrs.push((device, addr, subnet_mask, default_gateway));
    }

    /// Builds the context, returning the devices in the order they were added.
    pub(crate) fn build(self) -> (FakeCtx, Vec<DeviceId>) {
        let FakeCtxBuilder { stack_builder, devices, addrs } = self;
        let core_ctx = SyncCtx::new(stack_builder);
        let mut bindings_ctx = FakeBindingsCtx::default();
        let ids = devices
            .into_iter()
            .map(|mac| {
                let id = device::add_ethernet_device(&core_ctx, mac, DEFAULT_MTU);
                device::set_device_enabled(&core_ctx, &mut bindings_ctx, &id, true).unwrap();
                id
            })
            .collect::<Vec<_>>();
        for (device, addr, subnet_mask, default_gateway) in addrs {
            ip::add_ipv4_addr_static(&core_ctx, &ids[device], addr, subnet_mask, default_gateway)
                .unwrap();
        }
        (FakeCtx { core_ctx, bindings_ctx }, ids)
    }
}

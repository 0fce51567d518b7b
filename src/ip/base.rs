// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The IPv4 layer: validation and delivery of received datagrams, and the
//! transmit pipeline.

use alloc::vec::Vec;
use core::num::NonZeroU8;
use std::net::Ipv4Addr;

use bitflags::bitflags;
use static_assertions::const_assert_eq;
use tracing::{debug, trace};

use crate::{
    context::{BindingsContext, CoreCtx, CounterContext, SyncCtx},
    counters::Counter,
    device::{DeviceId, DeviceState, Devices, FrameDestination},
    error::{InvalidSendArgument, IpSendError, NotFoundError, NotSupportedError},
    ip::{
        address::{
            is_class_e, is_classful_broadcast, is_link_local, is_link_local_host, is_loopback,
            is_multicast, LIMITED_BROADCAST, LINK_LOCAL_MASK, THIS_HOST,
        },
        device::{find_addr_entry, is_host_address},
        forwarding::{classify, Ipv4Destination},
        header::{
            checksum_is_valid, rewrite_id, Ipv4Flags, Ipv4Header, Ipv4HeaderBuilder, Ipv4Proto,
            FLAGS_FRAGMENT_OFFSET, FRAGMENT_BLOCK_SIZE, IPV4_MAX_TOTAL_LEN, IPV4_MIN_HDR_LEN,
            IPV4_VERSION, TOS_MBZ, TOTAL_LEN_OFFSET,
        },
        icmp::{send_icmpv4_error, Icmpv4ErrorKind},
        link_local::LinkLocalConfig,
        options::{
            process_received_options, serialize_tx_options, Ipv4TimestampContext, OptionError,
            TxOption, MAX_OPTIONS_LEN,
        },
        reassembly::{
            ExpiredFragments, FragmentProcessingState, FragmentTimerId, IpLayerFragmentCache,
            ReassembledDatagram, ReassemblyTimeout,
        },
    },
    state::LockedState,
    transport::{ReceivedIpv4Meta, TransportReceiveError},
};

// Options are padded to whole header words.
const_assert_eq!(MAX_OPTIONS_LEN % 4, 0);

const LOOPBACK_HOST_MASK: u32 = 0x00FF_FFFF;

/// The default TTLs of outgoing datagrams.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct HopLimits {
    /// The TTL of unicast and broadcast datagrams.
    pub unicast: NonZeroU8,
    /// The TTL of multicast datagrams.
    pub multicast: NonZeroU8,
}

const fn non_zero(ttl: u8) -> NonZeroU8 {
    match NonZeroU8::new(ttl) {
        Some(ttl) => ttl,
        None => panic!("hop limit must be non-zero"),
    }
}

/// The default [`HopLimits`]: 128 for unicast, 1 for multicast.
pub(crate) const DEFAULT_HOP_LIMITS: HopLimits =
    HopLimits { unicast: non_zero(128), multicast: non_zero(1) };

/// Runtime configuration of the IPv4 layer.
pub(crate) struct Ipv4Config {
    pub(crate) reassembly_timeout: ReassemblyTimeout,
    pub(crate) hop_limits: HopLimits,
    pub(crate) default_tos: u8,
    pub(crate) max_addrs_per_device: usize,
    pub(crate) link_local: LinkLocalConfig,
}

/// The IPv4 state guarded by the stack lock.
pub(crate) struct Ipv4State {
    pub(crate) config: Ipv4Config,
    pub(crate) fragment_cache: IpLayerFragmentCache,
    next_packet_id: u16,
}

impl Ipv4State {
    pub(crate) fn new(config: Ipv4Config, fragment_cache_threshold: usize) -> Ipv4State {
        Ipv4State {
            config,
            fragment_cache: IpLayerFragmentCache::new(fragment_cache_threshold),
            next_packet_id: 0,
        }
    }

    fn next_packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        self.next_packet_id = id.wrapping_add(1);
        id
    }
}

/// IPv4 layer counters.
#[derive(Default)]
pub struct Ipv4Counters {
    /// Count of incoming IPv4 packets received by the stack.
    pub receive_ip_packet: Counter,
    /// Count of incoming packets dropped for a version other than 4.
    pub invalid_version: Counter,
    /// Count of incoming packets dropped for a bad header length.
    pub invalid_header_len: Counter,
    /// Count of incoming packets dropped for a bad total length.
    pub invalid_total_len: Counter,
    /// Count of incoming packets dropped for a bad header checksum.
    pub invalid_checksum: Counter,
    /// Count of incoming packets dropped for bad flags.
    pub invalid_flags: Counter,
    /// Count of incoming fragments dropped because their size is not a
    /// multiple of the fragment block size.
    pub invalid_fragment_size: Counter,
    /// Count of incoming packets dropped for carrying an unsupported protocol.
    pub unsupported_protocol: Counter,
    /// Count of incoming packets dropped for an invalid source address.
    pub invalid_source: Counter,
    /// Count of incoming packets dropped for a destination that is not this
    /// host.
    pub invalid_destination: Counter,
    /// Count of incoming packets dropped for malformed options.
    pub invalid_options: Counter,
    /// Count of incoming fragments.
    pub receive_fragment: Counter,
    /// Count of incoming fragments dropped as duplicates.
    pub duplicate_fragment: Counter,
    /// Count of incoming fragments rejected by reassembly.
    pub fragment_reassembly_error: Counter,
    /// Count of incoming fragments dropped because the fragment cache is full.
    pub fragment_cache_full: Counter,
    /// Count of fragmented datagrams discarded by their reassembly timer.
    pub reassembly_timeout: Counter,
    /// Count of datagrams reassembled from fragments.
    pub reassembled: Counter,
    /// Count of datagrams delivered to a transport sink.
    pub deliver: Counter,
    /// Count of datagrams refused by their transport sink.
    pub deliver_error: Counter,
    /// Count of outgoing datagrams sent.
    pub send_ip_packet: Counter,
    /// Count of outgoing datagrams rejected for an invalid argument or device.
    pub send_invalid_argument: Counter,
    /// Count of outgoing datagrams with no next hop.
    pub no_route_to_host: Counter,
    /// Count of outgoing datagrams too large to send unfragmented.
    pub mtu_exceeded: Counter,
    /// Count of outgoing datagrams refused by the link layer.
    pub send_link_error: Counter,
    /// Count of datagrams handed back for retransmission.
    pub retransmit: Counter,
    /// Count of ICMP error messages requested.
    pub send_icmp_error: Counter,
}

impl CounterContext<Ipv4Counters> for CoreCtx<'_> {
    fn with_counters<O, F: FnOnce(&Ipv4Counters) -> O>(&self, cb: F) -> O {
        cb(self.state.ipv4_counters())
    }
}

bitflags! {
    /// Flags of an outgoing datagram.
    #[derive(Default)]
    pub struct TxFlags: u16 {
        /// Forbid fragmentation of the datagram along its path.
        const DONT_FRAGMENT = 0x4000;
    }
}

/// The parameters of an outgoing datagram.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SendIpv4Params {
    /// The egress device. When `None`, the device on which `src_ip` is
    /// configured is used.
    pub device: Option<DeviceId>,
    /// The source address.
    pub src_ip: Ipv4Addr,
    /// The destination address.
    pub dst_ip: Ipv4Addr,
    /// The upper-layer protocol.
    pub proto: Ipv4Proto,
    /// The type of service, or `None` for the configured default.
    pub tos: Option<u8>,
    /// The TTL, or `None` for the configured default.
    pub ttl: Option<NonZeroU8>,
    /// The flags.
    pub flags: TxFlags,
    /// The options, encoded in order.
    pub options: Vec<TxOption>,
}

impl SendIpv4Params {
    /// Creates parameters with default TOS, TTL and flags and no options.
    pub fn new(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, proto: Ipv4Proto) -> SendIpv4Params {
        SendIpv4Params {
            device: None,
            src_ip,
            dst_ip,
            proto,
            tos: None,
            ttl: None,
            flags: TxFlags::empty(),
            options: Vec::new(),
        }
    }
}

/// Sets the reassembly timeout.
///
/// The new value applies from the next fragment received for any datagram.
pub fn set_reassembly_timeout(core_ctx: &SyncCtx, timeout: ReassemblyTimeout) {
    let mut core_ctx = core_ctx.lock();
    debug!("setting reassembly timeout to {:?}", timeout.get());
    core_ctx.locked.ipv4.config.reassembly_timeout = timeout;
}

fn is_valid_loopback_host(addr: Ipv4Addr) -> bool {
    let host = u32::from(addr) & LOOPBACK_HOST_MASK;
    is_loopback(addr) && host != 0 && host != LOOPBACK_HOST_MASK
}

fn is_link_local_broadcast(addr: Ipv4Addr) -> bool {
    let host_mask = !u32::from(LINK_LOCAL_MASK);
    is_link_local(addr) && u32::from(addr) & host_mask == host_mask
}

/// Why a received datagram was dropped.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum DropReason {
    Version,
    HeaderLen,
    TotalLen,
    Checksum,
    Flags,
    FragmentSize,
    Protocol,
    Source,
    Destination,
    Options { pointer: u8 },
}

impl DropReason {
    fn counter(self, counters: &Ipv4Counters) -> &Counter {
        match self {
            DropReason::Version => &counters.invalid_version,
            DropReason::HeaderLen => &counters.invalid_header_len,
            DropReason::TotalLen => &counters.invalid_total_len,
            DropReason::Checksum => &counters.invalid_checksum,
            DropReason::Flags => &counters.invalid_flags,
            DropReason::FragmentSize => &counters.invalid_fragment_size,
            DropReason::Protocol => &counters.unsupported_protocol,
            DropReason::Source => &counters.invalid_source,
            DropReason::Destination => &counters.invalid_destination,
            DropReason::Options { pointer: _ } => &counters.invalid_options,
        }
    }

    /// The ICMP error owed to the sender, if any.
    fn icmp_error(self) -> Option<Icmpv4ErrorKind> {
        match self {
            DropReason::Version
            | DropReason::HeaderLen
            | DropReason::Checksum
            | DropReason::Source
            | DropReason::Destination => None,
            DropReason::TotalLen | DropReason::FragmentSize => {
                Some(Icmpv4ErrorKind::ParameterProblem { pointer: TOTAL_LEN_OFFSET as u8 })
            }
            DropReason::Flags => {
                Some(Icmpv4ErrorKind::ParameterProblem { pointer: FLAGS_FRAGMENT_OFFSET as u8 })
            }
            DropReason::Protocol => Some(Icmpv4ErrorKind::ProtocolUnreachable),
            DropReason::Options { pointer } => {
                Some(Icmpv4ErrorKind::ParameterProblem { pointer })
            }
        }
    }
}

/// A received datagram rejected by validation.
#[derive(Debug, Eq, PartialEq)]
struct Discard {
    reason: DropReason,
    /// The header, if its checksum was verified.
    header: Option<Ipv4Header>,
}

impl Discard {
    fn silent(reason: DropReason) -> Discard {
        Discard { reason, header: None }
    }
}

/// Can a datagram from `src` have been sent by a single host?
fn is_valid_source(devices: &Devices, frame_dst: Option<FrameDestination>, src: Ipv4Addr) -> bool {
    let [first, ..] = src.octets();
    // Only hosts that do not know their own address send from "this
    // network", and they are never answered by address.
    if first == 0
        || src == LIMITED_BROADCAST
        || is_multicast(src)
        || is_class_e(src)
        || is_classful_broadcast(src)
    {
        return false;
    }
    if is_loopback(src) {
        // Loopback traffic never arrives from the link.
        return frame_dst.is_none() && is_valid_loopback_host(src);
    }
    if is_link_local(src) {
        return is_link_local_host(src);
    }
    !devices
        .iter()
        .any(|(_, state)| state.ip.addrs.iter().any(|entry| entry.is_subnet_broadcast(src)))
}

/// Is a datagram to `dst` received on `device` meant for this host?
fn is_acceptable_destination(
    devices: &Devices,
    device: &DeviceState,
    frame_dst: Option<FrameDestination>,
    dst: Ipv4Addr,
) -> bool {
    if is_host_address(devices, dst) {
        return true;
    }
    if is_multicast(dst) {
        return device.ip.is_member_of(dst);
    }
    if is_loopback(dst) {
        return frame_dst.is_none();
    }
    if dst == LIMITED_BROADCAST
        || is_link_local_broadcast(dst)
        || device.ip.addrs.iter().any(|entry| entry.is_subnet_broadcast(dst))
    {
        return frame_dst.map_or(false, FrameDestination::is_broadcast);
    }
    dst == THIS_HOST && device.ip.dynamic_init
}

/// Validates the header of a datagram received on `device`.
///
/// On success, `buffer` is truncated to the datagram's total length.
fn validate_received_header(
    devices: &Devices,
    device: &DeviceState,
    frame_dst: Option<FrameDestination>,
    buffer: &mut Vec<u8>,
) -> Result<Ipv4Header, Discard> {
    let header = Ipv4Header::parse(buffer).ok_or(Discard::silent(DropReason::HeaderLen))?;
    if header.version != IPV4_VERSION {
        return Err(Discard::silent(DropReason::Version));
    }
    let header_len = header.header_len;
    if header_len < IPV4_MIN_HDR_LEN || header_len > buffer.len() {
        return Err(Discard::silent(DropReason::HeaderLen));
    }

    // The checksum is order independent; verify it before trusting any other
    // field enough to report an error about it.
    let checksum_ok = checksum_is_valid(&buffer[..header_len]);
    let total_len = usize::from(header.total_len);
    if total_len < header_len || total_len > buffer.len() {
        return Err(Discard { reason: DropReason::TotalLen, header: checksum_ok.then_some(header) });
    }
    // Anything past the total length is link-layer padding.
    buffer.truncate(total_len);
    if !checksum_ok {
        return Err(Discard::silent(DropReason::Checksum));
    }

    let reason = if header.flags.contains(Ipv4Flags::RESERVED)
        || (header.dont_fragment() && header.is_fragment())
    {
        Some(DropReason::Flags)
    } else if header.more_fragments() && (total_len - header_len) % FRAGMENT_BLOCK_SIZE != 0 {
        Some(DropReason::FragmentSize)
    } else if !header.proto.is_supported() {
        Some(DropReason::Protocol)
    } else if !is_valid_source(devices, frame_dst, header.src) {
        Some(DropReason::Source)
    } else if !is_acceptable_destination(devices, device, frame_dst, header.dst) {
        Some(DropReason::Destination)
    } else {
        None
    };
    match reason {
        Some(reason) => Err(Discard { reason, header: Some(header) }),
        None => Ok(header),
    }
}

/// Processes a copy of the options of `header_bytes`.
fn received_options<BC: Ipv4TimestampContext>(
    bindings_ctx: &mut BC,
    header_bytes: &[u8],
    local_addr: Ipv4Addr,
) -> Result<Vec<u8>, OptionError> {
    let mut options = header_bytes[IPV4_MIN_HDR_LEN..].to_vec();
    if !options.is_empty() {
        process_received_options(bindings_ctx, &mut options, local_addr)?;
    }
    Ok(options)
}

/// Receives an IPv4 datagram from the link layer.
///
/// `buffer` starts at the IPv4 header. Bytes after the datagram's total
/// length are ignored.
pub fn receive_ipv4_packet<BC: BindingsContext>(
    core_ctx: &SyncCtx,
    bindings_ctx: &mut BC,
    device: &DeviceId,
    frame_dst: FrameDestination,
    buffer: Vec<u8>,
) {
    let mut core_ctx = core_ctx.lock();
    receive_ipv4_packet_inner(&mut core_ctx, bindings_ctx, device, Some(frame_dst), buffer)
}

/// Receives a datagram on `device`.
///
/// `frame_dst` is `None` for datagrams looped back from this host.
fn receive_ipv4_packet_inner<BC: BindingsContext>(
    core_ctx: &mut CoreCtx<'_>,
    bindings_ctx: &mut BC,
    device: &DeviceId,
    frame_dst: Option<FrameDestination>,
    mut buffer: Vec<u8>,
) {
    let CoreCtx { locked, state } = core_ctx;
    let counters = state.ipv4_counters();
    let LockedState { devices, ipv4 } = &mut **locked;
    let devices: &Devices = devices;

    let device_state = match devices.get(device) {
        Ok(state) if state.enabled => state,
        Ok(_) | Err(NotFoundError) => {
            trace!("receive_ipv4_packet: dropping packet on unavailable device {:?}", device);
            return;
        }
    };
    counters.receive_ip_packet.increment();
    trace!("receive_ipv4_packet({:?})", device);

    // Errors about looped back datagrams are reported as if the frame had
    // been addressed to us alone.
    let icmp_frame_dst = frame_dst.unwrap_or(FrameDestination::Unicast);
    let drop_packet = |bindings_ctx: &mut BC,
                       reason: DropReason,
                       header: Option<&Ipv4Header>,
                       datagram: &[u8]| {
        reason.counter(counters).increment();
        match header {
            Some(header) => debug!(
                "receive_ipv4_packet: dropping packet from {} to {}: {:?}",
                header.src, header.dst, reason
            ),
            None => debug!("receive_ipv4_packet: dropping packet on {:?}: {:?}", device, reason),
        }
        if let (Some(header), Some(kind)) = (header, reason.icmp_error()) {
            send_icmpv4_error(
                bindings_ctx,
                devices,
                counters,
                device,
                icmp_frame_dst,
                header,
                datagram,
                kind,
            );
        }
    };

    let header = match validate_received_header(devices, device_state, frame_dst, &mut buffer) {
        Ok(header) => header,
        Err(Discard { reason, header }) => {
            drop_packet(bindings_ctx, reason, header.as_ref(), &buffer);
            return;
        }
    };

    let local_addr = if is_host_address(devices, header.dst) {
        header.dst
    } else {
        device_state.ip.addrs.first().map_or(THIS_HOST, |entry| entry.addr)
    };
    let options = match received_options(bindings_ctx, &buffer[..header.header_len], local_addr) {
        Ok(options) => options,
        Err(OptionError { pointer }) => {
            drop_packet(bindings_ctx, DropReason::Options { pointer }, Some(&header), &buffer);
            return;
        }
    };

    if header.is_fragment() {
        counters.receive_fragment.increment();
    }
    let timeout = ipv4.config.reassembly_timeout;
    let (header, datagram, options) =
        match ipv4.fragment_cache.process_fragment(bindings_ctx, timeout, device, &header, &buffer)
        {
            FragmentProcessingState::NotNeeded => (header, buffer, options),
            FragmentProcessingState::NeedMoreFragments => {
                trace!("receive_ipv4_packet: fragment stored, waiting for more");
                return;
            }
            FragmentProcessingState::Duplicate => {
                counters.duplicate_fragment.increment();
                return;
            }
            FragmentProcessingState::InvalidFragment(err) => {
                counters.fragment_reassembly_error.increment();
                debug!(
                    "receive_ipv4_packet: dropping fragment from {} to {}: {:?}",
                    header.src, header.dst, err
                );
                return;
            }
            FragmentProcessingState::OutOfMemory => {
                counters.fragment_cache_full.increment();
                debug!("receive_ipv4_packet: fragment cache full, dropping fragment");
                return;
            }
            FragmentProcessingState::Ready(ReassembledDatagram { datagram, header_len }) => {
                counters.reassembled.increment();
                let Some(header) = Ipv4Header::parse(&datagram) else {
                    return;
                };
                // The options of the first fragment were validated on arrival.
                let options = match received_options(
                    bindings_ctx,
                    &datagram[..header_len],
                    local_addr,
                ) {
                    Ok(options) => options,
                    Err(OptionError { pointer }) => {
                        drop_packet(
                            bindings_ctx,
                            DropReason::Options { pointer },
                            Some(&header),
                            &datagram,
                        );
                        return;
                    }
                };
                (header, datagram, options)
            }
        };

    let meta = ReceivedIpv4Meta {
        src_ip: header.src,
        dst_ip: header.dst,
        proto: header.proto,
        tos: header.tos,
        ttl: header.ttl,
        frame_dst,
        options,
    };
    match bindings_ctx.receive_ipv4_packet(device, &meta, &datagram[header.header_len..]) {
        Ok(()) => {
            counters.deliver.increment();
        }
        Err(err) => {
            counters.deliver_error.increment();
            trace!("receive_ipv4_packet: transport refused packet from {}: {}", header.src, err);
            let kind = match err {
                TransportReceiveError::ProtocolUnsupported => Icmpv4ErrorKind::ProtocolUnreachable,
                TransportReceiveError::PortUnreachable => Icmpv4ErrorKind::PortUnreachable,
            };
            send_icmpv4_error(
                bindings_ctx,
                devices,
                counters,
                device,
                icmp_frame_dst,
                &header,
                &datagram,
                kind,
            );
        }
    }
}

/// Handles the expiry of a reassembly timer.
pub(crate) fn handle_reassembly_timer<BC: BindingsContext>(
    core_ctx: &mut CoreCtx<'_>,
    bindings_ctx: &mut BC,
    id: FragmentTimerId,
) {
    let CoreCtx { locked, state } = core_ctx;
    let counters = state.ipv4_counters();
    let LockedState { devices, ipv4 } = &mut **locked;
    let Some(ExpiredFragments { key, first }) = ipv4.fragment_cache.handle_reassembly_timer(id)
    else {
        return;
    };
    counters.reassembly_timeout.increment();
    let Some((device, original)) = first else {
        trace!("reassembly of {:?} timed out before its first fragment arrived", key);
        return;
    };
    let Some(header) = Ipv4Header::parse(&original) else {
        return;
    };
    send_icmpv4_error(
        bindings_ctx,
        devices,
        counters,
        &device,
        FrameDestination::Unicast,
        &header,
        &original,
        Icmpv4ErrorKind::FragmentReassemblyTimeExceeded,
    );
}

/// Validates the egress device and addresses of an outgoing datagram.
///
/// Returns the egress device and its MTU.
fn validate_egress(
    devices: &Devices,
    device: Option<DeviceId>,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    tos: u8,
) -> Result<(DeviceId, u32), IpSendError> {
    let device = match device {
        Some(device) => device,
        None => find_addr_entry(devices, src)
            .map(|(device, _)| device)
            .ok_or(IpSendError::InvalidArgument(InvalidSendArgument::Source))?,
    };
    let state = devices.get(&device).map_err(|NotFoundError| IpSendError::DeviceNotFound)?;
    if !state.enabled {
        return Err(IpSendError::DeviceDisabled);
    }
    if tos & TOS_MBZ != 0 {
        return Err(IpSendError::InvalidArgument(InvalidSendArgument::Tos));
    }
    // While a dynamic configuration protocol runs, the device may send from
    // the unspecified address.
    let dynamic_init_src = src == THIS_HOST && state.ip.dynamic_init;
    if !(state.ip.has_addr(src) || is_valid_loopback_host(src) || dynamic_init_src) {
        return Err(IpSendError::InvalidArgument(InvalidSendArgument::Source));
    }
    if (dst == THIS_HOST && !dynamic_init_src) || is_class_e(dst) {
        return Err(IpSendError::InvalidArgument(InvalidSendArgument::Destination));
    }
    Ok((device, state.mtu))
}

fn check_datagram_size(
    destination: Ipv4Destination,
    total_len: usize,
    mtu: u32,
) -> Result<(), NotSupportedError> {
    let over_mtu = destination != Ipv4Destination::LocalHost
        && usize::try_from(mtu).map_or(false, |mtu| total_len > mtu);
    if total_len > IPV4_MAX_TOTAL_LEN || over_mtu {
        return Err(NotSupportedError);
    }
    Ok(())
}

/// Hands a finished datagram to the link layer, or loops it back when it is
/// addressed to this host.
fn dispatch_ipv4_datagram<BC: BindingsContext>(
    core_ctx: &mut CoreCtx<'_>,
    bindings_ctx: &mut BC,
    device: &DeviceId,
    destination: Ipv4Destination,
    dst: Ipv4Addr,
    datagram: Vec<u8>,
) -> Result<(), IpSendError> {
    match destination.link_destination(dst) {
        None => {
            let rx_device =
                find_addr_entry(&core_ctx.locked.devices, dst).map_or(*device, |(device, _)| device);
            core_ctx.with_counters(|counters: &Ipv4Counters| counters.send_ip_packet.increment());
            trace!("send_ipv4_packet: looping back packet to {} on {:?}", dst, rx_device);
            receive_ipv4_packet_inner(core_ctx, bindings_ctx, &rx_device, None, datagram);
            Ok(())
        }
        Some(link_dst) => {
            bindings_ctx.send_ipv4_frame(device, link_dst, datagram)?;
            core_ctx.with_counters(|counters: &Ipv4Counters| counters.send_ip_packet.increment());
            Ok(())
        }
    }
}

fn count_send_error(counters: &Ipv4Counters, err: &IpSendError) {
    let counter = match err {
        IpSendError::InvalidArgument(_)
        | IpSendError::DeviceNotFound
        | IpSendError::DeviceDisabled => &counters.send_invalid_argument,
        IpSendError::NextHopUnreachable => &counters.no_route_to_host,
        IpSendError::NotSupported => &counters.mtu_exceeded,
        IpSendError::Link(_) => &counters.send_link_error,
    };
    counter.increment();
}

/// Sends an IPv4 datagram carrying `body`.
///
/// Datagrams larger than the egress device's MTU are not fragmented; they
/// fail with [`IpSendError::NotSupported`].
pub fn send_ipv4_packet<BC: BindingsContext>(
    core_ctx: &SyncCtx,
    bindings_ctx: &mut BC,
    params: SendIpv4Params,
    body: &[u8],
) -> Result<(), IpSendError> {
    let mut core_ctx = core_ctx.lock();
    let dst_ip = params.dst_ip;
    send_ipv4_packet_inner(&mut core_ctx, bindings_ctx, params, body).map_err(|err| {
        debug!("send_ipv4_packet: failed to send to {}: {}", dst_ip, err);
        core_ctx.with_counters(|counters: &Ipv4Counters| count_send_error(counters, &err));
        err
    })
}

fn send_ipv4_packet_inner<BC: BindingsContext>(
    core_ctx: &mut CoreCtx<'_>,
    bindings_ctx: &mut BC,
    params: SendIpv4Params,
    body: &[u8],
) -> Result<(), IpSendError> {
    let SendIpv4Params { device, src_ip, dst_ip, proto, tos, ttl, flags, options } = params;
    let Ipv4Config { hop_limits, default_tos, .. } = &core_ctx.locked.ipv4.config;
    let tos = tos.unwrap_or(*default_tos);
    let ttl = ttl.unwrap_or(if is_multicast(dst_ip) {
        hop_limits.multicast
    } else {
        hop_limits.unicast
    });

    let devices = &core_ctx.locked.devices;
    let (device, mtu) = validate_egress(devices, device, src_ip, dst_ip, tos)?;
    let options = serialize_tx_options(&options).map_err(|err| {
        debug!("send_ipv4_packet: invalid options: {}", err);
        IpSendError::InvalidArgument(InvalidSendArgument::Options)
    })?;
    let destination = classify(devices, &device, src_ip, dst_ip)?;
    check_datagram_size(destination, IPV4_MIN_HDR_LEN + options.len() + body.len(), mtu)?;

    let id = core_ctx.locked.ipv4.next_packet_id();
    let datagram = Ipv4HeaderBuilder {
        tos,
        id,
        flags: Ipv4Flags::from_bits_truncate(flags.bits()),
        fragment_offset: 0,
        ttl: ttl.get(),
        proto,
        src: src_ip,
        dst: dst_ip,
    }
    .serialize(&options, body);
    trace!("send_ipv4_packet: {} -> {} ({:?}) via {:?}", src_ip, dst_ip, proto, destination);
    dispatch_ipv4_datagram(core_ctx, bindings_ctx, &device, destination, dst_ip, datagram)
}

/// Sends a datagram previously prepared by this layer again.
///
/// The datagram is given a fresh identification and its destination is
/// classified anew. When `device` is `None`, the device on which the source
/// address is configured is used.
pub fn retransmit_ipv4_packet<BC: BindingsContext>(
    core_ctx: &SyncCtx,
    bindings_ctx: &mut BC,
    device: Option<DeviceId>,
    datagram: Vec<u8>,
) -> Result<(), IpSendError> {
    let mut core_ctx = core_ctx.lock();
    core_ctx.with_counters(|counters: &Ipv4Counters| counters.retransmit.increment());
    retransmit_ipv4_packet_inner(&mut core_ctx, bindings_ctx, device, datagram).map_err(|err| {
        debug!("retransmit_ipv4_packet: {}", err);
        core_ctx.with_counters(|counters: &Ipv4Counters| count_send_error(counters, &err));
        err
    })
}

fn retransmit_ipv4_packet_inner<BC: BindingsContext>(
    core_ctx: &mut CoreCtx<'_>,
    bindings_ctx: &mut BC,
    device: Option<DeviceId>,
    mut datagram: Vec<u8>,
) -> Result<(), IpSendError> {
    let header = Ipv4Header::parse(&datagram)
        .filter(|header| {
            header.version == IPV4_VERSION
                && header.header_len >= IPV4_MIN_HDR_LEN
                && header.header_len <= datagram.len()
                && usize::from(header.total_len) == datagram.len()
        })
        .ok_or(IpSendError::InvalidArgument(InvalidSendArgument::Header))?;
    if header.flags.contains(Ipv4Flags::RESERVED) || header.is_fragment() {
        return Err(IpSendError::InvalidArgument(InvalidSendArgument::Flags));
    }

    let devices = &core_ctx.locked.devices;
    let (device, mtu) = validate_egress(devices, device, header.src, header.dst, header.tos)?;
    let destination = classify(devices, &device, header.src, header.dst)?;
    check_datagram_size(destination, datagram.len(), mtu)?;

    let id = core_ctx.locked.ipv4.next_packet_id();
    rewrite_id(&mut datagram, header.header_len, id);
    trace!("retransmit_ipv4_packet: {} -> {} with id {}", header.src, header.dst, id);
    dispatch_ipv4_datagram(core_ctx, bindings_ctx, &device, destination, header.dst, datagram)
}

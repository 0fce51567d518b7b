// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! ICMPv4 error reporting.
//!
//! The ICMP protocol itself lives outside of this crate. The IPv4 layer
//! decides when an error is warranted and hands the offending datagram to an
//! [`IcmpErrorDispatcher`].

use std::net::Ipv4Addr;

use tracing::{debug, trace};

use crate::{
    device::{DeviceId, Devices, FrameDestination},
    ip::{
        address::is_valid_host_address,
        base::Ipv4Counters,
        device::is_host_address,
        header::{Ipv4Header, Ipv4Proto},
    },
};

/// The number of body bytes quoted after the original header (RFC 792).
const ICMP_QUOTED_BODY_LEN: usize = 8;

// ICMP message types which are themselves errors.
const ICMP_DEST_UNREACHABLE: u8 = 3;
const ICMP_SOURCE_QUENCH: u8 = 4;
const ICMP_REDIRECT: u8 = 5;
const ICMP_TIME_EXCEEDED: u8 = 11;
const ICMP_PARAMETER_PROBLEM: u8 = 12;

/// The kind of an ICMPv4 error.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Icmpv4ErrorKind {
    /// A header field is invalid.
    ParameterProblem {
        /// The offset of the offending octet within the header.
        pointer: u8,
    },
    /// The datagram's protocol is not supported.
    ProtocolUnreachable,
    /// No transport endpoint accepts the datagram.
    PortUnreachable,
    /// The datagram's fragments did not all arrive in time.
    FragmentReassemblyTimeExceeded,
}

/// An ICMPv4 error to be sent in response to a received datagram.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Icmpv4Error {
    /// The kind of error.
    pub kind: Icmpv4ErrorKind,
    /// The length of the header of the datagram that caused the error.
    pub header_len: usize,
}

/// A sink for ICMPv4 error messages.
pub trait IcmpErrorDispatcher {
    /// Sends an ICMPv4 error from `src_ip` to `dst_ip` through `device`.
    ///
    /// `original` holds the header of the datagram that caused the error and
    /// up to the first eight bytes of its body.
    fn send_icmpv4_error(
        &mut self,
        device: &DeviceId,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        error: Icmpv4Error,
        original: &[u8],
    );
}

/// Is the datagram itself an ICMP error message?
fn is_icmp_error_message(proto: Ipv4Proto, body: &[u8]) -> bool {
    proto == Ipv4Proto::Icmp
        && matches!(
            body.first(),
            Some(
                &ICMP_DEST_UNREACHABLE
                    | &ICMP_SOURCE_QUENCH
                    | &ICMP_REDIRECT
                    | &ICMP_TIME_EXCEEDED
                    | &ICMP_PARAMETER_PROBLEM
            )
        )
}

/// Applies RFC 1122 section 3.2.2: no errors about ICMP errors, datagrams
/// addressed to a broadcast or multicast address (or received as a
/// link-layer broadcast or multicast), non-initial fragments, or datagrams
/// whose source is not a single host.
fn should_send_icmpv4_error(
    devices: &Devices,
    frame_dst: FrameDestination,
    header: &Ipv4Header,
    body: &[u8],
) -> bool {
    !frame_dst.is_broadcast()
        && !frame_dst.is_multicast()
        && is_host_address(devices, header.dst)
        && is_valid_host_address(header.src)
        && header.fragment_offset == 0
        && !is_icmp_error_message(header.proto, body)
}

/// Requests an ICMPv4 error about `datagram` if one is allowed.
///
/// `datagram` must start with the header described by `header`.
pub(crate) fn send_icmpv4_error<BC: IcmpErrorDispatcher>(
    bindings_ctx: &mut BC,
    devices: &Devices,
    counters: &Ipv4Counters,
    device: &DeviceId,
    frame_dst: FrameDestination,
    header: &Ipv4Header,
    datagram: &[u8],
    kind: Icmpv4ErrorKind,
) {
    let header_len = header.header_len.min(datagram.len());
    let body = &datagram[header_len..];
    if !should_send_icmpv4_error(devices, frame_dst, header, body) {
        trace!("not sending ICMP error {:?} about datagram from {}", kind, header.src);
        return;
    }
    counters.send_icmp_error.increment();
    debug!("sending ICMP error {:?} to {} on {:?}", kind, header.src, device);
    let quoted_len = datagram.len().min(header_len + ICMP_QUOTED_BODY_LEN);
    bindings_ctx.send_icmpv4_error(
        device,
        header.dst,
        header.src,
        Icmpv4Error { kind, header_len },
        &datagram[..quoted_len],
    );
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use test_case::test_case;

    use super::*;
    use crate::{
        device::Mac,
        ip::{
            device::state::{AddrConfigMode, Ipv4AddressEntry},
            header::testutil::new_datagram,
        },
    };

    const LOCAL: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
    const REMOTE: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 20);

    fn devices() -> Devices {
        let mut devices = Devices::default();
        let device = devices.add(Mac::new([2, 0, 0, 0, 0, 1]), 1500);
        devices.get_mut(&device).unwrap().ip.addrs.push(Ipv4AddressEntry::new(
            LOCAL,
            Ipv4Addr::new(255, 255, 255, 0),
            None,
            AddrConfigMode::Static,
        ));
        devices
    }

    #[test_case(FrameDestination::Unicast, REMOTE, LOCAL, Ipv4Proto::Udp, 0, true; "allowed")]
    #[test_case(FrameDestination::Broadcast, REMOTE, LOCAL, Ipv4Proto::Udp, 0, false;
        "link broadcast")]
    #[test_case(FrameDestination::Multicast, REMOTE, LOCAL, Ipv4Proto::Udp, 0, false;
        "link multicast")]
    #[test_case(FrameDestination::Unicast, REMOTE, Ipv4Addr::new(224, 0, 0, 1), Ipv4Proto::Udp, 0,
        false; "multicast destination")]
    #[test_case(FrameDestination::Unicast, REMOTE, Ipv4Addr::new(192, 168, 1, 255),
        Ipv4Proto::Udp, 0, false; "subnet broadcast destination")]
    #[test_case(FrameDestination::Unicast, Ipv4Addr::UNSPECIFIED, LOCAL, Ipv4Proto::Udp, 0, false;
        "unspecified source")]
    #[test_case(FrameDestination::Unicast, REMOTE, LOCAL, Ipv4Proto::Udp, 1, false;
        "non-initial fragment")]
    #[test_case(FrameDestination::Unicast, REMOTE, LOCAL, Ipv4Proto::Icmp, 0, false;
        "icmp error message")]
    fn error_gating(
        frame_dst: FrameDestination,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        proto: Ipv4Proto,
        fragment_offset: u16,
        expected: bool,
    ) {
        let body = [ICMP_DEST_UNREACHABLE, 0, 0, 0];
        let datagram = new_datagram(src, dst, proto, 1, fragment_offset, false, &body);
        let header = Ipv4Header::parse(&datagram).unwrap();
        assert_eq!(
            should_send_icmpv4_error(&devices(), frame_dst, &header, &body),
            expected
        );
    }

    #[test]
    fn echo_request_may_trigger_error() {
        assert!(!is_icmp_error_message(Ipv4Proto::Icmp, &[8, 0]));
        assert!(is_icmp_error_message(Ipv4Proto::Icmp, &[ICMP_TIME_EXCEEDED, 0]));
        assert!(!is_icmp_error_message(Ipv4Proto::Udp, &[ICMP_TIME_EXCEEDED, 0]));
    }

    #[derive(Default)]
    struct RecordingDispatcher {
        sent: Vec<(DeviceId, Ipv4Addr, Ipv4Addr, Icmpv4Error, Vec<u8>)>,
    }

    impl IcmpErrorDispatcher for RecordingDispatcher {
        fn send_icmpv4_error(
            &mut self,
            device: &DeviceId,
            src_ip: Ipv4Addr,
            dst_ip: Ipv4Addr,
            error: Icmpv4Error,
            original: &[u8],
        ) {
            self.sent.push((*device, src_ip, dst_ip, error, original.to_vec()))
        }
    }

    #[test]
    fn quotes_header_and_eight_bytes() {
        let devices = devices();
        let counters = Ipv4Counters::default();
        let device = DeviceId::new_for_test(0);
        let datagram = new_datagram(REMOTE, LOCAL, Ipv4Proto::Udp, 1, 0, false, &[7; 32]);
        let header = Ipv4Header::parse(&datagram).unwrap();
        let mut dispatcher = RecordingDispatcher::default();
        send_icmpv4_error(
            &mut dispatcher,
            &devices,
            &counters,
            &device,
            FrameDestination::Unicast,
            &header,
            &datagram,
            Icmpv4ErrorKind::PortUnreachable,
        );
        let error = Icmpv4Error { kind: Icmpv4ErrorKind::PortUnreachable, header_len: 20 };
        assert_eq!(dispatcher.sent, vec![(device, LOCAL, REMOTE, error, datagram[..28].to_vec())]);
        assert_eq!(counters.send_icmp_error.get(), 1);
    }
}

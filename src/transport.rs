// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The boundary between the IPv4 layer and the protocols above it.
//!
//! ICMP, IGMP, UDP and TCP are implemented by bindings. Validated datagrams
//! are handed to a [`TransportDispatcher`] together with the metadata the IP
//! layer extracted from their header.

use alloc::vec::Vec;
use std::net::Ipv4Addr;

use thiserror::Error;

use crate::{
    device::{DeviceId, FrameDestination},
    ip::Ipv4Proto,
};

/// Metadata describing a datagram delivered to a transport sink.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReceivedIpv4Meta {
    /// The source address.
    pub src_ip: Ipv4Addr,
    /// The destination address.
    pub dst_ip: Ipv4Addr,
    /// The upper-layer protocol.
    pub proto: Ipv4Proto,
    /// The type-of-service octet.
    pub tos: u8,
    /// The time-to-live octet.
    pub ttl: u8,
    /// How the frame carrying the datagram was addressed on the link, or
    /// `None` for a datagram looped back from this host.
    pub frame_dst: Option<FrameDestination>,
    /// The header options after processing, padding included.
    pub options: Vec<u8>,
}

/// Errors returned by a transport sink.
#[derive(Copy, Clone, Debug, Error, Eq, PartialEq)]
pub enum TransportReceiveError {
    /// The protocol is not handled by bindings.
    #[error("protocol unsupported")]
    ProtocolUnsupported,
    /// No endpoint is bound to the destination port.
    #[error("port unreachable")]
    PortUnreachable,
}

/// The transport layer sinks.
pub trait TransportDispatcher {
    /// Receives a validated, reassembled datagram body.
    fn receive_ipv4_packet(
        &mut self,
        device: &DeviceId,
        meta: &ReceivedIpv4Meta,
        body: &[u8],
    ) -> Result<(), TransportReceiveError>;

    /// Closes every connection bound to `addr`.
    ///
    /// Called before `addr` is removed from the address table.
    fn close_connections_bound_to(&mut self, addr: Ipv4Addr);
}

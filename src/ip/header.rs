// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The IPv4 header wire format.

use alloc::vec::Vec;
use std::net::Ipv4Addr;

use bitflags::bitflags;
use byteorder::{ByteOrder, NetworkEndian};

pub(crate) const IPV4_VERSION: u8 = 4;
/// The length of a header without options.
pub(crate) const IPV4_MIN_HDR_LEN: usize = 20;
/// The length of a header with the maximum amount of options.
pub(crate) const IPV4_MAX_HDR_LEN: usize = 60;
/// The largest datagram, header included, that fits the total length field.
pub(crate) const IPV4_MAX_TOTAL_LEN: usize = u16::MAX as usize;
/// Fragment offsets are expressed in units of this many bytes.
pub(crate) const FRAGMENT_BLOCK_SIZE: usize = 8;
pub(crate) const FRAGMENT_OFFSET_MASK: u16 = 0x1FFF;

// Field offsets.
pub(crate) const VERSION_IHL_OFFSET: usize = 0;
pub(crate) const TOS_OFFSET: usize = 1;
pub(crate) const TOTAL_LEN_OFFSET: usize = 2;
pub(crate) const ID_OFFSET: usize = 4;
pub(crate) const FLAGS_FRAGMENT_OFFSET: usize = 6;
pub(crate) const TTL_OFFSET: usize = 8;
pub(crate) const PROTO_OFFSET: usize = 9;
pub(crate) const CHECKSUM_OFFSET: usize = 10;
pub(crate) const SRC_OFFSET: usize = 12;
pub(crate) const DST_OFFSET: usize = 16;

/// The "reserved, must be zero" bit of the type-of-service field.
pub(crate) const TOS_MBZ: u8 = 0x01;

bitflags! {
    /// The flags carried in the high bits of the fragment offset word.
    pub(crate) struct Ipv4Flags: u16 {
        const RESERVED = 0x8000;
        const DONT_FRAGMENT = 0x4000;
        const MORE_FRAGMENTS = 0x2000;
    }
}

/// An IPv4 protocol number.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Ipv4Proto {
    /// The Internet Control Message Protocol.
    Icmp,
    /// The Internet Group Management Protocol.
    Igmp,
    /// The Transmission Control Protocol.
    Tcp,
    /// The User Datagram Protocol.
    Udp,
    /// Any other protocol number.
    Other(u8),
}

impl Ipv4Proto {
    const ICMP: u8 = 1;
    const IGMP: u8 = 2;
    const TCP: u8 = 6;
    const UDP: u8 = 17;

    /// Is this a protocol the stack delivers to a transport sink?
    pub(crate) fn is_supported(self) -> bool {
        !matches!(self, Ipv4Proto::Other(_))
    }
}

impl From<u8> for Ipv4Proto {
    fn from(proto: u8) -> Ipv4Proto {
        match proto {
            Ipv4Proto::ICMP => Ipv4Proto::Icmp,
            Ipv4Proto::IGMP => Ipv4Proto::Igmp,
            Ipv4Proto::TCP => Ipv4Proto::Tcp,
            Ipv4Proto::UDP => Ipv4Proto::Udp,
            other => Ipv4Proto::Other(other),
        }
    }
}

impl From<Ipv4Proto> for u8 {
    fn from(proto: Ipv4Proto) -> u8 {
        match proto {
            Ipv4Proto::Icmp => Ipv4Proto::ICMP,
            Ipv4Proto::Igmp => Ipv4Proto::IGMP,
            Ipv4Proto::Tcp => Ipv4Proto::TCP,
            Ipv4Proto::Udp => Ipv4Proto::UDP,
            Ipv4Proto::Other(other) => other,
        }
    }
}

/// A host-order copy of the fixed fields of a header.
///
/// No field is checked when parsing; validation is the caller's job.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Ipv4Header {
    pub(crate) version: u8,
    pub(crate) header_len: usize,
    pub(crate) tos: u8,
    pub(crate) total_len: u16,
    pub(crate) id: u16,
    pub(crate) flags: Ipv4Flags,
    /// In units of [`FRAGMENT_BLOCK_SIZE`].
    pub(crate) fragment_offset: u16,
    pub(crate) ttl: u8,
    pub(crate) proto: Ipv4Proto,
    pub(crate) checksum: u16,
    pub(crate) src: Ipv4Addr,
    pub(crate) dst: Ipv4Addr,
}

impl Ipv4Header {
    /// Parses the fixed fields from the first [`IPV4_MIN_HDR_LEN`] bytes of
    /// `bytes`.
    pub(crate) fn parse(bytes: &[u8]) -> Option<Ipv4Header> {
        let bytes = bytes.get(..IPV4_MIN_HDR_LEN)?;
        let version_ihl = bytes[VERSION_IHL_OFFSET];
        let flags_fragment = NetworkEndian::read_u16(&bytes[FLAGS_FRAGMENT_OFFSET..]);
        Some(Ipv4Header {
            version: version_ihl >> 4,
            header_len: usize::from(version_ihl & 0x0F) * 4,
            tos: bytes[TOS_OFFSET],
            total_len: NetworkEndian::read_u16(&bytes[TOTAL_LEN_OFFSET..]),
            id: NetworkEndian::read_u16(&bytes[ID_OFFSET..]),
            flags: Ipv4Flags::from_bits_truncate(flags_fragment),
            fragment_offset: flags_fragment & FRAGMENT_OFFSET_MASK,
            ttl: bytes[TTL_OFFSET],
            proto: Ipv4Proto::from(bytes[PROTO_OFFSET]),
            checksum: NetworkEndian::read_u16(&bytes[CHECKSUM_OFFSET..]),
            src: read_addr(&bytes[SRC_OFFSET..]),
            dst: read_addr(&bytes[DST_OFFSET..]),
        })
    }

    /// The fragment offset in bytes.
    pub(crate) fn fragment_offset_bytes(&self) -> usize {
        usize::from(self.fragment_offset) * FRAGMENT_BLOCK_SIZE
    }

    pub(crate) fn more_fragments(&self) -> bool {
        self.flags.contains(Ipv4Flags::MORE_FRAGMENTS)
    }

    pub(crate) fn dont_fragment(&self) -> bool {
        self.flags.contains(Ipv4Flags::DONT_FRAGMENT)
    }

    /// Is this datagram a piece of a larger one?
    pub(crate) fn is_fragment(&self) -> bool {
        self.more_fragments() || self.fragment_offset != 0
    }
}

fn read_addr(bytes: &[u8]) -> Ipv4Addr {
    Ipv4Addr::from(NetworkEndian::read_u32(bytes))
}

fn write_addr(bytes: &mut [u8], addr: Ipv4Addr) {
    NetworkEndian::write_u32(bytes, u32::from(addr))
}

/// Computes the Internet checksum (RFC 1071) of `bytes`.
pub(crate) fn compute_checksum(bytes: &[u8]) -> u16 {
    !ones_complement_sum(bytes)
}

fn ones_complement_sum(bytes: &[u8]) -> u16 {
    let mut chunks = bytes.chunks_exact(2);
    let mut sum: u32 = chunks.by_ref().map(|c| u32::from(NetworkEndian::read_u16(c))).sum();
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

/// Returns whether the checksum embedded in `header` is correct.
pub(crate) fn checksum_is_valid(header: &[u8]) -> bool {
    ones_complement_sum(header) == 0xFFFF
}

/// Recomputes and stores the checksum of `header`.
pub(crate) fn write_checksum(header: &mut [u8]) {
    header[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].fill(0);
    let checksum = compute_checksum(header);
    NetworkEndian::write_u16(&mut header[CHECKSUM_OFFSET..], checksum);
}

/// Overwrites the identification field of the header at the front of
/// `datagram` and recomputes its checksum.
pub(crate) fn rewrite_id(datagram: &mut [u8], header_len: usize, id: u16) {
    NetworkEndian::write_u16(&mut datagram[ID_OFFSET..], id);
    write_checksum(&mut datagram[..header_len]);
}

/// Marks the header at the front of `datagram` as a whole, unfragmented
/// datagram of `total_len` bytes and recomputes its checksum.
pub(crate) fn rewrite_as_unfragmented(datagram: &mut [u8], header_len: usize, total_len: u16) {
    NetworkEndian::write_u16(&mut datagram[TOTAL_LEN_OFFSET..], total_len);
    let flags_fragment = NetworkEndian::read_u16(&datagram[FLAGS_FRAGMENT_OFFSET..]);
    let flags = Ipv4Flags::from_bits_truncate(flags_fragment) & Ipv4Flags::DONT_FRAGMENT;
    NetworkEndian::write_u16(&mut datagram[FLAGS_FRAGMENT_OFFSET..], flags.bits());
    write_checksum(&mut datagram[..header_len]);
}

/// The fields of a header to be serialized.
#[derive(Clone, Debug)]
pub(crate) struct Ipv4HeaderBuilder {
    pub(crate) tos: u8,
    pub(crate) id: u16,
    pub(crate) flags: Ipv4Flags,
    pub(crate) fragment_offset: u16,
    pub(crate) ttl: u8,
    pub(crate) proto: Ipv4Proto,
    pub(crate) src: Ipv4Addr,
    pub(crate) dst: Ipv4Addr,
}

impl Ipv4HeaderBuilder {
    /// Serializes a header carrying `options` followed by `body`.
    ///
    /// `options` must already be padded to a multiple of four bytes and be no
    /// longer than 40 bytes; the caller checks that the result fits in a
    /// datagram.
    pub(crate) fn serialize(&self, options: &[u8], body: &[u8]) -> Vec<u8> {
        let Self { tos, id, flags, fragment_offset, ttl, proto, src, dst } = self;
        debug_assert_eq!(options.len() % 4, 0);
        let header_len = IPV4_MIN_HDR_LEN + options.len();
        debug_assert!(header_len <= IPV4_MAX_HDR_LEN);
        let total_len = header_len + body.len();

        let mut buf = Vec::with_capacity(total_len);
        buf.resize(IPV4_MIN_HDR_LEN, 0);
        buf[VERSION_IHL_OFFSET] = (IPV4_VERSION << 4) | (header_len / 4) as u8;
        buf[TOS_OFFSET] = *tos;
        NetworkEndian::write_u16(&mut buf[TOTAL_LEN_OFFSET..], total_len as u16);
        NetworkEndian::write_u16(&mut buf[ID_OFFSET..], *id);
        NetworkEndian::write_u16(
            &mut buf[FLAGS_FRAGMENT_OFFSET..],
            flags.bits() | (fragment_offset & FRAGMENT_OFFSET_MASK),
        );
        buf[TTL_OFFSET] = *ttl;
        buf[PROTO_OFFSET] = (*proto).into();
        write_addr(&mut buf[SRC_OFFSET..], *src);
        write_addr(&mut buf[DST_OFFSET..], *dst);
        buf.extend_from_slice(options);
        write_checksum(&mut buf[..header_len]);
        buf.extend_from_slice(body);
        buf
    }
}

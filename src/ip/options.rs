// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! IPv4 header options.
//!
//! Received options are validated and updated in place: route options record
//! this host's address and timestamp options record the current time, as
//! described in RFC 791 section 3.1. Options for outgoing datagrams are built
//! from [`TxOption`] values.

use alloc::vec::Vec;
use std::net::Ipv4Addr;

use byteorder::{ByteOrder, NetworkEndian};
use thiserror::Error;

use crate::ip::header::{IPV4_MAX_HDR_LEN, IPV4_MIN_HDR_LEN};

/// The largest amount of option bytes a header can carry.
pub(crate) const MAX_OPTIONS_LEN: usize = IPV4_MAX_HDR_LEN - IPV4_MIN_HDR_LEN;

const OPTION_END_OF_LIST: u8 = 0;
const OPTION_NOP: u8 = 1;
const OPTION_RECORD_ROUTE: u8 = 7;
const OPTION_TIMESTAMP: u8 = 68;
const OPTION_SECURITY: u8 = 130;
const OPTION_LOOSE_SOURCE_ROUTE: u8 = 131;
const OPTION_STRICT_SOURCE_ROUTE: u8 = 137;

// Offsets within a single option.
const OPTION_LEN_OFFSET: usize = 1;
const OPTION_POINTER_OFFSET: usize = 2;
const TIMESTAMP_OVERFLOW_FLAGS_OFFSET: usize = 3;

/// Route data starts after type, length and pointer; pointers are 1-based.
const ROUTE_DATA_START: usize = 3;
const ROUTE_POINTER_MIN: u8 = 4;
/// Timestamp data starts after type, length, pointer and overflow/flags.
const TIMESTAMP_DATA_START: usize = 4;
const TIMESTAMP_POINTER_MIN: u8 = 5;
const TIMESTAMP_OVERFLOW_MAX: u8 = 15;

const TIMESTAMP_FLAG_ONLY: u8 = 0;
const TIMESTAMP_FLAG_WITH_ADDR: u8 = 1;
const TIMESTAMP_FLAG_PRESPECIFIED: u8 = 3;

/// A source of timestamps for the timestamp option.
pub trait Ipv4TimestampContext {
    /// Returns the current time in milliseconds since midnight UT.
    fn ipv4_timestamp(&mut self) -> u32;
}

/// A malformed received option.
///
/// `pointer` is the offset, from the start of the header, of the octet that
/// could not be processed.
#[derive(Debug, Eq, PartialEq)]
pub(crate) struct OptionError {
    pub(crate) pointer: u8,
}

impl OptionError {
    fn at(options_offset: usize) -> OptionError {
        // Option bytes never extend past the 60-byte header.
        OptionError { pointer: (IPV4_MIN_HDR_LEN + options_offset) as u8 }
    }
}

/// Validates and updates the received `options` in place.
///
/// Unknown options are skipped using their length octet. At most one route
/// option (record, loose or strict) and at most one timestamp option may
/// appear.
pub(crate) fn process_received_options<BC: Ipv4TimestampContext>(
    bindings_ctx: &mut BC,
    options: &mut [u8],
    local_addr: Ipv4Addr,
) -> Result<(), OptionError> {
    let mut seen_route = false;
    let mut seen_timestamp = false;
    let mut offset = 0;
    while offset < options.len() {
        let kind = options[offset];
        match kind {
            OPTION_END_OF_LIST => break,
            OPTION_NOP => {
                offset += 1;
                continue;
            }
            _ => {}
        }

        let len = match options.get(offset + OPTION_LEN_OFFSET) {
            Some(len) => usize::from(*len),
            None => return Err(OptionError::at(offset)),
        };
        if len < 2 || offset + len > options.len() {
            return Err(OptionError::at(offset + OPTION_LEN_OFFSET));
        }
        let option = &mut options[offset..offset + len];
        let result = match kind {
            OPTION_RECORD_ROUTE | OPTION_LOOSE_SOURCE_ROUTE | OPTION_STRICT_SOURCE_ROUTE => {
                if core::mem::replace(&mut seen_route, true) {
                    Err(0)
                } else {
                    process_route(option, local_addr)
                }
            }
            OPTION_TIMESTAMP => {
                if core::mem::replace(&mut seen_timestamp, true) {
                    Err(0)
                } else {
                    process_timestamp(bindings_ctx, option, local_addr)
                }
            }
            OPTION_SECURITY => {
                if len < 3 {
                    Err(OPTION_LEN_OFFSET)
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        };
        result.map_err(|within| OptionError::at(offset + within))?;
        offset += len;
    }
    Ok(())
}

/// Records `local_addr` in a route option if it still has room.
///
/// Errors carry the offset of the bad octet within the option.
fn process_route(option: &mut [u8], local_addr: Ipv4Addr) -> Result<(), usize> {
    let len = option.len();
    if len < ROUTE_DATA_START || (len - ROUTE_DATA_START) % 4 != 0 {
        return Err(OPTION_LEN_OFFSET);
    }
    let pointer = option[OPTION_POINTER_OFFSET];
    if pointer < ROUTE_POINTER_MIN || usize::from(pointer - ROUTE_POINTER_MIN) % 4 != 0 {
        return Err(OPTION_POINTER_OFFSET);
    }
    let slot = usize::from(pointer) - 1;
    if slot + 4 <= len {
        NetworkEndian::write_u32(&mut option[slot..slot + 4], local_addr.into());
        option[OPTION_POINTER_OFFSET] = pointer + 4;
    }
    Ok(())
}

/// Records the current time (and possibly `local_addr`) in a timestamp
/// option, or bumps its overflow count when it is full.
fn process_timestamp<BC: Ipv4TimestampContext>(
    bindings_ctx: &mut BC,
    option: &mut [u8],
    local_addr: Ipv4Addr,
) -> Result<(), usize> {
    let len = option.len();
    if len < TIMESTAMP_DATA_START {
        return Err(OPTION_LEN_OFFSET);
    }
    let pointer = option[OPTION_POINTER_OFFSET];
    let overflow_flags = option[TIMESTAMP_OVERFLOW_FLAGS_OFFSET];
    let (overflow, flag) = (overflow_flags >> 4, overflow_flags & 0x0F);
    let entry_len = match flag {
        TIMESTAMP_FLAG_ONLY => 4,
        TIMESTAMP_FLAG_WITH_ADDR | TIMESTAMP_FLAG_PRESPECIFIED => 8,
        _ => return Err(TIMESTAMP_OVERFLOW_FLAGS_OFFSET),
    };
    if (len - TIMESTAMP_DATA_START) % entry_len != 0 {
        return Err(OPTION_LEN_OFFSET);
    }
    if pointer < TIMESTAMP_POINTER_MIN
        || usize::from(pointer - TIMESTAMP_POINTER_MIN) % entry_len != 0
    {
        return Err(OPTION_POINTER_OFFSET);
    }

    let slot = usize::from(pointer) - 1;
    if slot + entry_len > len {
        let overflow = overflow + 1;
        if overflow > TIMESTAMP_OVERFLOW_MAX {
            return Err(TIMESTAMP_OVERFLOW_FLAGS_OFFSET);
        }
        option[TIMESTAMP_OVERFLOW_FLAGS_OFFSET] = (overflow << 4) | flag;
        return Ok(());
    }

    let entry = &mut option[slot..slot + entry_len];
    match flag {
        TIMESTAMP_FLAG_ONLY => {
            NetworkEndian::write_u32(entry, bindings_ctx.ipv4_timestamp());
        }
        TIMESTAMP_FLAG_WITH_ADDR => {
            NetworkEndian::write_u32(&mut entry[..4], local_addr.into());
            NetworkEndian::write_u32(&mut entry[4..], bindings_ctx.ipv4_timestamp());
        }
        _ => {
            // Only the host named in the next slot fills it in.
            if Ipv4Addr::from(NetworkEndian::read_u32(&entry[..4])) != local_addr {
                return Ok(());
            }
            NetworkEndian::write_u32(&mut entry[4..], bindings_ctx.ipv4_timestamp());
        }
    }
    option[OPTION_POINTER_OFFSET] = pointer + entry_len as u8;
    Ok(())
}

/// A route option for an outgoing datagram.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RouteOption {
    /// Record the route taken, with room for `slots` addresses.
    Record {
        /// The number of addresses to reserve room for.
        slots: u8,
    },
    /// Loosely source route through the given addresses.
    Loose(Vec<Ipv4Addr>),
    /// Strictly source route through the given addresses.
    Strict(Vec<Ipv4Addr>),
}

/// A timestamp option for an outgoing datagram.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TimestampOption {
    /// Record timestamps only, with room for `slots` entries.
    TimestampOnly {
        /// The number of timestamps to reserve room for.
        slots: u8,
    },
    /// Record an address with each timestamp, with room for `slots` entries.
    WithAddress {
        /// The number of entries to reserve room for.
        slots: u8,
    },
    /// Record timestamps only at the given hosts.
    Prespecified(Vec<Ipv4Addr>),
}

/// A basic security option (RFC 1108) for an outgoing datagram.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SecurityOption {
    /// The classification level.
    pub classification: u8,
    /// The protection authority flags.
    pub protection_authority: u8,
}

/// An option to include in an outgoing datagram.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TxOption {
    /// A route option.
    Route(RouteOption),
    /// A timestamp option.
    Timestamp(TimestampOption),
    /// A security option.
    Security(SecurityOption),
}

/// Errors building outgoing options.
#[derive(Debug, Error, Eq, PartialEq)]
pub(crate) enum TxOptionsError {
    #[error("more than one route or timestamp option")]
    Exclusive,
    #[error("more than one security option")]
    DuplicateSecurity,
    #[error("option has no room for any entry")]
    Empty,
    #[error("options do not fit in the header")]
    TooLong,
}

impl TxOption {
    fn serialize_into(&self, buf: &mut Vec<u8>) -> Result<(), TxOptionsError> {
        fn slots_len(slots: usize, entry_len: usize, fixed: usize) -> Result<u8, TxOptionsError> {
            if slots == 0 {
                return Err(TxOptionsError::Empty);
            }
            slots
                .checked_mul(entry_len)
                .and_then(|len| len.checked_add(fixed))
                .filter(|len| *len <= MAX_OPTIONS_LEN)
                .map(|len| len as u8)
                .ok_or(TxOptionsError::TooLong)
        }

        fn route(
            buf: &mut Vec<u8>,
            kind: u8,
            slots: usize,
            addrs: &[Ipv4Addr],
        ) -> Result<(), TxOptionsError> {
            let len = slots_len(slots, 4, ROUTE_DATA_START)?;
            buf.extend_from_slice(&[kind, len, ROUTE_POINTER_MIN]);
            if addrs.is_empty() {
                buf.resize(buf.len() + slots * 4, 0);
            } else {
                addrs.iter().for_each(|addr| buf.extend_from_slice(&addr.octets()));
            }
            Ok(())
        }

        fn timestamp(
            buf: &mut Vec<u8>,
            flag: u8,
            slots: usize,
            entry_len: usize,
            addrs: &[Ipv4Addr],
        ) -> Result<(), TxOptionsError> {
            let len = slots_len(slots, entry_len, TIMESTAMP_DATA_START)?;
            buf.extend_from_slice(&[OPTION_TIMESTAMP, len, TIMESTAMP_POINTER_MIN, flag]);
            if addrs.is_empty() {
                buf.resize(buf.len() + slots * entry_len, 0);
            } else {
                for addr in addrs {
                    buf.extend_from_slice(&addr.octets());
                    buf.extend_from_slice(&[0; 4]);
                }
            }
            Ok(())
        }

        match self {
            TxOption::Route(RouteOption::Record { slots }) => {
                route(buf, OPTION_RECORD_ROUTE, usize::from(*slots), &[])
            }
            TxOption::Route(RouteOption::Loose(addrs)) => {
                route(buf, OPTION_LOOSE_SOURCE_ROUTE, addrs.len(), addrs)
            }
            TxOption::Route(RouteOption::Strict(addrs)) => {
                route(buf, OPTION_STRICT_SOURCE_ROUTE, addrs.len(), addrs)
            }
            TxOption::Timestamp(TimestampOption::TimestampOnly { slots }) => {
                timestamp(buf, TIMESTAMP_FLAG_ONLY, usize::from(*slots), 4, &[])
            }
            TxOption::Timestamp(TimestampOption::WithAddress { slots }) => {
                timestamp(buf, TIMESTAMP_FLAG_WITH_ADDR, usize::from(*slots), 8, &[])
            }
            TxOption::Timestamp(TimestampOption::Prespecified(addrs)) => {
                timestamp(buf, TIMESTAMP_FLAG_PRESPECIFIED, addrs.len(), 8, addrs)
            }
            TxOption::Security(SecurityOption { classification, protection_authority }) => {
                buf.extend_from_slice(&[
                    OPTION_SECURITY,
                    4,
                    *classification,
                    *protection_authority,
                ]);
                Ok(())
            }
        }
    }
}

/// Serializes `options`, padded with end-of-list octets to a multiple of
/// four bytes.
pub(crate) fn serialize_tx_options(options: &[TxOption]) -> Result<Vec<u8>, TxOptionsError> {
    let mut seen_exclusive = false;
    let mut seen_security = false;
    let mut buf = Vec::new();
    for option in options {
        let seen = match option {
            TxOption::Route(_) | TxOption::Timestamp(_) => &mut seen_exclusive,
            TxOption::Security(_) => &mut seen_security,
        };
        if core::mem::replace(seen, true) {
            return Err(match option {
                TxOption::Security(_) => TxOptionsError::DuplicateSecurity,
                TxOption::Route(_) | TxOption::Timestamp(_) => TxOptionsError::Exclusive,
            });
        }
        option.serialize_into(&mut buf)?;
    }
    let padded = (buf.len() + 3) & !3;
    if padded > MAX_OPTIONS_LEN {
        return Err(TxOptionsError::TooLong);
    }
    buf.resize(padded, OPTION_END_OF_LIST);
    Ok(buf)
}

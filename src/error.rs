// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Common error types for the IPv4 layer.

use thiserror::Error;

use crate::device::DeviceSendFrameError;

/// Error when something is not supported.
#[derive(Debug, PartialEq, Eq, Error)]
#[error("not supported")]
pub struct NotSupportedError;

/// Error when something unexpectedly doesn't exist, such as trying to
/// remove an element when the element is not present.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("not found")]
pub struct NotFoundError;

/// Error when there is no next hop for a destination.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("next hop unreachable")]
pub struct NextHopUnreachableError;

/// Errors that can occur when adding an address to a device.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddIpAddrError {
    /// The host address is already configured.
    #[error("address already exists")]
    Exists,
    /// The host address may not be assigned to a host.
    #[error("invalid host address")]
    InvalidAddr,
    /// The subnet mask is not a valid contiguous mask.
    #[error("invalid subnet mask")]
    InvalidMask,
    /// The default gateway is not a valid host on the address's subnet.
    #[error("invalid default gateway")]
    InvalidGateway,
    /// The device already holds the maximum number of addresses.
    #[error("address table full")]
    AddressTableFull,
    /// The device does not exist.
    #[error("device not found")]
    DeviceNotFound,
}

/// Errors that can occur while running dynamic address configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DynamicAddrError {
    /// The device does not exist.
    #[error("device not found")]
    DeviceNotFound,
    /// Dynamic configuration was not started on the device.
    #[error("dynamic configuration not in progress")]
    NotInDynamicInit,
    /// Dynamic configuration is already in progress on the device.
    #[error("dynamic configuration already in progress")]
    AlreadyInDynamicInit,
    /// The committed address was rejected.
    #[error(transparent)]
    Add(#[from] AddIpAddrError),
}

/// A transmit parameter rejected by validation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InvalidSendArgument {
    /// The source address is not usable on the egress device.
    Source,
    /// The destination address may not be sent to.
    Destination,
    /// The type-of-service value has its must-be-zero bit set.
    Tos,
    /// The flags contain bits other than "don't fragment".
    Flags,
    /// The options are malformed, too long or conflicting.
    Options,
    /// A datagram handed back for retransmission has a malformed header.
    Header,
}

/// Errors that can occur when sending an IPv4 datagram.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IpSendError {
    /// A caller-supplied value was rejected.
    #[error("invalid argument: {0:?}")]
    InvalidArgument(InvalidSendArgument),
    /// The egress device does not exist.
    #[error("device not found")]
    DeviceNotFound,
    /// The egress device is disabled.
    #[error("device disabled")]
    DeviceDisabled,
    /// The destination is off-link and no default gateway is configured.
    #[error("next hop unreachable")]
    NextHopUnreachable,
    /// The datagram would need to be fragmented.
    #[error("datagram too large: fragmentation not supported")]
    NotSupported,
    /// The link layer rejected the frame.
    #[error("link layer error: {0}")]
    Link(#[from] DeviceSendFrameError),
}

impl From<NextHopUnreachableError> for IpSendError {
    fn from(NextHopUnreachableError: NextHopUnreachableError) -> IpSendError {
        IpSendError::NextHopUnreachable
    }
}

impl From<NotSupportedError> for IpSendError {
    fn from(NotSupportedError: NotSupportedError) -> IpSendError {
        IpSendError::NotSupported
    }
}

/// Errors that can occur when starting link-local negotiation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StartLinkLocalError {
    /// The device does not exist.
    #[error("device not found")]
    DeviceNotFound,
    /// The device is disabled.
    #[error("device disabled")]
    DeviceDisabled,
    /// Negotiation is already running on the device.
    #[error("link-local negotiation already running")]
    AlreadyRunning,
}

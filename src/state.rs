// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Structs containing the entire stack state.

use parking_lot::{Mutex, MutexGuard};

use crate::{
    device::Devices,
    ip::{
        base::{Ipv4Config, Ipv4State, DEFAULT_HOP_LIMITS},
        link_local::{LinkLocalConfig, LinkLocalCounters},
        reassembly::{ReassemblyTimeout, DEFAULT_FRAGMENT_CACHE_THRESHOLD},
        ArpRetries, ArpRetryTimeout, HopLimits, Ipv4Counters,
    },
};

/// The default maximum number of addresses a single device may hold.
pub(crate) const DEFAULT_MAX_ADDRS_PER_DEVICE: usize = 4;

/// A builder for [`StackState`].
#[derive(Clone, Default)]
pub struct StackStateBuilder {
    ipv4: Ipv4StateBuilder,
}

impl StackStateBuilder {
    /// Get the builder for the IPv4 state.
    pub fn ipv4_builder(&mut self) -> &mut Ipv4StateBuilder {
        &mut self.ipv4
    }

    /// Consume this builder and produce a `StackState`.
    pub(crate) fn build(self) -> StackState {
        let StackStateBuilder { ipv4 } = self;
        StackState {
            locked: Mutex::new(LockedState { devices: Devices::default(), ipv4: ipv4.build() }),
            ipv4_counters: Default::default(),
            link_local_counters: Default::default(),
        }
    }
}

/// A builder for IPv4 state.
#[derive(Clone)]
pub struct Ipv4StateBuilder {
    reassembly_timeout: ReassemblyTimeout,
    hop_limits: HopLimits,
    default_tos: u8,
    max_addrs_per_device: usize,
    fragment_cache_threshold: usize,
    arp_retries: ArpRetries,
    arp_retry_timeout: ArpRetryTimeout,
}

impl Default for Ipv4StateBuilder {
    fn default() -> Ipv4StateBuilder {
        Ipv4StateBuilder {
            reassembly_timeout: ReassemblyTimeout::default(),
            hop_limits: DEFAULT_HOP_LIMITS,
            default_tos: 0,
            max_addrs_per_device: DEFAULT_MAX_ADDRS_PER_DEVICE,
            fragment_cache_threshold: DEFAULT_FRAGMENT_CACHE_THRESHOLD,
            arp_retries: ArpRetries::default(),
            arp_retry_timeout: ArpRetryTimeout::default(),
        }
    }
}

impl Ipv4StateBuilder {
    /// Sets how long an incomplete datagram is held before its fragments are
    /// discarded.
    pub fn reassembly_timeout(&mut self, timeout: ReassemblyTimeout) -> &mut Self {
        self.reassembly_timeout = timeout;
        self
    }

    /// Sets the TTLs used when a sender does not specify one.
    pub fn hop_limits(&mut self, hop_limits: HopLimits) -> &mut Self {
        self.hop_limits = hop_limits;
        self
    }

    /// Sets the type-of-service value used when a sender does not specify one.
    pub fn default_tos(&mut self, tos: u8) -> &mut Self {
        self.default_tos = tos;
        self
    }

    /// Sets the maximum number of addresses held by a single device.
    pub fn max_addrs_per_device(&mut self, max: usize) -> &mut Self {
        self.max_addrs_per_device = max;
        self
    }

    /// Sets the number of buffered fragment bytes above which new fragments
    /// are refused.
    pub fn fragment_cache_threshold(&mut self, bytes: usize) -> &mut Self {
        self.fragment_cache_threshold = bytes;
        self
    }

    /// Sets the number of ARP probe retries used by link-local negotiation.
    pub fn arp_retries(&mut self, retries: ArpRetries) -> &mut Self {
        self.arp_retries = retries;
        self
    }

    /// Sets the ARP retry timeout used by link-local negotiation.
    pub fn arp_retry_timeout(&mut self, timeout: ArpRetryTimeout) -> &mut Self {
        self.arp_retry_timeout = timeout;
        self
    }

    pub(crate) fn build(self) -> Ipv4State {
        let Ipv4StateBuilder {
            reassembly_timeout,
            hop_limits,
            default_tos,
            max_addrs_per_device,
            fragment_cache_threshold,
            arp_retries,
            arp_retry_timeout,
        } = self;
        Ipv4State::new(
            Ipv4Config {
                reassembly_timeout,
                hop_limits,
                default_tos,
                max_addrs_per_device,
                link_local: LinkLocalConfig { arp_retries, arp_retry_timeout },
            },
            fragment_cache_threshold,
        )
    }
}

/// The state associated with the network stack.
pub(crate) struct StackState {
    locked: Mutex<LockedState>,
    // Counters are atomics and live outside of the lock so they can be read
    // without contending with packet processing.
    ipv4_counters: Ipv4Counters,
    link_local_counters: LinkLocalCounters,
}

/// The portion of the stack state guarded by the stack lock.
pub(crate) struct LockedState {
    pub(crate) devices: Devices,
    pub(crate) ipv4: Ipv4State,
}

impl StackState {
    pub(crate) fn lock(&self) -> MutexGuard<'_, LockedState> {
        self.locked.lock()
    }

    pub(crate) fn ipv4_counters(&self) -> &Ipv4Counters {
        &self.ipv4_counters
    }

    pub(crate) fn link_local_counters(&self) -> &LinkLocalCounters {
        &self.link_local_counters
    }
}

#[cfg(test)]
mod tests {
    use core::time::Duration;

    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let mut builder = StackStateBuilder::default();
        let _: &mut Ipv4StateBuilder = builder
            .ipv4_builder()
            .reassembly_timeout(ReassemblyTimeout::new(Duration::from_secs(10)).unwrap())
            .max_addrs_per_device(2)
            .arp_retries(ArpRetries::new(1).unwrap());
        let state = builder.build();
        let locked = state.lock();
        let Ipv4Config { reassembly_timeout, hop_limits, default_tos, max_addrs_per_device, link_local } =
            &locked.ipv4.config;
        assert_eq!(reassembly_timeout.get(), Duration::from_secs(10));
        assert_eq!(hop_limits, &DEFAULT_HOP_LIMITS);
        assert_eq!(*default_tos, 0);
        assert_eq!(*max_addrs_per_device, 2);
        assert_eq!(link_local.arp_retries.get(), 1);
        assert_eq!(link_local.arp_retry_timeout, ArpRetryTimeout::default());
    }
}

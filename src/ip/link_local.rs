// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! IPv4 link-local address negotiation as defined by [RFC 3927].
//!
//! A device with no configured address picks a candidate in 169.254/16,
//! probes for it with ARP, and if nobody answers claims it and announces the
//! claim.
//!
//! [RFC 3927]: https://datatracker.ietf.org/doc/html/rfc3927

use core::time::Duration;
use std::net::Ipv4Addr;

use rand::Rng as _;
use tracing::{debug, trace};

use crate::{
    context::{BindingsContext, CoreCtx, CounterContext, SyncCtx, TimerContext, TimerHandler},
    counters::Counter,
    device::{DeviceId, DeviceState, Devices, Mac},
    error::{NotFoundError, StartLinkLocalError},
    ip::{
        address::{LINK_LOCAL_HOST_MAX, LINK_LOCAL_HOST_MIN, LINK_LOCAL_MASK},
        device::{
            add_ipv4_addr_entry, del_ipv4_addr_entries_with,
            state::{AddrConfigMode, Ipv4AddressEntry, Ipv4DeviceState},
            Ipv4DeviceEvent,
        },
    },
    state::LockedState,
    time::TimerId,
    EventContext as _,
};

/// Time added to the probe wait after the last probe retry.
const PROBE_WAIT_EXTRA: Duration = Duration::from_secs(1);

/// The number of announcements sent after claiming an address.
const ANNOUNCE_NUM: u8 = 2;

/// The time between announcements.
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(2);

// FNV-1a, used to spread hardware addresses over the candidate range.
const FNV_OFFSET_BASIS: u32 = 0x811C_9DC5;
const FNV_PRIME: u32 = 0x0100_0193;

/// The number of ARP probe retries covered by the probe wait.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ArpRetries(u8);

impl ArpRetries {
    const MAX: u8 = 5;
    const DEFAULT: u8 = 3;

    /// Creates a retry count, which must be at most 5.
    pub fn new(retries: u8) -> Option<ArpRetries> {
        (retries <= Self::MAX).then_some(ArpRetries(retries))
    }

    /// Returns the retry count.
    pub fn get(self) -> u8 {
        let ArpRetries(retries) = self;
        retries
    }
}

impl Default for ArpRetries {
    fn default() -> ArpRetries {
        ArpRetries(Self::DEFAULT)
    }
}

/// The ARP retry timeout covered by the probe wait.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ArpRetryTimeout(Duration);

impl ArpRetryTimeout {
    const MIN: Duration = Duration::from_secs(1);
    const MAX: Duration = Duration::from_secs(10);
    const DEFAULT: Duration = Duration::from_secs(5);

    /// Creates a timeout, which must be between 1 and 10 seconds inclusive.
    pub fn new(timeout: Duration) -> Option<ArpRetryTimeout> {
        (Self::MIN..=Self::MAX).contains(&timeout).then_some(ArpRetryTimeout(timeout))
    }

    /// Returns the timeout.
    pub fn get(self) -> Duration {
        let ArpRetryTimeout(timeout) = self;
        timeout
    }
}

impl Default for ArpRetryTimeout {
    fn default() -> ArpRetryTimeout {
        ArpRetryTimeout(Self::DEFAULT)
    }
}

#[derive(Clone)]
pub(crate) struct LinkLocalConfig {
    pub(crate) arp_retries: ArpRetries,
    pub(crate) arp_retry_timeout: ArpRetryTimeout,
}

impl LinkLocalConfig {
    /// How long to wait for an answer to a probe.
    fn probe_wait(&self) -> Duration {
        self.arp_retry_timeout.get() * u32::from(self.arp_retries.get()) + PROBE_WAIT_EXTRA
    }
}

/// Link-local negotiation counters.
#[derive(Default)]
pub struct LinkLocalCounters {
    /// Count of ARP probes sent.
    pub probes_sent: Counter,
    /// Count of candidates found to be in use by another host.
    pub conflicts: Counter,
    /// Count of ARP announcements sent.
    pub announcements_sent: Counter,
    /// Count of addresses claimed.
    pub addresses_claimed: Counter,
}

impl CounterContext<LinkLocalCounters> for CoreCtx<'_> {
    fn with_counters<O, F: FnOnce(&LinkLocalCounters) -> O>(&self, cb: F) -> O {
        cb(self.state.link_local_counters())
    }
}

/// The timer driving a negotiation.
///
/// `generation` identifies the candidate the timer was installed for; a timer
/// whose generation no longer matches the device's negotiation is stale.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub(crate) struct LinkLocalTimerId<D> {
    pub(crate) device_id: D,
    pub(crate) generation: u64,
}

/// The outcome of link-local negotiation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LinkLocalResult {
    /// The address was claimed and announced.
    Success(Ipv4Addr),
    /// Negotiation was stopped before it completed.
    Failure,
}

/// The result of starting link-local negotiation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LinkLocalStart {
    /// Negotiation started.
    Started,
    /// The device already has an address; nothing was done.
    AlreadyConfigured,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum LinkLocalPhase {
    /// Waiting for an answer to a probe for the candidate.
    ValidateAddr,
    /// The candidate is claimed; `sent` announcements have gone out.
    AnnounceAddr { sent: u8 },
}

/// Negotiation in progress on a device.
#[derive(Debug)]
pub(crate) struct LinkLocalState {
    candidate: Ipv4Addr,
    phase: LinkLocalPhase,
    generation: u64,
}

impl LinkLocalState {
    fn timer_id(&self, device_id: DeviceId) -> TimerId {
        TimerId::from(LinkLocalTimerId { device_id, generation: self.generation })
    }
}

/// Takes the next negotiation generation of a device.
fn next_generation(ip: &mut Ipv4DeviceState) -> u64 {
    let generation = ip.link_local_generation;
    ip.link_local_generation = generation.wrapping_add(1);
    generation
}

/// Picks a candidate in the range of claimable link-local addresses.
fn new_candidate<BC: BindingsContext>(bindings_ctx: &mut BC, mac: Mac) -> Ipv4Addr {
    let hash = mac
        .bytes()
        .iter()
        .fold(FNV_OFFSET_BASIS, |hash, byte| (hash ^ u32::from(*byte)).wrapping_mul(FNV_PRIME));
    let mixed = hash ^ bindings_ctx.rng().gen::<u32>();
    let min = u32::from(LINK_LOCAL_HOST_MIN);
    let span = u32::from(LINK_LOCAL_HOST_MAX) - min + 1;
    Ipv4Addr::from(min + mixed % span)
}

fn probe<BC: BindingsContext>(
    bindings_ctx: &mut BC,
    counters: &LinkLocalCounters,
    config: &LinkLocalConfig,
    device: &DeviceId,
    state: &LinkLocalState,
) {
    trace!("probing link-local candidate {} on {:?}", state.candidate, device);
    bindings_ctx.send_probe(device, state.candidate);
    counters.probes_sent.increment();
    let _: Option<BC::Instant> =
        bindings_ctx.schedule_timer(config.probe_wait(), state.timer_id(*device));
}

fn announce<BC: BindingsContext>(
    bindings_ctx: &mut BC,
    counters: &LinkLocalCounters,
    device: &DeviceId,
    addr: Ipv4Addr,
) {
    bindings_ctx.send_announcement(device, addr);
    counters.announcements_sent.increment();
}

/// Starts link-local negotiation on `device`.
///
/// Nothing is done if the device already has an address. Completion is
/// reported through [`Ipv4DeviceEvent::LinkLocalCompleted`].
pub fn start_link_local<BC: BindingsContext>(
    core_ctx: &SyncCtx,
    bindings_ctx: &mut BC,
    device: &DeviceId,
) -> Result<LinkLocalStart, StartLinkLocalError> {
    let mut core_ctx = core_ctx.lock();
    let CoreCtx { locked, state } = &mut core_ctx;
    let counters = state.link_local_counters();
    let LockedState { devices, ipv4 } = &mut **locked;

    let device_state =
        devices.get_mut(device).map_err(|NotFoundError| StartLinkLocalError::DeviceNotFound)?;
    if !device_state.enabled {
        return Err(StartLinkLocalError::DeviceDisabled);
    }
    if device_state.ip.link_local.is_some() {
        return Err(StartLinkLocalError::AlreadyRunning);
    }
    if !device_state.ip.addrs.is_empty() {
        debug!("start_link_local: {:?} already has an address", device);
        return Ok(LinkLocalStart::AlreadyConfigured);
    }

    let state = LinkLocalState {
        candidate: new_candidate(bindings_ctx, device_state.mac),
        phase: LinkLocalPhase::ValidateAddr,
        generation: next_generation(&mut device_state.ip),
    };
    debug!("start_link_local: starting negotiation on {:?}", device);
    probe(bindings_ctx, counters, &ipv4.config.link_local, device, &state);
    device_state.ip.link_local = Some(state);
    Ok(LinkLocalStart::Started)
}

/// Stops link-local negotiation on `device`.
///
/// A claimed address that is still being announced is removed. Does nothing
/// if negotiation is not running.
pub fn stop_link_local<BC: BindingsContext>(
    core_ctx: &SyncCtx,
    bindings_ctx: &mut BC,
    device: &DeviceId,
) -> Result<(), NotFoundError> {
    let mut core_ctx = core_ctx.lock();
    let _: &DeviceState = core_ctx.locked.devices.get(device)?;
    fail(&mut core_ctx.locked.devices, bindings_ctx, device);
    Ok(())
}

/// Stops negotiation on a device whose link went down.
pub(crate) fn handle_link_down<BC: BindingsContext>(
    core_ctx: &mut CoreCtx<'_>,
    bindings_ctx: &mut BC,
    device: &DeviceId,
) {
    fail(&mut core_ctx.locked.devices, bindings_ctx, device)
}

/// Abandons negotiation on `device`, reporting failure.
fn fail<BC: BindingsContext>(devices: &mut Devices, bindings_ctx: &mut BC, device: &DeviceId) {
    let Ok(state) = devices.get_mut(device) else {
        return;
    };
    let Some(link_local) = state.ip.link_local.take() else {
        return;
    };
    let _: Option<BC::Instant> = bindings_ctx.cancel_timer(link_local.timer_id(*device));
    let LinkLocalState { candidate, phase, generation: _ } = link_local;
    match phase {
        LinkLocalPhase::ValidateAddr => {}
        LinkLocalPhase::AnnounceAddr { sent: _ } => {
            let _: Vec<Ipv4AddressEntry> =
                del_ipv4_addr_entries_with(&mut state.ip, bindings_ctx, |entry| {
                    entry.addr == candidate && entry.config_mode == AddrConfigMode::LinkLocal
                });
        }
    }
    debug!("link-local negotiation on {:?} failed", device);
    bindings_ctx.on_event(Ipv4DeviceEvent::LinkLocalCompleted {
        device: *device,
        result: LinkLocalResult::Failure,
    });
}

/// Handles another host claiming `addr` on `device`.
///
/// Returns true if `addr` was the candidate being probed, in which case a new
/// candidate is probed.
pub(crate) fn handle_address_conflict<BC: BindingsContext>(
    core_ctx: &mut CoreCtx<'_>,
    bindings_ctx: &mut BC,
    device: &DeviceId,
    addr: Ipv4Addr,
) -> bool {
    let CoreCtx { locked, state } = core_ctx;
    let counters = state.link_local_counters();
    let LockedState { devices, ipv4 } = &mut **locked;
    let Ok(device_state) = devices.get_mut(device) else {
        return false;
    };
    let mac = device_state.mac;
    match &device_state.ip.link_local {
        Some(LinkLocalState { candidate, phase: LinkLocalPhase::ValidateAddr, generation: _ })
            if *candidate == addr => {}
        Some(_) | None => return false,
    }
    let Some(old) = device_state.ip.link_local.take() else {
        return false;
    };
    let _: Option<BC::Instant> = bindings_ctx.cancel_timer(old.timer_id(*device));
    counters.conflicts.increment();
    let state = LinkLocalState {
        candidate: new_candidate(bindings_ctx, mac),
        phase: LinkLocalPhase::ValidateAddr,
        generation: next_generation(&mut device_state.ip),
    };
    debug!("link-local candidate {} on {:?} is taken, trying {}", addr, device, state.candidate);
    probe(bindings_ctx, counters, &ipv4.config.link_local, device, &state);
    device_state.ip.link_local = Some(state);
    true
}

impl<BC: BindingsContext> TimerHandler<BC, LinkLocalTimerId<DeviceId>> for CoreCtx<'_> {
    fn handle_timer(
        &mut self,
        bindings_ctx: &mut BC,
        LinkLocalTimerId { device_id, generation }: LinkLocalTimerId<DeviceId>,
    ) {
        let CoreCtx { locked, state } = self;
        let counters = state.link_local_counters();
        let LockedState { devices, ipv4 } = &mut **locked;
        let Ok(device_state) = devices.get_mut(&device_id) else {
            return;
        };
        let mac = device_state.mac;
        let (candidate, phase) = match device_state.ip.link_local {
            Some(LinkLocalState { candidate, phase, generation: current })
                if current == generation =>
            {
                (candidate, phase)
            }
            Some(_) | None => {
                trace!("ignoring stale link-local timer for {:?}", device_id);
                return;
            }
        };
        let config = &ipv4.config;

        match phase {
            LinkLocalPhase::ValidateAddr => {
                if let Some(owner) = bindings_ctx.lookup(&device_id, candidate) {
                    counters.conflicts.increment();
                    let state = LinkLocalState {
                        candidate: new_candidate(bindings_ctx, mac),
                        phase: LinkLocalPhase::ValidateAddr,
                        generation: next_generation(&mut device_state.ip),
                    };
                    debug!("link-local candidate is held by {}, trying {}", owner, state.candidate);
                    probe(bindings_ctx, counters, &config.link_local, &device_id, &state);
                    device_state.ip.link_local = Some(state);
                    return;
                }

                let entry = Ipv4AddressEntry::new(
                    candidate,
                    LINK_LOCAL_MASK,
                    None,
                    AddrConfigMode::LinkLocal,
                );
                match add_ipv4_addr_entry(devices, config.max_addrs_per_device, &device_id, entry) {
                    Ok(()) => {}
                    Err(err) => {
                        debug!("failed to claim link-local address {}: {}", candidate, err);
                        fail(devices, bindings_ctx, &device_id);
                        return;
                    }
                }
                counters.addresses_claimed.increment();
                debug!("claimed link-local address {} on {:?}", candidate, device_id);
                announce(bindings_ctx, counters, &device_id, candidate);
                let state = LinkLocalState {
                    candidate,
                    phase: LinkLocalPhase::AnnounceAddr { sent: 1 },
                    generation,
                };
                let _: Option<BC::Instant> =
                    bindings_ctx.schedule_timer(ANNOUNCE_INTERVAL, state.timer_id(device_id));
                if let Ok(device_state) = devices.get_mut(&device_id) {
                    device_state.ip.link_local = Some(state);
                }
            }
            LinkLocalPhase::AnnounceAddr { sent } => {
                announce(bindings_ctx, counters, &device_id, candidate);
                let sent = sent + 1;
                if sent < ANNOUNCE_NUM {
                    let state = LinkLocalState {
                        candidate,
                        phase: LinkLocalPhase::AnnounceAddr { sent },
                        generation,
                    };
                    let _: Option<BC::Instant> =
                        bindings_ctx.schedule_timer(ANNOUNCE_INTERVAL, state.timer_id(device_id));
                    device_state.ip.link_local = Some(state);
                    return;
                }
                device_state.ip.link_local = None;
                debug!("link-local negotiation on {:?} completed with {}", device_id, candidate);
                bindings_ctx.on_event(Ipv4DeviceEvent::LinkLocalCompleted {
                    device: device_id,
                    result: LinkLocalResult::Success(candidate),
                });
            }
        }
    }
}

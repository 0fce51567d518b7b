// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Execution contexts.
//!
//! The IPv4 layer never reaches for a clock, a timer wheel, a random number
//! generator or a link-layer driver on its own. Every entry point takes a
//! bindings context implementing [`BindingsContext`], and all side effects
//! (installing a timer, emitting a frame, notifying the embedder) go through
//! it. Tests substitute the fakes in [`testutil`].

use core::time::Duration;

use parking_lot::MutexGuard;
use rand::{CryptoRng, RngCore};

use crate::{
    device::{arp::ArpDispatcher, DeviceId, DeviceLayerEventDispatcher},
    ip::{
        device::Ipv4DeviceEvent, icmp::IcmpErrorDispatcher, options::Ipv4TimestampContext,
    },
    state::{LockedState, StackState, StackStateBuilder},
    time::TimerId,
    transport::TransportDispatcher,
    Instant,
};

/// A context that provides access to a monotonic clock.
pub trait InstantContext {
    /// The type of an instant in time.
    ///
    /// Timer deadlines are expressed in this type, so it is usually whatever
    /// the embedder's timer facility accepts.
    type Instant: Instant + 'static;

    /// Returns the current instant.
    ///
    /// Two subsequent calls never go backwards.
    fn now(&self) -> Self::Instant;
}

/// A context that supports scheduling timers.
///
/// Timers are one-shot and keyed by `Id`; at most one timer per `Id` is
/// installed at a time.
pub trait TimerContext<Id>: InstantContext {
    /// Schedules `id` to fire after `duration`, replacing any timer already
    /// installed for `id`.
    ///
    /// Returns the deadline of the replaced timer, if any. A deadline that
    /// overflows `Self::Instant` installs nothing and returns `None`.
    fn schedule_timer(&mut self, duration: Duration, id: Id) -> Option<Self::Instant> {
        let time = self.now().checked_add(duration)?;
        self.schedule_timer_instant(time, id)
    }

    /// Schedules `id` to fire at `time`, replacing any timer already
    /// installed for `id`.
    ///
    /// Returns the deadline of the replaced timer, if any.
    fn schedule_timer_instant(&mut self, time: Self::Instant, id: Id) -> Option<Self::Instant>;

    /// Cancels the timer for `id`, returning its deadline if one was
    /// installed.
    fn cancel_timer(&mut self, id: Id) -> Option<Self::Instant>;
}

/// A handler for timer firing events.
pub(crate) trait TimerHandler<BC, Id> {
    /// Handles the expiry of the timer `id`.
    fn handle_timer(&mut self, bindings_ctx: &mut BC, id: Id);
}

/// A context that provides a random number generator.
///
/// All randomness in the crate comes from here so that tests can run with a
/// seeded generator.
pub trait RngContext {
    /// The random number generator.
    ///
    /// Link-local candidates are drawn from it, so it must not be predictable
    /// by other hosts on the link.
    type Rng<'a>: RngCore + CryptoRng
    where
        Self: 'a;

    /// Gets the random number generator.
    fn rng(&mut self) -> Self::Rng<'_>;
}

/// A context that provides access to a set of counters.
pub(crate) trait CounterContext<T> {
    /// Calls `cb` with the counters.
    fn with_counters<O, F: FnOnce(&T) -> O>(&self, cb: F) -> O;
}

/// A context for emitting events to the embedder.
///
/// Events must be handled in the order they are emitted.
pub trait EventContext<T> {
    /// Handles `event`.
    fn on_event(&mut self, event: T);
}

/// The execution context provided by bindings.
///
/// Everything the IPv4 layer needs from outside of itself is reached through
/// this trait: the clock and timers, randomness, the link layer, address
/// resolution, the transport sinks and the ICMP error sender.
pub trait BindingsContext:
    InstantContext
    + RngContext
    + TimerContext<TimerId>
    + EventContext<Ipv4DeviceEvent<DeviceId>>
    + DeviceLayerEventDispatcher
    + ArpDispatcher
    + TransportDispatcher
    + IcmpErrorDispatcher
    + Ipv4TimestampContext
{
}

impl<
        BC: InstantContext
            + RngContext
            + TimerContext<TimerId>
            + EventContext<Ipv4DeviceEvent<DeviceId>>
            + DeviceLayerEventDispatcher
            + ArpDispatcher
            + TransportDispatcher
            + IcmpErrorDispatcher
            + Ipv4TimestampContext,
    > BindingsContext for BC
{
}

/// The synchronized context.
pub struct SyncCtx {
    /// Contains the state of the stack.
    pub(crate) state: StackState,
}

impl SyncCtx {
    /// Create a new `SyncCtx`.
    pub fn new(builder: StackStateBuilder) -> SyncCtx {
        SyncCtx { state: builder.build() }
    }

    /// Acquires the stack lock.
    ///
    /// The lock is not reentrant; it must not be held across a call back into
    /// a public entry point.
    pub(crate) fn lock(&self) -> CoreCtx<'_> {
        CoreCtx { locked: self.state.lock(), state: &self.state }
    }
}

/// The core context: the stack state with its lock held.
pub(crate) struct CoreCtx<'a> {
    pub(crate) locked: MutexGuard<'a, LockedState>,
    pub(crate) state: &'a StackState,
}

/// Fake implementations of the context traits.
#[cfg(test)]
pub(crate) mod testutil {
    use alloc::{boxed::Box, vec::Vec};
    use core::{
        fmt::{self, Debug, Formatter},
        hash::Hash,
        ops,
    };
    use std::collections::HashMap;

    use rand_xorshift::XorShiftRng;

    use super::*;
    use crate::testutil::FakeCryptoRng;

    /// A fake [`Instant`]: an offset from an arbitrary epoch.
    #[derive(Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
    pub(crate) struct FakeInstant {
        offset: Duration,
    }

    impl From<Duration> for FakeInstant {
        fn from(offset: Duration) -> FakeInstant {
            FakeInstant { offset }
        }
    }

    impl Instant for FakeInstant {
        fn duration_since(&self, earlier: FakeInstant) -> Duration {
            self.offset.checked_sub(earlier.offset).unwrap()
        }

        fn saturating_duration_since(&self, earlier: FakeInstant) -> Duration {
            self.offset.saturating_sub(earlier.offset)
        }

        fn checked_add(&self, duration: Duration) -> Option<FakeInstant> {
            self.offset.checked_add(duration).map(FakeInstant::from)
        }

        fn checked_sub(&self, duration: Duration) -> Option<FakeInstant> {
            self.offset.checked_sub(duration).map(FakeInstant::from)
        }
    }

    impl ops::Add<Duration> for FakeInstant {
        type Output = FakeInstant;

        fn add(self, dur: Duration) -> FakeInstant {
            FakeInstant { offset: self.offset + dur }
        }
    }

    impl Debug for FakeInstant {
        fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
            write!(f, "{:?}", self.offset)
        }
    }

    /// A fake [`TimerContext`] with a manually advanced clock.
    ///
    /// Timers are kept in installation order; the earliest deadline fires
    /// first and ties fire in installation order.
    pub(crate) struct FakeTimerCtx<Id> {
        now: FakeInstant,
        timers: Vec<(FakeInstant, Id)>,
    }

    impl<Id> Default for FakeTimerCtx<Id> {
        fn default() -> FakeTimerCtx<Id> {
            FakeTimerCtx { now: FakeInstant::default(), timers: Vec::new() }
        }
    }

    impl<Id> FakeTimerCtx<Id> {
        /// Advances the clock by `dur` without firing any timer.
        pub(crate) fn sleep(&mut self, dur: Duration) {
            self.now = self.now + dur;
        }

        /// Removes the timer with the earliest deadline and moves the clock
        /// to it.
        fn pop_next(&mut self) -> Option<Id> {
            let (idx, _) = self
                .timers
                .iter()
                .enumerate()
                .min_by(|(a_idx, (a, _)), (b_idx, (b, _))| a.cmp(b).then(a_idx.cmp(b_idx)))?;
            let (time, id) = self.timers.remove(idx);
            self.now = time;
            Some(id)
        }

        fn next_deadline(&self) -> Option<FakeInstant> {
            self.timers.iter().map(|(time, _)| *time).min()
        }
    }

    impl<Id: Clone> FakeTimerCtx<Id> {
        /// Returns the installed timers, earliest deadline first.
        pub(crate) fn timers(&self) -> Vec<(FakeInstant, Id)> {
            let mut timers = self.timers.clone();
            timers.sort_by_key(|(time, _)| *time);
            timers
        }
    }

    impl<Id: Debug + Clone + Hash + Eq> FakeTimerCtx<Id> {
        /// Asserts that exactly the timers in `expected` are installed, each
        /// with the given deadline.
        #[track_caller]
        pub(crate) fn assert_timers_installed<I: IntoIterator<Item = (Id, FakeInstant)>>(
            &self,
            expected: I,
        ) {
            let mut expected = expected.into_iter().fold(HashMap::new(), |mut map, (id, time)| {
                assert_eq!(map.insert(id.clone(), time), None, "timer {:?} expected twice", id);
                map
            });
            let mut unexpected = Vec::new();
            for (time, id) in self.timers.iter() {
                match expected.remove(id) {
                    Some(want) if want == *time => {}
                    want => unexpected.push((id.clone(), *time, want)),
                }
            }
            if !unexpected.is_empty() || !expected.is_empty() {
                panic!(
                    "unexpected timer contents: installed but not expected (id, deadline, \
                     wanted) {:?}; expected but missing {:?}",
                    unexpected, expected
                );
            }
        }

        /// Asserts that no timers are installed.
        #[track_caller]
        pub(crate) fn assert_no_timers_installed(&self) {
            self.assert_timers_installed([]);
        }
    }

    impl<Id> InstantContext for FakeTimerCtx<Id> {
        type Instant = FakeInstant;

        fn now(&self) -> FakeInstant {
            self.now
        }
    }

    impl<Id: PartialEq> TimerContext<Id> for FakeTimerCtx<Id> {
        fn schedule_timer_instant(&mut self, time: FakeInstant, id: Id) -> Option<FakeInstant> {
            let prev = self.cancel_timer_ref(&id);
            self.timers.push((time, id));
            prev
        }

        fn cancel_timer(&mut self, id: Id) -> Option<FakeInstant> {
            self.cancel_timer_ref(&id)
        }
    }

    impl<Id: PartialEq> FakeTimerCtx<Id> {
        fn cancel_timer_ref(&mut self, id: &Id) -> Option<FakeInstant> {
            let idx = self.timers.iter().position(|(_, installed)| installed == id)?;
            let (time, _) = self.timers.remove(idx);
            Some(time)
        }
    }

    /// Timer-driving helpers for anything that holds a [`FakeTimerCtx`].
    pub(crate) trait FakeTimerCtxExt<Id>: Sized {
        fn fake_timer_ctx_mut(&mut self) -> &mut FakeTimerCtx<Id>;

        /// Fires the timer with the earliest deadline, if any.
        ///
        /// The clock is moved to the timer's deadline before `f` is called
        /// with `ctx`, `self` and the timer's id. Returns the id.
        fn trigger_next_timer<C, F: FnMut(C, &mut Self, Id)>(
            &mut self,
            ctx: C,
            mut f: F,
        ) -> Option<Id>
        where
            Id: Clone,
        {
            let id = self.fake_timer_ctx_mut().pop_next()?;
            f(ctx, self, id.clone());
            Some(id)
        }

        /// Moves the clock forward by `duration`, firing every timer whose
        /// deadline falls within it, inclusive.
        ///
        /// Returns the ids of the timers fired, in firing order.
        fn trigger_timers_for<F: FnMut(&mut Self, Id)>(
            &mut self,
            duration: Duration,
            mut f: F,
        ) -> Vec<Id>
        where
            Id: Clone,
        {
            let timers = self.fake_timer_ctx_mut();
            let until = timers.now + duration;
            let mut fired = Vec::new();
            while self.fake_timer_ctx_mut().next_deadline().map_or(false, |time| time <= until) {
                if let Some(id) = self.trigger_next_timer((), |(), this, id| f(this, id)) {
                    fired.push(id);
                }
            }
            self.fake_timer_ctx_mut().now = until;
            fired
        }
    }

    impl<Id> FakeTimerCtxExt<Id> for FakeTimerCtx<Id> {
        fn fake_timer_ctx_mut(&mut self) -> &mut FakeTimerCtx<Id> {
            self
        }
    }

    /// A fake frame sink recording every frame handed to it.
    pub(crate) struct FakeFrameCtx<Meta> {
        frames: Vec<(Meta, Vec<u8>)>,
        should_error_for_frame: Option<Box<dyn Fn(&Meta) -> bool>>,
    }

    impl<Meta> FakeFrameCtx<Meta> {
        /// Makes the sink reject every frame for which `f` returns true.
        pub(crate) fn set_should_error_for_frame<F: Fn(&Meta) -> bool + 'static>(&mut self, f: F) {
            self.should_error_for_frame = Some(Box::new(f));
        }

        /// Returns whether the frame described by `meta` should be rejected.
        pub(crate) fn should_error_for_frame(&self, meta: &Meta) -> bool {
            self.should_error_for_frame.as_ref().map_or(false, |f| f(meta))
        }

        /// Takes all frames recorded so far.
        pub(crate) fn take_frames(&mut self) -> Vec<(Meta, Vec<u8>)> {
            core::mem::take(&mut self.frames)
        }

        pub(crate) fn push(&mut self, meta: Meta, frame: Vec<u8>) {
            self.frames.push((meta, frame))
        }
    }

    impl<Meta> Default for FakeFrameCtx<Meta> {
        fn default() -> FakeFrameCtx<Meta> {
            FakeFrameCtx { frames: Vec::new(), should_error_for_frame: None }
        }
    }

    /// A fake bindings context.
    ///
    /// Provides the clock, timers, a seeded RNG and an event log; `State`
    /// carries whatever else a test needs to record or answer with.
    pub(crate) struct FakeBindingsCtx<TimerId, Event, State> {
        rng: FakeCryptoRng<XorShiftRng>,
        timers: FakeTimerCtx<TimerId>,
        events: Vec<Event>,
        state: State,
    }

    impl<TimerId, Event, State: Default> Default for FakeBindingsCtx<TimerId, Event, State> {
        fn default() -> Self {
            Self {
                rng: FakeCryptoRng::new_xorshift(0),
                timers: FakeTimerCtx::default(),
                events: Vec::new(),
                state: Default::default(),
            }
        }
    }

    impl<TimerId, Event, State> FakeBindingsCtx<TimerId, Event, State> {
        /// Reseeds the RNG.
        pub(crate) fn seed_rng(&mut self, seed: u128) {
            self.rng = FakeCryptoRng::new_xorshift(seed);
        }

        pub(crate) fn timer_ctx(&self) -> &FakeTimerCtx<TimerId> {
            &self.timers
        }

        /// Takes the events emitted so far.
        pub(crate) fn take_events(&mut self) -> Vec<Event> {
            core::mem::take(&mut self.events)
        }

        pub(crate) fn state(&self) -> &State {
            &self.state
        }

        pub(crate) fn state_mut(&mut self) -> &mut State {
            &mut self.state
        }
    }

    impl<TimerId, Event, State> RngContext for FakeBindingsCtx<TimerId, Event, State> {
        type Rng<'a> = FakeCryptoRng<XorShiftRng> where Self: 'a;

        fn rng(&mut self) -> Self::Rng<'_> {
            self.rng.clone()
        }
    }

    impl<TimerId, Event, State> InstantContext for FakeBindingsCtx<TimerId, Event, State> {
        type Instant = FakeInstant;

        fn now(&self) -> FakeInstant {
            self.timers.now()
        }
    }

    impl<Id: PartialEq, Event, State> TimerContext<Id> for FakeBindingsCtx<Id, Event, State> {
        fn schedule_timer_instant(&mut self, time: FakeInstant, id: Id) -> Option<FakeInstant> {
            self.timers.schedule_timer_instant(time, id)
        }

        fn cancel_timer(&mut self, id: Id) -> Option<FakeInstant> {
            self.timers.cancel_timer(id)
        }
    }

    impl<Id, Event, State> EventContext<Event> for FakeBindingsCtx<Id, Event, State> {
        fn on_event(&mut self, event: Event) {
            self.events.push(event)
        }
    }

    impl<Id, Event, State> FakeTimerCtxExt<Id> for FakeBindingsCtx<Id, Event, State> {
        fn fake_timer_ctx_mut(&mut self) -> &mut FakeTimerCtx<Id> {
            &mut self.timers
        }
    }

    #[cfg(test)]
    mod tests {
        use alloc::vec;

        use super::*;

        const ONE_SEC: Duration = Duration::from_secs(1);

        fn at(secs: u64) -> FakeInstant {
            FakeInstant::from(Duration::from_secs(secs))
        }

        #[test]
        fn earliest_timer_fires_first() {
            let mut ctx = FakeTimerCtx::<usize>::default();
            assert_eq!(ctx.trigger_next_timer((), |(), _, _| {}), None);

            assert_eq!(ctx.schedule_timer(Duration::from_secs(2), 1), None);
            assert_eq!(ctx.schedule_timer(ONE_SEC, 0), None);
            assert_eq!(ctx.schedule_timer(Duration::from_secs(2), 2), None);

            let mut fired: Vec<(usize, FakeInstant)> = Vec::new();
            let mut record =
                |fired: &mut Vec<(usize, FakeInstant)>, ctx: &mut FakeTimerCtx<usize>, id: usize| {
                    fired.push((id, ctx.now()))
                };
            assert_eq!(ctx.trigger_next_timer(&mut fired, &mut record), Some(0));
            assert_eq!(ctx.trigger_next_timer(&mut fired, &mut record), Some(1));
            assert_eq!(ctx.trigger_next_timer(&mut fired, &mut record), Some(2));
            assert_eq!(ctx.trigger_next_timer(&mut fired, &mut record), None);
            assert_eq!(fired, vec![(0, at(1)), (1, at(2)), (2, at(2))]);
        }

        #[test]
        fn reschedule_replaces_and_cancel_removes() {
            let mut ctx = FakeTimerCtx::<usize>::default();
            assert_eq!(ctx.schedule_timer(Duration::ZERO, 0), None);
            assert_eq!(ctx.schedule_timer(ONE_SEC, 0), Some(at(0)));
            ctx.assert_timers_installed([(0, at(1))]);
            assert_eq!(ctx.cancel_timer(0), Some(at(1)));
            assert_eq!(ctx.cancel_timer(0), None);
            ctx.assert_no_timers_installed();
        }

        #[test]
        fn trigger_timers_for_is_inclusive() {
            let mut ctx = FakeTimerCtx::<usize>::default();
            assert_eq!(ctx.schedule_timer(ONE_SEC, 0), None);
            assert_eq!(ctx.schedule_timer(Duration::from_secs(3), 1), None);
            assert_eq!(ctx.schedule_timer(Duration::from_secs(5), 2), None);
            assert_eq!(ctx.trigger_timers_for(Duration::from_secs(3), |_, _| {}), vec![0, 1]);
            assert_eq!(ctx.now(), at(3));
            assert_eq!(ctx.timers(), vec![(at(5), 2)]);
        }

        #[test]
        fn schedule_timer_overflow_is_not_installed() {
            let mut ctx = FakeTimerCtx::<usize>::default();
            ctx.sleep(ONE_SEC);
            assert_eq!(ctx.schedule_timer(Duration::MAX, 0), None);
            ctx.assert_no_timers_installed();
        }
    }
}

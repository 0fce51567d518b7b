// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Instants and timer dispatch.

use core::{fmt::Debug, time::Duration};

use tracing::trace;

use crate::{
    context::{BindingsContext, SyncCtx, TimerHandler},
    device::DeviceId,
    ip::{link_local::LinkLocalTimerId, reassembly::FragmentTimerId},
};

/// A type representing an instant in time.
///
/// `Instant` can be implemented by any type which represents an instant in
/// time. This can include any sort of real-world clock time (e.g.,
/// [`std::time::Instant`]) or fake time such as in testing.
pub trait Instant: Sized + Ord + Copy + Clone + Debug + Send + Sync {
    /// Returns the amount of time elapsed from another instant to this one.
    ///
    /// # Panics
    ///
    /// This function will panic if `earlier` is later than `self`.
    fn duration_since(&self, earlier: Self) -> Duration;

    /// Returns the amount of time elapsed from another instant to this one,
    /// saturating at zero.
    fn saturating_duration_since(&self, earlier: Self) -> Duration;

    /// Returns `Some(t)` where `t` is the time `self + duration` if `t` can be
    /// represented as `Instant` (which means it's inside the bounds of the
    /// underlying data structure), `None` otherwise.
    fn checked_add(&self, duration: Duration) -> Option<Self>;

    /// Returns `Some(t)` where `t` is the time `self - duration` if `t` can be
    /// represented as `Instant` (which means it's inside the bounds of the
    /// underlying data structure), `None` otherwise.
    fn checked_sub(&self, duration: Duration) -> Option<Self>;
}

impl Instant for std::time::Instant {
    fn duration_since(&self, earlier: Self) -> Duration {
        std::time::Instant::duration_since(self, earlier)
    }

    fn saturating_duration_since(&self, earlier: Self) -> Duration {
        std::time::Instant::saturating_duration_since(self, earlier)
    }

    fn checked_add(&self, duration: Duration) -> Option<Self> {
        std::time::Instant::checked_add(self, duration)
    }

    fn checked_sub(&self, duration: Duration) -> Option<Self> {
        std::time::Instant::checked_sub(self, duration)
    }
}

/// The identifier for any timer event.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct TimerId(pub(crate) TimerIdInner);

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub(crate) enum TimerIdInner {
    /// A fragment reassembly timeout.
    Reassembly(FragmentTimerId),
    /// A link-local negotiation step.
    LinkLocal(LinkLocalTimerId<DeviceId>),
}

impl From<FragmentTimerId> for TimerId {
    fn from(id: FragmentTimerId) -> TimerId {
        TimerId(TimerIdInner::Reassembly(id))
    }
}

impl From<LinkLocalTimerId<DeviceId>> for TimerId {
    fn from(id: LinkLocalTimerId<DeviceId>) -> TimerId {
        TimerId(TimerIdInner::LinkLocal(id))
    }
}

/// Implements `TimerContext<$inner>` for every context that implements
/// `TimerContext<$outer>`, where `$outer: From<$inner>`.
macro_rules! impl_timer_context {
    ($outer:ty, $inner:ty) => {
        impl<C: crate::context::TimerContext<$outer>> crate::context::TimerContext<$inner> for C {
            fn schedule_timer_instant(
                &mut self,
                time: Self::Instant,
                id: $inner,
            ) -> Option<Self::Instant> {
                crate::context::TimerContext::<$outer>::schedule_timer_instant(
                    self,
                    time,
                    <$outer>::from(id),
                )
            }

            fn cancel_timer(&mut self, id: $inner) -> Option<Self::Instant> {
                crate::context::TimerContext::<$outer>::cancel_timer(self, <$outer>::from(id))
            }
        }
    };
}

impl_timer_context!(TimerId, FragmentTimerId);
impl_timer_context!(TimerId, LinkLocalTimerId<DeviceId>);

/// Handles a generic timer event.
pub fn handle_timer<BC: BindingsContext>(core_ctx: &SyncCtx, bindings_ctx: &mut BC, id: TimerId) {
    trace!("handle_timer: dispatching timerid: {:?}", id);
    let mut core_ctx = core_ctx.lock();

    match id {
        TimerId(TimerIdInner::Reassembly(id)) => {
            crate::ip::base::handle_reassembly_timer(&mut core_ctx, bindings_ctx, id)
        }
        TimerId(TimerIdInner::LinkLocal(id)) => {
            TimerHandler::handle_timer(&mut core_ctx, bindings_ctx, id)
        }
    }
}

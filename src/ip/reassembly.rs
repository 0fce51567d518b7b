// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! IPv4 fragment reassembly.
//!
//! Fragments are associated by the combination of their source address,
//! destination address, identification value and protocol (RFC 791 section
//! 3.2). Each in-progress datagram is a fragment list: a doubly-linked chain
//! of fragment records kept in strictly increasing offset order. Fragment
//! lists are in turn chained together in arrival order. Both chains are
//! stored in [`Slab`] arenas and linked by index, so discarding a list never
//! leaves a dangling reference behind and a timer that outlives its list is
//! recognized by its generation number.
//!
//! Overlapping fragments are never merged: any overlap, and any duplicate
//! whose size disagrees with the fragment already held at that offset,
//! discards the whole list. An exact duplicate is dropped on its own.
//!
//! Each list holds a sliding timer which is reset on every insertion. When it
//! fires, the list is discarded.

use alloc::vec::Vec;
use core::{cmp::Ordering, time::Duration};
use std::net::Ipv4Addr;

use slab::Slab;
use tracing::{debug, trace};

use crate::{
    context::TimerContext,
    device::DeviceId,
    ip::header::{
        rewrite_as_unfragmented, Ipv4Header, Ipv4Proto, FRAGMENT_BLOCK_SIZE,
        IPV4_MAX_TOTAL_LEN, IPV4_MIN_HDR_LEN,
    },
};

/// The default number of buffered fragment bytes at which new fragments are
/// refused.
pub(crate) const DEFAULT_FRAGMENT_CACHE_THRESHOLD: usize = 64 * 1024;

/// The smallest body a fragment other than the last may carry.
const MIN_MIDDLE_FRAGMENT_LEN: usize = FRAGMENT_BLOCK_SIZE;
/// The smallest body the last fragment may carry.
const MIN_FINAL_FRAGMENT_LEN: usize = 1;
/// No fragment may end past the largest body a datagram can carry.
const MAX_FRAGMENT_END: usize = IPV4_MAX_TOTAL_LEN - IPV4_MIN_HDR_LEN;

/// How long an incomplete datagram is held after its latest fragment.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ReassemblyTimeout(Duration);

impl ReassemblyTimeout {
    const MIN: Duration = Duration::from_secs(1);
    const MAX: Duration = Duration::from_secs(15);
    const DEFAULT: Duration = Duration::from_secs(5);

    /// Creates a timeout, which must be between 1 and 15 seconds inclusive.
    pub fn new(timeout: Duration) -> Option<ReassemblyTimeout> {
        (Self::MIN..=Self::MAX).contains(&timeout).then_some(ReassemblyTimeout(timeout))
    }

    /// Returns the timeout.
    pub fn get(self) -> Duration {
        let ReassemblyTimeout(timeout) = self;
        timeout
    }
}

impl Default for ReassemblyTimeout {
    fn default() -> ReassemblyTimeout {
        ReassemblyTimeout(Self::DEFAULT)
    }
}

/// The identifier of a fragment list's reassembly timer.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub(crate) struct FragmentTimerId {
    index: usize,
    generation: u64,
}

#[cfg(test)]
impl FragmentTimerId {
    pub(crate) fn new_for_test(index: usize) -> FragmentTimerId {
        FragmentTimerId { index, generation: 0 }
    }
}

/// The fields that tie the fragments of one datagram together.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub(crate) struct FragmentCacheKey {
    pub(crate) src: Ipv4Addr,
    pub(crate) dst: Ipv4Addr,
    pub(crate) id: u16,
    pub(crate) proto: Ipv4Proto,
}

impl FragmentCacheKey {
    fn of(header: &Ipv4Header) -> FragmentCacheKey {
        let Ipv4Header { src, dst, id, proto, .. } = header;
        FragmentCacheKey { src: *src, dst: *dst, id: *id, proto: *proto }
    }
}

/// Why a fragment was rejected.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum FragmentError {
    /// The fragment carries less data than allowed for its position.
    TooSmall,
    /// The fragment, or the datagram it completes, does not fit in a
    /// datagram.
    TooLarge,
    /// The fragment overlaps one already held. The list was discarded.
    Overlap,
    /// The fragment repeats an offset with a different size. The list was
    /// discarded.
    InconsistentDuplicate,
    /// The fragment disagrees with the datagram's known end. The list was
    /// discarded.
    BeyondEnd,
}

/// A reassembled datagram, header included.
#[derive(Debug, Eq, PartialEq)]
pub(crate) struct ReassembledDatagram {
    /// The complete datagram, with an unfragmented header.
    pub(crate) datagram: Vec<u8>,
    pub(crate) header_len: usize,
}

/// The outcome of offering a datagram to the fragment cache.
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum FragmentProcessingState {
    /// The datagram is not a fragment.
    NotNeeded,
    /// The fragment was stored; the datagram is still incomplete.
    NeedMoreFragments,
    /// The fragment repeats one already held and was dropped.
    Duplicate,
    /// The fragment was rejected.
    InvalidFragment(FragmentError),
    /// The cache is full; the fragment was dropped.
    OutOfMemory,
    /// The fragment completed a datagram.
    Ready(ReassembledDatagram),
}

/// A fragment list discarded by its timer.
#[derive(Debug, Eq, PartialEq)]
pub(crate) struct ExpiredFragments {
    pub(crate) key: FragmentCacheKey,
    /// The device and bytes of the first fragment, if it had arrived.
    pub(crate) first: Option<(DeviceId, Vec<u8>)>,
}

struct FragmentRecord {
    /// In bytes.
    offset: usize,
    body: Vec<u8>,
    prev: Option<usize>,
    next: Option<usize>,
}

impl FragmentRecord {
    fn end(&self) -> usize {
        self.offset + self.body.len()
    }
}

/// The header of the offset-zero fragment and the device it arrived on.
struct FirstFragment {
    device: DeviceId,
    header: Vec<u8>,
}

struct FragmentList {
    key: FragmentCacheKey,
    head: usize,
    size_current: usize,
    /// Known once the last fragment arrives.
    size_total: Option<usize>,
    first: Option<FirstFragment>,
    /// Bytes charged against the cache threshold.
    cached_bytes: usize,
    generation: u64,
    prev: Option<usize>,
    next: Option<usize>,
}

/// All in-progress reassemblies.
pub(crate) struct IpLayerFragmentCache {
    fragments: Slab<FragmentRecord>,
    lists: Slab<FragmentList>,
    head: Option<usize>,
    tail: Option<usize>,
    next_generation: u64,
    cache_size: usize,
    threshold: usize,
}

impl IpLayerFragmentCache {
    pub(crate) fn new(threshold: usize) -> IpLayerFragmentCache {
        IpLayerFragmentCache {
            fragments: Slab::new(),
            lists: Slab::new(),
            head: None,
            tail: None,
            next_generation: 0,
            cache_size: 0,
            threshold,
        }
    }

    fn above_cache_size_threshold(&self) -> bool {
        self.cache_size >= self.threshold
    }

    fn timer_id(&self, index: usize) -> FragmentTimerId {
        FragmentTimerId { index, generation: self.lists[index].generation }
    }

    fn find_list(&self, key: &FragmentCacheKey) -> Option<usize> {
        let mut cursor = self.head;
        while let Some(index) = cursor {
            let list = &self.lists[index];
            if list.key == *key {
                return Some(index);
            }
            cursor = list.next;
        }
        None
    }

    /// Creates a list holding a single fragment and appends it to the chain
    /// of lists.
    fn create_list(&mut self, key: FragmentCacheKey, offset: usize, body: Vec<u8>) -> usize {
        let size_current = body.len();
        let head = self.fragments.insert(FragmentRecord { offset, body, prev: None, next: None });
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        let index = self.lists.insert(FragmentList {
            key,
            head,
            size_current,
            size_total: None,
            first: None,
            cached_bytes: 0,
            generation,
            prev: self.tail,
            next: None,
        });
        match self.tail {
            Some(tail) => self.lists[tail].next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        index
    }

    /// Unlinks and frees the list at `index` along with all of its fragments.
    fn remove_list(&mut self, index: usize) -> (FragmentList, Vec<Vec<u8>>) {
        let list = self.lists.remove(index);
        match list.prev {
            Some(prev) => self.lists[prev].next = list.next,
            None => self.head = list.next,
        }
        match list.next {
            Some(next) => self.lists[next].prev = list.prev,
            None => self.tail = list.prev,
        }
        let mut bodies = Vec::new();
        let mut cursor = Some(list.head);
        while let Some(fragment) = cursor {
            let FragmentRecord { body, next, .. } = self.fragments.remove(fragment);
            bodies.push(body);
            cursor = next;
        }
        self.cache_size -= list.cached_bytes;
        (list, bodies)
    }

    fn discard_list<BC: TimerContext<FragmentTimerId>>(
        &mut self,
        bindings_ctx: &mut BC,
        index: usize,
        err: FragmentError,
    ) -> FragmentProcessingState {
        let id = self.timer_id(index);
        let _: Option<BC::Instant> = bindings_ctx.cancel_timer(id);
        let (list, _) = self.remove_list(index);
        debug!("discarding fragments of {:?}: {:?}", list.key, err);
        FragmentProcessingState::InvalidFragment(err)
    }

    /// Splices a new fragment into the list at `index`, keeping offsets in
    /// strictly increasing order.
    fn insert_fragment(
        &mut self,
        index: usize,
        offset: usize,
        body: Vec<u8>,
    ) -> Result<(), InsertError> {
        let end = offset + body.len();
        let mut cursor = self.lists[index].head;
        loop {
            let record = &self.fragments[cursor];
            match offset.cmp(&record.offset) {
                Ordering::Greater => {
                    if let Some(next) = record.next {
                        cursor = next;
                        continue;
                    }
                    // At the tail.
                    if record.end() > offset {
                        return Err(InsertError::Discard(FragmentError::Overlap));
                    }
                    let new = self.fragments.insert(FragmentRecord {
                        offset,
                        body,
                        prev: Some(cursor),
                        next: None,
                    });
                    self.fragments[cursor].next = Some(new);
                    return Ok(());
                }
                Ordering::Less => {
                    if end > record.offset {
                        return Err(InsertError::Discard(FragmentError::Overlap));
                    }
                    let prev = record.prev;
                    if let Some(prev) = prev {
                        if self.fragments[prev].end() > offset {
                            return Err(InsertError::Discard(FragmentError::Overlap));
                        }
                    }
                    let new = self.fragments.insert(FragmentRecord {
                        offset,
                        body,
                        prev,
                        next: Some(cursor),
                    });
                    self.fragments[cursor].prev = Some(new);
                    match prev {
                        Some(prev) => self.fragments[prev].next = Some(new),
                        // The list-level bookkeeping already lives in the
                        // list record; only the head index moves.
                        None => self.lists[index].head = new,
                    }
                    return Ok(());
                }
                Ordering::Equal => {
                    return Err(if record.body.len() == body.len() {
                        InsertError::Duplicate
                    } else {
                        InsertError::Discard(FragmentError::InconsistentDuplicate)
                    });
                }
            }
        }
    }

    /// Offers a received datagram to the cache.
    ///
    /// `datagram` must hold exactly the header and body described by
    /// `header`.
    pub(crate) fn process_fragment<BC: TimerContext<FragmentTimerId>>(
        &mut self,
        bindings_ctx: &mut BC,
        timeout: ReassemblyTimeout,
        device: &DeviceId,
        header: &Ipv4Header,
        datagram: &[u8],
    ) -> FragmentProcessingState {
        if !header.is_fragment() {
            return FragmentProcessingState::NotNeeded;
        }

        let header_bytes = &datagram[..header.header_len];
        let body = &datagram[header.header_len..];
        let offset = header.fragment_offset_bytes();
        let more = header.more_fragments();
        let end = offset + body.len();

        let min_len = if more { MIN_MIDDLE_FRAGMENT_LEN } else { MIN_FINAL_FRAGMENT_LEN };
        if body.len() < min_len {
            return FragmentProcessingState::InvalidFragment(FragmentError::TooSmall);
        }
        if end > MAX_FRAGMENT_END {
            return FragmentProcessingState::InvalidFragment(FragmentError::TooLarge);
        }
        if self.above_cache_size_threshold() {
            return FragmentProcessingState::OutOfMemory;
        }

        let key = FragmentCacheKey::of(header);
        let index = match self.find_list(&key) {
            None => {
                trace!("new fragment list for {:?}", key);
                self.create_list(key, offset, body.to_vec())
            }
            Some(index) => {
                let list = &self.lists[index];
                let tail_end = self.tail_end(index);
                let beyond_end = match list.size_total {
                    Some(total) => end > total || (!more && end != total),
                    None => !more && tail_end > end,
                };
                if beyond_end {
                    return self.discard_list(bindings_ctx, index, FragmentError::BeyondEnd);
                }
                match self.insert_fragment(index, offset, body.to_vec()) {
                    Ok(()) => {}
                    Err(InsertError::Duplicate) => {
                        trace!("duplicate fragment at offset {} for {:?}", offset, key);
                        return FragmentProcessingState::Duplicate;
                    }
                    Err(InsertError::Discard(err)) => {
                        return self.discard_list(bindings_ctx, index, err);
                    }
                }
                self.lists[index].size_current += body.len();
                index
            }
        };

        let list = &mut self.lists[index];
        let mut charged = body.len();
        if offset == 0 {
            list.first = Some(FirstFragment { device: *device, header: header_bytes.to_vec() });
            charged += header_bytes.len();
        }
        if !more {
            list.size_total = Some(end);
        }
        list.cached_bytes += charged;
        self.cache_size += charged;

        let list = &self.lists[index];
        match list.size_total {
            Some(total) if list.size_current == total => self.reassemble(bindings_ctx, index),
            Some(total) if list.size_current > total => {
                self.discard_list(bindings_ctx, index, FragmentError::BeyondEnd)
            }
            Some(_) | None => {
                let id = self.timer_id(index);
                let _: Option<BC::Instant> = bindings_ctx.schedule_timer(timeout.get(), id);
                FragmentProcessingState::NeedMoreFragments
            }
        }
    }

    fn tail_end(&self, index: usize) -> usize {
        let mut cursor = self.lists[index].head;
        while let Some(next) = self.fragments[cursor].next {
            cursor = next;
        }
        self.fragments[cursor].end()
    }

    fn reassemble<BC: TimerContext<FragmentTimerId>>(
        &mut self,
        bindings_ctx: &mut BC,
        index: usize,
    ) -> FragmentProcessingState {
        let id = self.timer_id(index);
        let _: Option<BC::Instant> = bindings_ctx.cancel_timer(id);
        let (list, bodies) = self.remove_list(index);
        let FragmentList { key, size_current, first, .. } = list;
        // A gapless, non-overlapping cover of the datagram includes offset
        // zero.
        let Some(FirstFragment { device: _, header }) = first else {
            debug!("complete fragment list for {:?} without a first fragment", key);
            return FragmentProcessingState::InvalidFragment(FragmentError::BeyondEnd);
        };
        let header_len = header.len();
        let total_len = match u16::try_from(header_len + size_current) {
            Ok(total_len) => total_len,
            Err(_) => {
                debug!("reassembled datagram for {:?} is too large", key);
                return FragmentProcessingState::InvalidFragment(FragmentError::TooLarge);
            }
        };

        let mut datagram = header;
        datagram.reserve(size_current);
        bodies.iter().for_each(|body| datagram.extend_from_slice(body));
        rewrite_as_unfragmented(&mut datagram, header_len, total_len);
        debug!("reassembled {} byte datagram for {:?}", total_len, key);
        FragmentProcessingState::Ready(ReassembledDatagram { datagram, header_len })
    }

    /// Handles a reassembly timer, discarding its list.
    ///
    /// Returns `None` if the timer no longer refers to a live list.
    pub(crate) fn handle_reassembly_timer(
        &mut self,
        id: FragmentTimerId,
    ) -> Option<ExpiredFragments> {
        let FragmentTimerId { index, generation } = id;
        match self.lists.get(index) {
            Some(list) if list.generation == generation => {}
            Some(_) | None => {
                trace!("ignoring stale reassembly timer {:?}", id);
                return None;
            }
        }
        let (list, bodies) = self.remove_list(index);
        let FragmentList { key, first, .. } = list;
        debug!("reassembly of {:?} timed out", key);
        // The head of a list holding its first fragment is at offset zero.
        let first = first.map(|FirstFragment { device, mut header }| {
            if let Some(body) = bodies.first() {
                header.extend_from_slice(body);
            }
            (device, header)
        });
        Some(ExpiredFragments { key, first })
    }

    /// Returns the fragment offsets and received byte count of the list for
    /// `key`.
    #[cfg(test)]
    fn list_state(&self, key: &FragmentCacheKey) -> Option<(Vec<usize>, usize)> {
        let index = self.find_list(key)?;
        let mut offsets = Vec::new();
        let mut cursor = Some(self.lists[index].head);
        while let Some(fragment) = cursor {
            offsets.push(self.fragments[fragment].offset);
            cursor = self.fragments[fragment].next;
        }
        Some((offsets, self.lists[index].size_current))
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.lists.is_empty()
            && self.fragments.is_empty()
            && self.head.is_none()
            && self.tail.is_none()
            && self.cache_size == 0
    }
}

enum InsertError {
    Duplicate,
    Discard(FragmentError),
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use matches::assert_matches;
    use test_case::test_case;

    use super::*;
    use crate::{
        context::testutil::{FakeInstant, FakeTimerCtx, FakeTimerCtxExt as _},
        ip::header::{checksum_is_valid, testutil::new_datagram},
    };

    const SRC: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 20);
    const DST: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
    const ID: u16 = 0x1234;

    struct Ctx {
        cache: IpLayerFragmentCache,
        timers: FakeTimerCtx<FragmentTimerId>,
        device: DeviceId,
    }

    impl Ctx {
        fn new() -> Ctx {
            Ctx {
                cache: IpLayerFragmentCache::new(DEFAULT_FRAGMENT_CACHE_THRESHOLD),
                timers: FakeTimerCtx::default(),
                device: DeviceId::new_for_test(0),
            }
        }

        /// Offers a fragment with `len` bytes of body starting at byte
        /// `offset`, filled with a pattern derived from the byte position.
        fn offer(
            &mut self,
            id: u16,
            offset: usize,
            len: usize,
            more: bool,
        ) -> FragmentProcessingState {
            let body: Vec<u8> = (offset..offset + len).map(|i| i as u8).collect();
            self.offer_body(id, offset, &body, more)
        }

        fn offer_body(
            &mut self,
            id: u16,
            offset: usize,
            body: &[u8],
            more: bool,
        ) -> FragmentProcessingState {
            assert_eq!(offset % FRAGMENT_BLOCK_SIZE, 0);
            let datagram = new_datagram(
                SRC,
                DST,
                Ipv4Proto::Udp,
                id,
                (offset / FRAGMENT_BLOCK_SIZE) as u16,
                more,
                body,
            );
            let header = Ipv4Header::parse(&datagram).unwrap();
            let Ctx { cache, timers, device } = self;
            cache.process_fragment(timers, ReassemblyTimeout::default(), device, &header, &datagram)
        }

        fn key(id: u16) -> FragmentCacheKey {
            FragmentCacheKey { src: SRC, dst: DST, id, proto: Ipv4Proto::Udp }
        }
    }

    fn expect_ready(state: FragmentProcessingState, body_len: usize) -> Vec<u8> {
        let ReassembledDatagram { datagram, header_len } = match state {
            FragmentProcessingState::Ready(datagram) => datagram,
            state => panic!("expected a reassembled datagram, got {:?}", state),
        };
        assert_eq!(header_len, IPV4_MIN_HDR_LEN);
        let header = Ipv4Header::parse(&datagram).unwrap();
        assert!(!header.is_fragment());
        assert_eq!(usize::from(header.total_len), header_len + body_len);
        assert!(checksum_is_valid(&datagram[..header_len]));
        datagram[header_len..].to_vec()
    }

    #[test]
    fn not_a_fragment() {
        let mut ctx = Ctx::new();
        let datagram = new_datagram(SRC, DST, Ipv4Proto::Udp, ID, 0, false, &[1, 2, 3]);
        let header = Ipv4Header::parse(&datagram).unwrap();
        let Ctx { cache, timers, device } = &mut ctx;
        assert_eq!(
            cache.process_fragment(timers, ReassemblyTimeout::default(), device, &header, &datagram),
            FragmentProcessingState::NotNeeded
        );
        assert!(ctx.cache.is_empty());
    }

    #[test]
    fn out_of_order_fragments_reassemble() {
        // Three 1000-byte fragments offered in the order 0, 2, 1.
        let mut ctx = Ctx::new();
        assert_eq!(ctx.offer(ID, 0, 1000, true), FragmentProcessingState::NeedMoreFragments);
        assert_eq!(ctx.offer(ID, 2000, 1000, false), FragmentProcessingState::NeedMoreFragments);
        assert_eq!(
            ctx.cache.list_state(&Ctx::key(ID)),
            Some((vec![0, 2000], 2000))
        );
        let body = expect_ready(ctx.offer(ID, 1000, 1000, true), 3000);
        assert_eq!(body, (0..3000).map(|i| i as u8).collect::<Vec<_>>());
        assert!(ctx.cache.is_empty());
        ctx.timers.assert_no_timers_installed();
    }

    #[test]
    fn fragment_before_head_becomes_head() {
        let mut ctx = Ctx::new();
        assert_eq!(ctx.offer(ID, 16, 8, false), FragmentProcessingState::NeedMoreFragments);
        assert_eq!(ctx.offer(ID, 8, 8, true), FragmentProcessingState::NeedMoreFragments);
        assert_eq!(ctx.cache.list_state(&Ctx::key(ID)), Some((vec![8, 16], 16)));
        let body = expect_ready(ctx.offer(ID, 0, 8, true), 24);
        assert_eq!(body, (0..24).collect::<Vec<u8>>());
    }

    #[test]
    fn exact_duplicate_is_dropped_alone() {
        let mut ctx = Ctx::new();
        assert_eq!(ctx.offer(ID, 0, 16, true), FragmentProcessingState::NeedMoreFragments);
        assert_eq!(ctx.offer(ID, 32, 8, true), FragmentProcessingState::NeedMoreFragments);
        let before = ctx.cache.list_state(&Ctx::key(ID));
        assert_eq!(ctx.offer(ID, 32, 8, true), FragmentProcessingState::Duplicate);
        assert_eq!(ctx.offer(ID, 0, 16, true), FragmentProcessingState::Duplicate);
        assert_eq!(ctx.cache.list_state(&Ctx::key(ID)), before);
        assert_eq!(before, Some((vec![0, 32], 24)));
    }

    #[test_case(0, 24; "resized duplicate")]
    #[test_case(8, 16; "overlaps head from inside")]
    #[test_case(24, 16; "overlaps successor")]
    #[test_case(40, 16; "overlaps tail")]
    fn inconsistent_fragment_discards_list(offset: usize, len: usize) {
        let mut ctx = Ctx::new();
        assert_eq!(ctx.offer(ID, 0, 16, true), FragmentProcessingState::NeedMoreFragments);
        assert_eq!(ctx.offer(ID, 32, 16, true), FragmentProcessingState::NeedMoreFragments);
        assert_matches!(
            ctx.offer(ID, offset, len, true),
            FragmentProcessingState::InvalidFragment(
                FragmentError::Overlap | FragmentError::InconsistentDuplicate
            )
        );
        assert!(ctx.cache.is_empty());
        ctx.timers.assert_no_timers_installed();

        // A later fragment starts over.
        assert_eq!(ctx.offer(ID, 32, 16, true), FragmentProcessingState::NeedMoreFragments);
        assert_eq!(ctx.cache.list_state(&Ctx::key(ID)), Some((vec![32], 16)));
    }

    #[test]
    fn conflicting_last_fragment_discards_list() {
        let mut ctx = Ctx::new();
        assert_eq!(ctx.offer(ID, 16, 8, false), FragmentProcessingState::NeedMoreFragments);
        assert_eq!(
            ctx.offer(ID, 32, 8, true),
            FragmentProcessingState::InvalidFragment(FragmentError::BeyondEnd)
        );
        assert!(ctx.cache.is_empty());

        assert_eq!(ctx.offer(ID, 32, 8, true), FragmentProcessingState::NeedMoreFragments);
        assert_eq!(
            ctx.offer(ID, 8, 8, false),
            FragmentProcessingState::InvalidFragment(FragmentError::BeyondEnd)
        );
        assert!(ctx.cache.is_empty());
    }

    #[test]
    fn fragment_size_limits() {
        let mut ctx = Ctx::new();
        assert_eq!(
            ctx.offer(ID, 8, 0, false),
            FragmentProcessingState::InvalidFragment(FragmentError::TooSmall)
        );
        assert_eq!(
            // Ends at 65520.
            ctx.offer(ID, 8189 * FRAGMENT_BLOCK_SIZE, 8, false),
            FragmentProcessingState::InvalidFragment(FragmentError::TooLarge)
        );
        assert_eq!(ctx.offer(ID, 8, 1, false), FragmentProcessingState::NeedMoreFragments);
    }

    #[test]
    fn cache_threshold() {
        let mut ctx = Ctx::new();
        ctx.cache = IpLayerFragmentCache::new(64);
        assert_eq!(ctx.offer(1, 0, 48, true), FragmentProcessingState::NeedMoreFragments);
        // 48 bytes of body plus a 20-byte header reach the threshold.
        assert_eq!(ctx.offer(2, 0, 8, true), FragmentProcessingState::OutOfMemory);
        assert_eq!(ctx.cache.list_state(&Ctx::key(2)), None);
    }

    #[test]
    fn timer_slides_and_expires() {
        let mut ctx = Ctx::new();
        let timeout = ReassemblyTimeout::default().get();
        assert_eq!(ctx.offer(ID, 0, 8, true), FragmentProcessingState::NeedMoreFragments);
        let id = FragmentTimerId { index: 0, generation: 0 };
        ctx.timers.assert_timers_installed([(id, FakeInstant::from(timeout))]);

        ctx.timers.sleep(Duration::from_secs(2));
        assert_eq!(ctx.offer(ID, 16, 8, true), FragmentProcessingState::NeedMoreFragments);
        ctx.timers.assert_timers_installed([(
            id,
            FakeInstant::from(Duration::from_secs(2) + timeout),
        )]);

        let Ctx { cache, timers, device } = &mut ctx;
        let fired = timers.trigger_timers_for(timeout, |_, _| {});
        assert_eq!(fired, vec![id]);
        let expired = cache.handle_reassembly_timer(id).unwrap();
        assert_eq!(expired.key, Ctx::key(ID));
        let (expired_device, original) = expired.first.unwrap();
        assert_eq!(expired_device, *device);
        assert_eq!(original.len(), IPV4_MIN_HDR_LEN + 8);
        assert!(ctx.cache.is_empty());

        // A late fragment starts a new list with a new generation.
        assert_eq!(ctx.offer(ID, 8, 8, true), FragmentProcessingState::NeedMoreFragments);
        assert_eq!(ctx.cache.list_state(&Ctx::key(ID)), Some((vec![8], 8)));
        assert_eq!(ctx.cache.handle_reassembly_timer(id), None);
        assert_eq!(ctx.cache.list_state(&Ctx::key(ID)), Some((vec![8], 8)));
    }

    #[test]
    fn expiry_without_first_fragment() {
        let mut ctx = Ctx::new();
        assert_eq!(ctx.offer(ID, 8, 8, true), FragmentProcessingState::NeedMoreFragments);
        let id = FragmentTimerId { index: 0, generation: 0 };
        assert_eq!(
            ctx.cache.handle_reassembly_timer(id),
            Some(ExpiredFragments { key: Ctx::key(ID), first: None })
        );
    }

    #[test]
    fn independent_lists() {
        let mut ctx = Ctx::new();
        assert_eq!(ctx.offer(1, 0, 8, true), FragmentProcessingState::NeedMoreFragments);
        assert_eq!(ctx.offer(2, 0, 8, true), FragmentProcessingState::NeedMoreFragments);
        assert_eq!(ctx.offer(3, 0, 8, true), FragmentProcessingState::NeedMoreFragments);
        // Complete the middle list; the others stay linked.
        let _: Vec<u8> = expect_ready(ctx.offer(2, 8, 4, false), 12);
        assert_eq!(ctx.cache.list_state(&Ctx::key(1)), Some((vec![0], 8)));
        assert_eq!(ctx.cache.list_state(&Ctx::key(3)), Some((vec![0], 8)));
        let _: Vec<u8> = expect_ready(ctx.offer(3, 8, 4, false), 12);
        let _: Vec<u8> = expect_ready(ctx.offer(1, 8, 4, false), 12);
        assert!(ctx.cache.is_empty());
    }

    #[test]
    fn completion_arithmetic_over_many_splits() {
        // Every split of a 64-byte body into 8-byte-aligned pieces completes
        // exactly once, whatever the arrival order.
        for split in 1..8 {
            for reverse in [false, true] {
                let mut ctx = Ctx::new();
                let cut = split * 8;
                let mut pieces = vec![(0, cut, true), (cut, 64 - cut, false)];
                if reverse {
                    pieces.reverse();
                }
                let mut ready = 0;
                for (offset, len, more) in pieces {
                    if let FragmentProcessingState::Ready(datagram) = ctx.offer(ID, offset, len, more)
                    {
                        ready += 1;
                        assert_eq!(datagram.datagram.len(), IPV4_MIN_HDR_LEN + 64);
                    }
                }
                assert_eq!(ready, 1);
                assert!(ctx.cache.is_empty());
            }
        }
    }
}

use crate::annotations::RouterAnnotations;
use crate::chain::Chain;
use crate::cutthrough::{Activation, CutThroughRing};
use crate::flow::{self, flow_tuning};
use crate::message::parse::{self, Depth, DepthCheck, ParseState, RaPolicy, SectionLocation};
use crate::message::stream::{BodyScan, StreamDataResult};
use crate::support::{ErrorType, PipeError, PipeResult};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Write-once atomic flags on a content. `DISCARD` latches false to true;
/// none of them is ever cleared.
pub mod flags {
    pub const RECEIVE_COMPLETE: u32 = 1 << 0;
    pub const ABORTED: u32 = 1 << 1;
    pub const DISCARD: u32 = 1 << 2;
    pub const OVERSIZE: u32 = 1 << 3;
    pub const NO_BODY: u32 = 1 << 4;
    pub const PRIORITY_PARSED: u32 = 1 << 5;
    pub const CUT_THROUGH: u32 = 1 << 6;
}

const DEFAULT_PRIORITY: u8 = 4;

/// Everything guarded by the content's structural mutex: the buffer chain,
/// the parse state, the body scan and the Q2 account.
struct ContentState {
    chain: Chain,
    parse: ParseState,
    body_scan: BodyScan,
    bytes_received: u64,
    max_message_size: u64,
    q2_enabled: bool,
    q2_blocked: bool,
    q2_unblock: Option<Arc<dyn Fn() + Send + Sync>>,
}

/// Status handed back from the octet-ingestion operations.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ReceiveStatus {
    pub q2_blocked: bool,
    pub receive_complete: bool,
}

/// The shared body of one logical message: a chain of pooled buffers with
/// per-section locations, a resumable parser, flow-control state and the
/// cut-through ring. Shared between every delivery of the message; the last
/// handle to drop returns all buffers to the pool.
///
/// Lock order within a content: the structural mutex first, then (never
/// while it is held) either activation mutex.
pub struct Content {
    state: Mutex<ContentState>,
    flags: AtomicU32,
    priority: AtomicU8,
    ring: CutThroughRing,
    producer_activation: Mutex<Activation>,
    consumer_activation: Mutex<Activation>,
}

impl Content {
    /// A content expecting octets from an ingress link. `max_message_size`
    /// of zero means unlimited.
    pub fn new(policy: RaPolicy, max_message_size: u64) -> Arc<Content> {
        Arc::new(Content {
            state: Mutex::new(ContentState {
                chain: Chain::new(),
                parse: ParseState::new(policy),
                body_scan: BodyScan::default(),
                bytes_received: 0,
                max_message_size,
                q2_enabled: true,
                q2_blocked: false,
                q2_unblock: None,
            }),
            flags: AtomicU32::new(0),
            priority: AtomicU8::new(DEFAULT_PRIORITY),
            ring: CutThroughRing::new(),
            producer_activation: Mutex::new(Activation::none()),
            consumer_activation: Mutex::new(Activation::none()),
        })
    }

    #[inline]
    fn lock(&self) -> MutexGuard<'_, ContentState> {
        self.state.lock().expect("Content lock poisoned")
    }

    #[inline]
    fn flag(&self, bit: u32) -> bool {
        self.flags.load(Ordering::Acquire) & bit != 0
    }

    #[inline]
    fn raise(&self, bit: u32) {
        self.flags.fetch_or(bit, Ordering::AcqRel);
    }

    #[inline]
    pub fn is_receive_complete(&self) -> bool {
        self.flag(flags::RECEIVE_COMPLETE)
    }

    #[inline]
    pub fn is_aborted(&self) -> bool {
        self.flag(flags::ABORTED)
    }

    #[inline]
    pub fn is_discarding(&self) -> bool {
        self.flag(flags::DISCARD)
    }

    #[inline]
    pub fn is_oversize(&self) -> bool {
        self.flag(flags::OVERSIZE)
    }

    #[inline]
    pub fn has_no_body(&self) -> bool {
        self.flag(flags::NO_BODY)
    }

    #[inline]
    pub fn is_cut_through(&self) -> bool {
        self.flag(flags::CUT_THROUGH)
    }

    /// Abort the message. Propagates to every downstream consumer through
    /// the stream iterator and the send path.
    pub fn set_aborted(&self) {
        self.raise(flags::ABORTED);
    }

    /// Stop buffering inbound octets; the remainder of the stream is read
    /// and dropped.
    pub fn set_discard(&self) {
        self.raise(flags::DISCARD);
    }

    /// Append inbound octets. Marks the message complete when `end` is
    /// set, enforces the size ceiling, advances the parser as far as the
    /// octets allow and reports the Q2 state.
    pub fn receive(&self, octets: &[u8], end: bool) -> PipeResult<ReceiveStatus> {
        if self.is_cut_through() {
            return Err(PipeError::Fatal(ErrorType::CutThroughActive));
        }

        if self.is_aborted() {
            return Err(PipeError::Fatal(ErrorType::Aborted));
        }

        let mut oversize_now = false;

        let status = {
            let mut state = self.lock();

            let previous = state.bytes_received;
            state.bytes_received += octets.len() as u64;

            if self.is_discarding() {
                // Drain without buffering.
            } else if state.max_message_size > 0 && state.bytes_received > state.max_message_size {
                // Keep the octets up to the ceiling, drop the rest of the
                // stream.
                let keep = state.max_message_size.saturating_sub(previous) as usize;
                let keep_octets = &octets[..keep.min(octets.len())];
                state.chain.append(keep_octets);
                oversize_now = true;
            } else {
                state.chain.append(octets);
            }

            if end {
                self.raise(flags::RECEIVE_COMPLETE);
            }

            let complete = self.is_receive_complete();

            {
                // Opportunistic parse; incomplete sections resume on the
                // next call.
                let ContentState {
                    parse: ref mut parse_state,
                    ref chain,
                    ref mut body_scan,
                    ..
                } = *state;

                let _ = parse::advance(parse_state, chain, Depth::Body, complete);
                body_scan.sync_first(&parse_state.sections);
            }

            if complete && state.parse.sections.body_first.is_none() && state.parse.error.is_none() {
                self.raise(flags::NO_BODY);
            }

            let tuning = flow_tuning();

            if flow::q2_should_block(state.chain.buf_count(), state.q2_enabled, &tuning) {
                state.q2_blocked = true;
            }

            ReceiveStatus {
                q2_blocked: state.q2_blocked,
                receive_complete: complete,
            }
        };

        if oversize_now {
            self.raise(flags::OVERSIZE);
            self.raise(flags::DISCARD);
            return Err(PipeError::Fatal(ErrorType::Oversize));
        }

        Ok(status)
    }

    /// Append a pre-composed fragment (streaming producer side). Returns
    /// true when the append pushed the content over the Q2 high watermark.
    pub fn extend(&self, octets: &[u8]) -> PipeResult<bool> {
        if self.is_cut_through() {
            return Err(PipeError::Fatal(ErrorType::CutThroughActive));
        }

        let mut oversize_now = false;

        let blocked = {
            let mut state = self.lock();

            let previous = state.bytes_received;
            state.bytes_received += octets.len() as u64;

            if self.is_discarding() {
                // Drain without buffering.
            } else if state.max_message_size > 0 && state.bytes_received > state.max_message_size {
                let keep = state.max_message_size.saturating_sub(previous) as usize;
                let keep_octets = &octets[..keep.min(octets.len())];
                state.chain.append(keep_octets);
                oversize_now = true;
            } else {
                state.chain.append(octets);
            }

            let tuning = flow_tuning();

            if flow::q2_should_block(state.chain.buf_count(), state.q2_enabled, &tuning) {
                state.q2_blocked = true;
            }

            state.q2_blocked
        };

        if oversize_now {
            self.raise(flags::OVERSIZE);
            self.raise(flags::DISCARD);
            return Err(PipeError::Fatal(ErrorType::Oversize));
        }

        Ok(blocked)
    }

    /// Close the producing side of a streaming message.
    pub fn set_receive_complete(&self) {
        self.raise(flags::RECEIVE_COMPLETE);

        let mut state = self.lock();

        let ContentState {
            parse: ref mut parse_state,
            ref chain,
            ref mut body_scan,
            ..
        } = *state;

        let _ = parse::advance(parse_state, chain, Depth::Body, true);
        body_scan.sync_first(&parse_state.sections);

        if parse_state.sections.body_first.is_none() && parse_state.error.is_none() {
            self.raise(flags::NO_BODY);
        }
    }

    /// Non-blocking depth check, advancing the parser as far as the
    /// buffered octets allow.
    pub fn check_depth(&self, target: Depth) -> DepthCheck {
        if self.is_cut_through() {
            return DepthCheck::Invalid;
        }

        let mut state = self.lock();
        let complete = self.is_receive_complete();

        let ContentState {
            parse: ref mut parse_state,
            ref chain,
            ref mut body_scan,
            ..
        } = *state;

        let through_body = parse::advance(parse_state, chain, target.min(Depth::Body), complete);
        body_scan.sync_first(&parse_state.sections);

        if through_body != DepthCheck::Ok || target < Depth::Footer {
            return through_body;
        }

        // The footer lies past the body stream; walk the remaining body
        // sections to find it.
        body_scan.locate_footer(chain, &mut parse_state.sections, complete)
    }

    /// The reason parsing failed, if it did.
    pub fn parse_error(&self) -> Option<ErrorType> {
        self.lock().parse.error
    }

    /// Copy of the parsed router annotations, if the message carried them.
    pub fn router_annotations(&self) -> Option<RouterAnnotations> {
        self.lock().parse.ra.clone()
    }

    /// Message priority from the header section, parsed exactly once.
    pub fn priority(&self) -> u8 {
        if self.flag(flags::PRIORITY_PARSED) {
            return self.priority.load(Ordering::Acquire);
        }

        let state = self.lock();

        let priority = match state.parse.sections.header {
            Some(header) => parse::parse_priority(&state.chain, &header),
            // Header not located (yet): report the default without
            // latching, the section may still arrive.
            None => {
                if !self.is_receive_complete() && state.parse.depth < Depth::Header {
                    return DEFAULT_PRIORITY;
                }
                DEFAULT_PRIORITY
            }
        };

        drop(state);

        self.priority.store(priority, Ordering::Release);
        self.raise(flags::PRIORITY_PARSED);

        priority
    }

    // ------------------------------------------------------------------
    // Q2
    // ------------------------------------------------------------------

    /// Register the handler run when the content drops below the Q2 low
    /// watermark. Invoked on whichever thread releases the buffers; it must
    /// be thread-safe.
    pub fn set_q2_unblock_handler(&self, handler: Arc<dyn Fn() + Send + Sync>) {
        self.lock().q2_unblock = Some(handler);
    }

    /// Exempt this message from Q2. Idempotent; releases a blocked
    /// producer.
    pub fn disable_q2(&self) {
        let handler = {
            let mut state = self.lock();
            state.q2_enabled = false;

            match state.q2_blocked {
                true => {
                    state.q2_blocked = false;
                    state.q2_unblock.clone()
                }
                false => None,
            }
        };

        if let Some(handler) = handler {
            handler();
        }
    }

    pub fn is_q2_blocked(&self) -> bool {
        self.lock().q2_blocked
    }

    /// Buffers currently held by the content.
    pub fn buf_count(&self) -> usize {
        self.lock().chain.buf_count()
    }

    fn q2_recheck(state: &mut ContentState) -> Option<Arc<dyn Fn() + Send + Sync>> {
        let tuning = flow_tuning();

        if state.q2_blocked && flow::q2_should_unblock(state.chain.buf_count(), &tuning) {
            state.q2_blocked = false;
            return state.q2_unblock.clone();
        }

        None
    }

    // ------------------------------------------------------------------
    // Stream data
    // ------------------------------------------------------------------

    /// Yield the next body-data or footer segment.
    pub fn stream_data_next(&self) -> StreamDataResult {
        if self.is_cut_through() {
            return StreamDataResult::Invalid;
        }

        let mut state = self.lock();
        let complete = self.is_receive_complete();
        let aborted = self.is_aborted();

        let ContentState {
            parse: ref mut parse_state,
            ref chain,
            ref mut body_scan,
            ..
        } = *state;

        let _ = parse::advance(parse_state, chain, Depth::Body, complete);
        body_scan.sync_first(&parse_state.sections);

        body_scan.next(chain, &mut parse_state.sections, complete, aborted)
    }

    /// Free one segment; buffers return to the pool once the released
    /// region is a contiguous prefix. May release a Q2-blocked producer.
    pub fn stream_data_release(&self, id: usize) {
        let handler = {
            let mut state = self.lock();

            let ContentState {
                ref mut body_scan,
                ref mut chain,
                ..
            } = *state;

            body_scan.release(chain, id);
            Self::q2_recheck(&mut state)
        };

        if let Some(handler) = handler {
            handler();
        }
    }

    /// Free the segment and every earlier still-held segment.
    pub fn stream_data_release_up_to(&self, id: usize) {
        let handler = {
            let mut state = self.lock();

            let ContentState {
                ref mut body_scan,
                ref mut chain,
                ..
            } = *state;

            body_scan.release_up_to(chain, id);
            Self::q2_recheck(&mut state)
        };

        if let Some(handler) = handler {
            handler();
        }
    }

    // ------------------------------------------------------------------
    // Cut-through
    // ------------------------------------------------------------------

    /// Switch the content to direct producer-to-consumer hand-off. From
    /// here on the classical accessors fail.
    pub fn enable_cut_through(&self) {
        self.raise(flags::CUT_THROUGH);
    }

    /// The hand-off ring. Meaningful only once cut-through is enabled.
    #[inline]
    pub fn ring(&self) -> &CutThroughRing {
        &self.ring
    }

    /// Install the producer-side activation record.
    pub fn set_producer_activation(&self, activation: Activation) {
        *self
            .producer_activation
            .lock()
            .expect("Producer activation lock poisoned") = activation;
    }

    /// Install the consumer-side activation record.
    pub fn set_consumer_activation(&self, activation: Activation) {
        *self
            .consumer_activation
            .lock()
            .expect("Consumer activation lock poisoned") = activation;
    }

    /// Run `f` against the producer activation record. The record's own
    /// mutex is held for the duration; the content lock must not be.
    pub fn with_producer_activation<R>(&self, f: impl FnOnce(&Activation) -> R) -> R {
        f(&self
            .producer_activation
            .lock()
            .expect("Producer activation lock poisoned"))
    }

    /// Run `f` against the consumer activation record.
    pub fn with_consumer_activation<R>(&self, f: impl FnOnce(&Activation) -> R) -> R {
        f(&self
            .consumer_activation
            .lock()
            .expect("Consumer activation lock poisoned"))
    }

    pub fn clear_producer_activation(&self) {
        self.set_producer_activation(Activation::none());
    }

    pub fn clear_consumer_activation(&self) {
        self.set_consumer_activation(Activation::none());
    }

    // ------------------------------------------------------------------
    // Send-side access
    // ------------------------------------------------------------------

    /// Absolute offset one past the last buffered octet.
    pub(crate) fn extent(&self) -> u64 {
        self.lock().chain.extent()
    }

    /// Copy buffered octets at `offset` into `dst`, clamped to what is
    /// retained.
    pub(crate) fn read_chunk(&self, offset: u64, dst: &mut [u8]) -> usize {
        self.lock().chain.read_at(offset, dst)
    }

    /// Where the bare message starts: one past the router-annotations
    /// section when present.
    pub(crate) fn bare_message_offset(&self) -> PipeResult<u64> {
        let state = self.lock();

        match state.parse.sections.ra {
            Some(ra) => Ok(ra.end()),
            // Annotations are forbidden on this ingress, so the bare
            // message starts at the first octet.
            None if state.parse.policy == RaPolicy::Forbidden => Ok(0),
            None => match state.parse.depth > Depth::None || self.is_receive_complete() {
                true => Ok(0),
                // The leading section has not been identified yet.
                false => Err(PipeError::Wait),
            },
        }
    }

    pub(crate) fn section(&self, depth: Depth) -> Option<SectionLocation> {
        self.lock().parse.sections.get(depth).copied()
    }

    /// Run `f` against the buffer chain under the content lock. For
    /// crate-internal readers that decode located sections in place.
    pub(crate) fn with_chain<R>(&self, f: impl FnOnce(&Chain) -> R) -> R {
        f(&self.lock().chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BUF_SIZE;
    use crate::codec::{sections, Composed};
    use std::sync::atomic::AtomicUsize;

    fn body_section(payload: &[u8]) -> Vec<u8> {
        let mut composed = Composed::new();
        composed.put_descriptor(sections::BODY_DATA);
        composed.put_binary(payload);
        composed.into_vec()
    }

    fn properties_section() -> Vec<u8> {
        let mut composed = Composed::new();
        composed.put_descriptor(sections::PROPERTIES);
        composed.start_list();
        composed.put_null();
        composed.end();
        composed.into_vec()
    }

    #[test]
    fn test_receive_and_depth_check() {
        let content = Content::new(RaPolicy::Forbidden, 0);
        let octets = [properties_section(), body_section(b"payload")].concat();

        let status = content.receive(&octets[..4], false).unwrap();
        assert!(!status.receive_complete);
        assert_eq!(content.check_depth(Depth::Properties), DepthCheck::Incomplete);

        let status = content.receive(&octets[4..], true).unwrap();
        assert!(status.receive_complete);
        assert_eq!(content.check_depth(Depth::Properties), DepthCheck::Ok);
        assert_eq!(content.check_depth(Depth::Footer), DepthCheck::Ok);
    }

    #[test]
    fn test_empty_body_message() {
        let content = Content::new(RaPolicy::Forbidden, 0);

        content.receive(&properties_section(), true).unwrap();

        assert!(content.has_no_body());
        assert_eq!(content.check_depth(Depth::Body), DepthCheck::Ok);
    }

    #[test]
    fn test_oversize_boundary() {
        let body = body_section(&[0x11; 64]);

        // Exactly at the ceiling: accepted.
        let content = Content::new(RaPolicy::Forbidden, body.len() as u64);
        content.receive(&body, true).unwrap();
        assert!(!content.is_oversize());

        // One octet over: oversized, reading stops.
        let content = Content::new(RaPolicy::Forbidden, body.len() as u64 - 1);
        let result = content.receive(&body, false);

        assert_eq!(result, Err(PipeError::Fatal(ErrorType::Oversize)));
        assert!(content.is_oversize());
        assert!(content.is_discarding());

        // Later octets of the stream are drained without buffering.
        let before = content.buf_count();
        content.receive(&[0u8; 1000], true).unwrap();
        assert_eq!(content.buf_count(), before);
    }

    #[test]
    fn test_q2_oscillation() {
        let content = Content::new(RaPolicy::Forbidden, 0);
        let fired = Arc::new(AtomicUsize::new(0));

        let observer = fired.clone();
        content.set_q2_unblock_handler(Arc::new(move || {
            observer.fetch_add(1, Ordering::SeqCst);
        }));

        // First segment carries the section header, the rest is raw
        // buffer-sized payload spread over many segments.
        let mut blocked_at = None;

        for index in 0..70 {
            let segment = body_section(&vec![0x77; BUF_SIZE]);
            let blocked = content.extend(&segment).unwrap();

            if blocked && blocked_at.is_none() {
                blocked_at = Some(index);
            }
        }

        // The producer saw the block as the count crossed the high
        // watermark.
        assert!(blocked_at.is_some());
        assert!(content.is_q2_blocked());
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        content.set_receive_complete();

        // Drain segments until the count crosses the low watermark.
        let mut drained = 0;

        while drained < 40 {
            match content.stream_data_next() {
                StreamDataResult::BodyOk(data) => {
                    content.stream_data_release(data.id);
                    drained += 1;
                }
                other => panic!("Unexpected stream result {:?}", other),
            }
        }

        // The unblock handler fired exactly once for the cycle.
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!content.is_q2_blocked());
    }

    #[test]
    fn test_disable_q2_is_idempotent() {
        let content = Content::new(RaPolicy::Forbidden, 0);
        let fired = Arc::new(AtomicUsize::new(0));

        let observer = fired.clone();
        content.set_q2_unblock_handler(Arc::new(move || {
            observer.fetch_add(1, Ordering::SeqCst);
        }));

        for _ in 0..70 {
            content.extend(&vec![0x33; BUF_SIZE]).unwrap();
        }

        assert!(content.is_q2_blocked());

        content.disable_q2();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        content.disable_q2();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Q2 stays off: further growth does not block.
        content.extend(&vec![0x33; BUF_SIZE]).unwrap();
        assert!(!content.is_q2_blocked());
    }

    #[test]
    fn test_cut_through_disables_classical_access() {
        let content = Content::new(RaPolicy::Forbidden, 0);

        content.enable_cut_through();

        assert!(content.is_cut_through());
        assert_eq!(
            content.receive(b"x", false),
            Err(PipeError::Fatal(ErrorType::CutThroughActive))
        );
        assert_eq!(content.check_depth(Depth::Body), DepthCheck::Invalid);
        assert_eq!(content.stream_data_next(), StreamDataResult::Invalid);
    }

    #[test]
    fn test_abort_propagates_to_stream() {
        let content = Content::new(RaPolicy::Forbidden, 0);

        content.receive(&body_section(b"chunk"), false).unwrap();
        content.set_aborted();

        assert_eq!(content.stream_data_next(), StreamDataResult::Aborted);
    }

    #[test]
    fn test_priority_parsed_once() {
        let mut composed = Composed::new();
        composed.put_descriptor(sections::HEADER);
        composed.start_list();
        composed.put_bool(false);
        composed.put_u8(7);
        composed.end();

        let content = Content::new(RaPolicy::Forbidden, 0);
        content.receive(composed.octets(), true).unwrap();

        assert_eq!(content.priority(), 7);
        assert_eq!(content.priority(), 7);
    }

    #[test]
    fn test_refcount_drops_release_buffers() {
        let live_before = crate::buffer::live_count();

        let content = Content::new(RaPolicy::Forbidden, 0);
        content.receive(&vec![0x42; BUF_SIZE * 4], false).unwrap();

        let second = content.clone();
        drop(content);

        // Buffers survive while any reference remains.
        assert_eq!(second.buf_count(), 4);
        drop(second);

        // All buffers are back in the pool; none leaked.
        assert!(crate::buffer::live_count() >= live_before);
    }
}

pub mod content;
pub mod parse;
pub mod stream;

pub use self::content::{Content, ReceiveStatus};
pub use self::parse::{Depth, DepthCheck, RaPolicy};
pub use self::stream::{SegmentKind, StreamData, StreamDataResult};

use crate::annotations::{RaStrip, RA_FLAG_STREAMING};
use crate::codec::Composed;
use crate::session::Session;
use crate::support::{ErrorType, PipeError, PipeResult};
use std::sync::Arc;

/// The maximum number of pre-built fragments `compose` accepts.
const MAX_COMPOSE_FRAGMENTS: usize = 5;

/// Result of one send pass over a message.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SendStatus {
    pub octets_sent: u64,
    pub q3_stalled: bool,
    pub send_complete: bool,
    pub aborted: bool,
}

/// A lightweight per-direction view over a shared content: the outgoing
/// byte cursor, the per-send annotation overrides and the send-complete
/// flag. Handles of the same content may be driven concurrently by
/// different workers; each owns only its own cursor.
pub struct Message {
    content: Arc<Content>,
    cursor: u64,
    annotations_emitted: bool,
    send_complete: bool,
    streaming: bool,
    to_override: Option<String>,
}

impl Message {
    pub fn new(content: Arc<Content>) -> Message {
        Message {
            content,
            cursor: 0,
            annotations_emitted: false,
            send_complete: false,
            streaming: false,
            to_override: None,
        }
    }

    /// A fresh handle over the same content, with its own cursor and
    /// overrides.
    pub fn fork(&self) -> Message {
        Message::new(self.content.clone())
    }

    /// Build a new outgoing message from up to five pre-built section
    /// fragments, taking ownership of them.
    pub fn compose(fragments: Vec<Composed>) -> Message {
        if fragments.len() > MAX_COMPOSE_FRAGMENTS {
            panic!("Attempted to compose from more than five fragments");
        }

        let content = Content::new(RaPolicy::Forbidden, 0);

        for fragment in &fragments {
            let _ = content.extend(fragment.octets());
        }

        content.set_receive_complete();

        Message::new(content)
    }

    /// Build a streaming outgoing message: fragments appended later via
    /// `extend`, completion signalled via the content.
    pub fn compose_streaming(fragments: Vec<Composed>) -> Message {
        if fragments.len() > MAX_COMPOSE_FRAGMENTS {
            panic!("Attempted to compose from more than five fragments");
        }

        let content = Content::new(RaPolicy::Forbidden, 0);

        for fragment in &fragments {
            let _ = content.extend(fragment.octets());
        }

        Message::new(content)
    }

    #[inline]
    pub fn content(&self) -> &Arc<Content> {
        &self.content
    }

    /// Append another fragment (streaming producers). Reports whether the
    /// append crossed the Q2 high watermark.
    pub fn extend(&self, fragment: &Composed) -> PipeResult<bool> {
        self.content.extend(fragment.octets())
    }

    /// Ingest inbound octets into the shared content.
    pub fn receive(&self, octets: &[u8], end: bool) -> PipeResult<ReceiveStatus> {
        self.content.receive(octets, end)
    }

    #[inline]
    pub fn check_depth(&self, depth: Depth) -> DepthCheck {
        self.content.check_depth(depth)
    }

    #[inline]
    pub fn is_send_complete(&self) -> bool {
        self.send_complete
    }

    /// Mark the message streaming in the emitted annotations.
    pub fn set_streaming(&mut self) {
        self.streaming = true;
    }

    /// Replace the forwarder-visible address in the emitted annotations.
    pub fn set_to_override(&mut self, address: &str) {
        self.to_override = Some(address.to_string());
    }

    /// Emit octets from the cursor into the session, composing the
    /// outgoing annotations on the first pass. Stops at the session's Q3
    /// high watermark; an aborted message is truncated at the current
    /// boundary.
    pub fn send(
        &mut self,
        session: &Session,
        strip: RaStrip,
        local_id: Option<&str>,
    ) -> PipeResult<SendStatus> {
        if self.content.is_cut_through() {
            return Err(PipeError::Fatal(ErrorType::CutThroughActive));
        }

        if let Some(error) = self.content.parse_error() {
            return Err(PipeError::Fatal(error));
        }

        let mut octets_sent = 0u64;

        if !self.annotations_emitted {
            let bare = self.content.bare_message_offset()?;

            let mut ra = self.content.router_annotations().unwrap_or_default();

            if self.streaming {
                ra.flags |= RA_FLAG_STREAMING;
            }

            if let Some(address) = &self.to_override {
                ra.to_override = Some(address.clone());
            }

            if ra.ingress_router.is_none() {
                // First interior router on the path names itself as the
                // ingress; edge routers leave the field null.
                ra.ingress_router = local_id.map(str::to_string);
            }

            let mut composed = Composed::new();

            if ra.emit(strip, local_id, &mut composed) {
                session.push_octets(composed.octets());
                octets_sent += composed.len() as u64;
            }

            self.cursor = bare;
            self.annotations_emitted = true;
        }

        let mut q3_stalled = session.is_q3_stalled();
        let mut chunk = [0u8; 512];

        while !q3_stalled && !self.content.is_aborted() {
            let extent = self.content.extent();

            if self.cursor >= extent {
                break;
            }

            let want = ((extent - self.cursor) as usize).min(chunk.len());
            let count = self.content.read_chunk(self.cursor, &mut chunk[..want]);

            if count == 0 {
                break;
            }

            q3_stalled = session.push_octets(&chunk[..count]);
            self.cursor += count as u64;
            octets_sent += count as u64;
        }

        let aborted = self.content.is_aborted();

        if aborted {
            // Truncate: nothing further is emitted for this message.
            self.send_complete = true;
        } else if self.content.is_receive_complete() && self.cursor >= self.content.extent() {
            self.send_complete = true;
        }

        Ok(SendStatus {
            octets_sent,
            q3_stalled,
            send_complete: self.send_complete,
            aborted,
        })
    }

    /// Lazy octet sequence over the named field's content. Valid for the
    /// life of the iterator, which pins the content.
    pub fn field_iterator(&self, depth: Depth) -> Option<FieldIterator> {
        let section = self.content.section(depth)?;

        Some(FieldIterator {
            content: self.content.clone(),
            next: section.value.body_offset(),
            end: section.end(),
            cache: [0; FIELD_CACHE],
            cache_len: 0,
            cache_pos: 0,
        })
    }
}

const FIELD_CACHE: usize = 64;

/// Lazy octet iterator over one field. Holds a content reference, so the
/// underlying buffers stay pinned while it lives.
pub struct FieldIterator {
    content: Arc<Content>,
    next: u64,
    end: u64,
    cache: [u8; FIELD_CACHE],
    cache_len: usize,
    cache_pos: usize,
}

impl Iterator for FieldIterator {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        if self.cache_pos == self.cache_len {
            if self.next >= self.end {
                return None;
            }

            let want = ((self.end - self.next) as usize).min(FIELD_CACHE);
            let count = self.content.read_chunk(self.next, &mut self.cache[..want]);

            if count == 0 {
                return None;
            }

            self.next += count as u64;
            self.cache_len = count;
            self.cache_pos = 0;
        }

        let octet = self.cache[self.cache_pos];
        self.cache_pos += 1;
        Some(octet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::{RaStrip, RouterAnnotations};
    use crate::chain::Chain;
    use crate::codec::{sections, Composed};

    fn properties_fragment(to: &str, subject: &str) -> Composed {
        let mut composed = Composed::new();
        composed.put_descriptor(sections::PROPERTIES);
        composed.start_list();
        composed.put_null();
        composed.put_null();
        composed.put_str(to);
        composed.put_str(subject);
        composed.end();
        composed
    }

    fn body_fragment(payload: &[u8]) -> Composed {
        let mut composed = Composed::new();
        composed.put_descriptor(sections::BODY_DATA);
        composed.put_binary(payload);
        composed
    }

    fn ra_message(ra: &RouterAnnotations, body: &[u8]) -> Arc<Content> {
        let mut composed = Composed::new();
        ra.emit(RaStrip::None, None, &mut composed);

        let content = Content::new(RaPolicy::Required, 0);
        content.receive(composed.octets(), false).unwrap();
        content.receive(properties_fragment("dest", "subj").octets(), false).unwrap();
        content.receive(body_fragment(body).octets(), true).unwrap();

        content
    }

    fn drain_session(session: &Session) -> Vec<u8> {
        let mut out = std::io::Cursor::new(Vec::new());
        session.flush(&mut out).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_compose_and_send() {
        let mut message = Message::compose(vec![
            properties_fragment("dest/a", "hello"),
            body_fragment(b"payload"),
        ]);

        assert_eq!(message.check_depth(Depth::Properties), DepthCheck::Ok);

        let session = Session::new(None);
        let status = message.send(&session, RaStrip::All, None).unwrap();

        assert!(status.send_complete);
        assert!(!status.q3_stalled);

        // Strip-all egress carries no annotations section.
        let octets = drain_session(&session);
        let mut chain = Chain::new();
        chain.append(&octets);

        assert!(RouterAnnotations::parse(&chain, 0).is_err());
    }

    #[test]
    #[should_panic(expected = "more than five fragments")]
    fn test_compose_fragment_cap() {
        let fragments = (0..6).map(|_| Composed::new()).collect();
        let _ = Message::compose(fragments);
    }

    #[test]
    fn test_annotations_passthrough_appends_trace() {
        // An inter-router message through R3: trace gains exactly one hop.
        let inbound = RouterAnnotations {
            flags: 1,
            ingress_router: Some("R1".to_string()),
            trace: vec!["R1".to_string(), "R2".to_string()],
            ..Default::default()
        };

        let content = ra_message(&inbound, b"data");
        let mut message = Message::new(content);

        let session = Session::new(None);
        message.send(&session, RaStrip::None, Some("R3")).unwrap();

        let octets = drain_session(&session);
        let mut chain = Chain::new();
        chain.append(&octets);

        let (emitted, _) = RouterAnnotations::parse(&chain, 0).unwrap();

        assert_eq!(emitted.flags, 1);
        assert_eq!(emitted.ingress_router.as_deref(), Some("R1"));
        assert_eq!(emitted.trace, vec!["R1", "R2", "R3"]);
    }

    #[test]
    fn test_ingress_router_set_on_first_interior_hop() {
        let mut message = Message::compose(vec![
            properties_fragment("dest", "s"),
            body_fragment(b"x"),
        ]);

        let session = Session::new(None);
        message.send(&session, RaStrip::None, Some("R7")).unwrap();

        let octets = drain_session(&session);
        let mut chain = Chain::new();
        chain.append(&octets);

        let (emitted, _) = RouterAnnotations::parse(&chain, 0).unwrap();

        assert_eq!(emitted.ingress_router.as_deref(), Some("R7"));
        assert_eq!(emitted.trace, vec!["R7"]);
    }

    #[test]
    fn test_streaming_flag_and_to_override() {
        let mut message = Message::compose(vec![
            properties_fragment("dest", "s"),
            body_fragment(b"x"),
        ]);
        message.set_streaming();
        message.set_to_override("alt/address");

        let session = Session::new(None);
        message.send(&session, RaStrip::None, None).unwrap();

        let octets = drain_session(&session);
        let mut chain = Chain::new();
        chain.append(&octets);

        let (emitted, _) = RouterAnnotations::parse(&chain, 0).unwrap();

        assert!(emitted.is_streaming());
        assert_eq!(emitted.to_override.as_deref(), Some("alt/address"));
    }

    #[test]
    fn test_send_resumes_after_q3_stall() {
        let mut fragments = vec![properties_fragment("dest", "s")];
        // Enough body to overflow the session's Q3 window.
        for _ in 0..4 {
            fragments.push(body_fragment(&vec![0x5A; 40 * 1024]));
        }

        let mut message = Message::compose(fragments);
        let session = Session::new(None);

        let status = message.send(&session, RaStrip::All, None).unwrap();
        assert!(status.q3_stalled);
        assert!(!status.send_complete);

        // Drain the transport, then the send completes.
        let mut drained = drain_session(&session);

        let status = message.send(&session, RaStrip::All, None).unwrap();
        assert!(status.send_complete);

        drained.extend(drain_session(&session));
    }

    #[test]
    fn test_aborted_message_truncates() {
        let mut message = Message::compose_streaming(vec![
            properties_fragment("dest", "s"),
            body_fragment(b"first"),
        ]);

        let session = Session::new(None);
        message.send(&session, RaStrip::All, None).unwrap();

        message.content().set_aborted();

        let status = message.send(&session, RaStrip::All, None).unwrap();

        assert!(status.aborted);
        assert!(status.send_complete);
        assert_eq!(status.octets_sent, 0);
    }

    #[test]
    fn test_field_iterator_reads_body() {
        let message = Message::compose(vec![
            properties_fragment("dest", "s"),
            body_fragment(b"iterate me"),
        ]);

        assert_eq!(message.check_depth(Depth::Body), DepthCheck::Ok);

        let octets: Vec<u8> = message
            .field_iterator(Depth::Body)
            .expect("Body must be located")
            .collect();

        // The body field content is the vbin payload behind its header.
        assert_eq!(&octets, b"iterate me");
    }

    #[test]
    fn test_concurrent_handles_independent_cursors() {
        let message = Message::compose(vec![
            properties_fragment("dest", "s"),
            body_fragment(b"shared body"),
        ]);

        let mut first = message.fork();
        let mut second = message.fork();

        let session_a = Session::new(None);
        let session_b = Session::new(None);

        let status_a = first.send(&session_a, RaStrip::All, None).unwrap();
        let status_b = second.send(&session_b, RaStrip::All, None).unwrap();

        assert!(status_a.send_complete);
        assert!(status_b.send_complete);
        assert_eq!(drain_session(&session_a), drain_session(&session_b));
    }
}

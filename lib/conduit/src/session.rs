use crate::chain::Chain;
use crate::flow::flow_tuning;
use indexmap::IndexSet;
use std::io;
use std::sync::{Mutex, MutexGuard};
use weft::logging::{self, Logger};

pub type LinkId = usize;

struct SessionState {
    outgoing: Chain,
    written: u64,
    q3_stalled: bool,
    stalled_links: IndexSet<LinkId>,
    resumable: Vec<LinkId>,
}

/// One AMQP session: the unit of Q3 accounting. All links of the session
/// funnel their outgoing octets through the session's pending chain; once
/// the pending octets climb past the high watermark no link on the session
/// may push further frames, and they all resume together when the transport
/// drains the backlog to the low watermark.
pub struct Session {
    state: Mutex<SessionState>,
    log: Logger,
}

impl Session {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> Session {
        Session {
            state: Mutex::new(SessionState {
                outgoing: Chain::new(),
                written: 0,
                q3_stalled: false,
                stalled_links: IndexSet::new(),
                resumable: Vec::new(),
            }),
            log: logging::component(log, "session"),
        }
    }

    #[inline]
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().expect("Session lock poisoned")
    }

    /// Octets queued for the transport and not yet written.
    pub fn pending_octets(&self) -> u64 {
        let state = self.lock();
        state.outgoing.extent() - state.written
    }

    pub fn is_q3_stalled(&self) -> bool {
        self.lock().q3_stalled
    }

    /// Queue octets for the transport. Returns true when the session is Q3
    /// stalled after the push; the caller must stop pushing until the links
    /// are resumed.
    pub fn push_octets(&self, octets: &[u8]) -> bool {
        let mut state = self.lock();

        state.outgoing.append(octets);

        let pending = state.outgoing.extent() - state.written;

        if !state.q3_stalled && pending > flow_tuning().q3_upper_octets() {
            state.q3_stalled = true;

            logging::trace!(self.log, "session stalled on q3";
                            "context" => "push_octets",
                            "pending" => pending);
        }

        state.q3_stalled
    }

    /// Record a link that observed the stall and must be resumed when the
    /// session drains.
    pub fn note_stalled_link(&self, link: LinkId) {
        self.lock().stalled_links.insert(link);
    }

    /// Write pending octets to the transport. Folds `WouldBlock` into a
    /// short count the way the event loop expects. Crossing the low
    /// watermark clears the stall and queues every stalled link for
    /// resumption.
    pub fn flush<W: io::Write>(&self, writer: &mut W) -> io::Result<u64> {
        let mut state = self.lock();
        let mut total = 0u64;

        while state.written < state.outgoing.extent() {
            let chunk = match state.outgoing.chunk_at(state.written) {
                Some(chunk) => chunk,
                None => break,
            };

            let count = match writer.write(chunk) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => count,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err),
            };

            state.written += count as u64;
            total += count as u64;
        }

        let written = state.written;
        state.outgoing.release_to(written);

        let pending = state.outgoing.extent() - state.written;

        if state.q3_stalled && pending <= flow_tuning().q3_lower_octets() {
            state.q3_stalled = false;

            let resumed: Vec<LinkId> = state.stalled_links.drain(..).collect();

            logging::trace!(self.log, "session resumed from q3";
                            "context" => "flush",
                            "pending" => pending,
                            "resumed_links" => resumed.len());

            state.resumable.extend(resumed);
        }

        Ok(total)
    }

    /// Drain the links queued for resumption since the last call.
    pub fn drain_resumable(&self) -> Vec<LinkId> {
        let mut state = self.lock();
        std::mem::replace(&mut state.resumable, Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BUF_SIZE;
    use crate::flow::Q3_UPPER_DEFAULT;
    use std::io::Cursor;

    struct ThrottledWriter {
        data: Vec<u8>,
        budget: usize,
    }

    impl io::Write for ThrottledWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = buf.len().min(self.budget);
            self.budget -= count;
            self.data.extend_from_slice(&buf[..count]);
            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_push_until_stalled() {
        let session = Session::new(None);
        let block = vec![0xCD; BUF_SIZE];

        let mut pushes = 0;

        while !session.push_octets(&block) {
            pushes += 1;
            assert!(pushes < Q3_UPPER_DEFAULT * 2, "Session never stalled");
        }

        assert!(session.is_q3_stalled());
        assert!(session.pending_octets() > (Q3_UPPER_DEFAULT * BUF_SIZE) as u64);
    }

    #[test]
    fn test_flush_resumes_stalled_links() {
        let session = Session::new(None);
        let block = vec![0xCD; BUF_SIZE];

        while !session.push_octets(&block) {}

        session.note_stalled_link(3);
        session.note_stalled_link(8);

        // Drain everything; the stall clears and both links resume.
        let mut sink = Cursor::new(Vec::new());
        let flushed = session.flush(&mut sink).unwrap();

        assert!(flushed > 0);
        assert!(!session.is_q3_stalled());
        assert_eq!(session.drain_resumable(), vec![3, 8]);
        assert!(session.drain_resumable().is_empty());
    }

    #[test]
    fn test_flush_folds_wouldblock() {
        let session = Session::new(None);
        session.push_octets(&[0xAB; 100]);

        let mut writer = ThrottledWriter {
            data: Vec::new(),
            budget: 40,
        };

        // A transport that blocks mid-write yields a short count, not an
        // error.
        let flushed = session.flush(&mut writer).unwrap();

        assert_eq!(flushed, 40);
        assert_eq!(session.pending_octets(), 60);

        writer.budget = 100;
        let flushed = session.flush(&mut writer).unwrap();

        assert_eq!(flushed, 60);
        assert_eq!(session.pending_octets(), 0);
        assert_eq!(writer.data, vec![0xAB; 100]);
    }

    #[test]
    fn test_stall_clears_only_below_low_watermark() {
        let session = Session::new(None);
        let block = vec![0xCD; BUF_SIZE];

        while !session.push_octets(&block) {}
        session.note_stalled_link(1);

        // Drain a sliver: still stalled.
        let mut writer = ThrottledWriter {
            data: Vec::new(),
            budget: BUF_SIZE,
        };
        session.flush(&mut writer).unwrap();

        assert!(session.is_q3_stalled());
        assert!(session.drain_resumable().is_empty());
    }
}

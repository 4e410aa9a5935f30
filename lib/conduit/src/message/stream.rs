use crate::chain::Chain;
use crate::message::parse::{scan_section, SectionLocation, SectionTable};
use crate::support::PipeError;
use weft::either;

/// One released-independently unit of a streaming body: a body-data section
/// or the trailing footer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SegmentKind {
    Body,
    Footer,
}

#[derive(Debug)]
pub struct Segment {
    pub kind: SegmentKind,
    pub location: SectionLocation,
    pub released: bool,
}

/// A segment handed out by the stream iterator. Offsets stay valid while
/// the content holds the referenced buffers; releasing the segment gives
/// them back.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct StreamData {
    pub id: usize,
    pub kind: SegmentKind,
    pub section_offset: u64,
    pub payload_offset: u64,
    pub payload_length: u64,
}

/// Outcome of asking for the next stream segment.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StreamDataResult {
    BodyOk(StreamData),
    FooterOk(StreamData),
    Incomplete,
    NoMore,
    Invalid,
    Aborted,
}

/// Walks the body of a streaming message section by section, behind the
/// depth parser. Non-restartable: the scan cursor only moves forward, and
/// consumed segments are handed out exactly once.
#[derive(Debug, Default)]
pub struct BodyScan {
    cursor: Option<u64>,
    segments: Vec<Segment>,
    next_out: usize,
    released_prefix: usize,
    finished: bool,
    invalid: bool,
}

impl BodyScan {
    /// Adopt the first body section once the depth parser locates it.
    pub fn sync_first(&mut self, sections: &SectionTable) {
        if self.cursor.is_some() {
            return;
        }

        if let Some(first) = sections.body_first {
            self.segments.push(Segment {
                kind: SegmentKind::Body,
                location: first,
                released: false,
            });
            self.cursor = Some(first.end());
        } else if let Some(footer) = sections.footer {
            // Body-less message with a footer.
            self.segments.push(Segment {
                kind: SegmentKind::Footer,
                location: footer,
                released: false,
            });
            self.cursor = Some(footer.end());
            self.finished = true;
        }
    }

    /// Number of segments scanned so far.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid
    }

    /// Yield the next unconsumed segment, scanning further into the chain
    /// as needed.
    pub fn next(
        &mut self,
        chain: &Chain,
        sections: &mut SectionTable,
        receive_complete: bool,
        aborted: bool,
    ) -> StreamDataResult {
        if aborted {
            return StreamDataResult::Aborted;
        }

        if self.invalid {
            return StreamDataResult::Invalid;
        }

        loop {
            if self.next_out < self.segments.len() {
                let segment = &self.segments[self.next_out];
                let id = self.next_out;
                self.next_out += 1;

                let data = StreamData {
                    id,
                    kind: segment.kind,
                    section_offset: segment.location.section_offset,
                    payload_offset: segment.location.value.body_offset(),
                    payload_length: segment.location.value.length,
                };

                return match segment.kind {
                    SegmentKind::Body => StreamDataResult::BodyOk(data),
                    SegmentKind::Footer => StreamDataResult::FooterOk(data),
                };
            }

            match self.scan_more(chain, sections, receive_complete) {
                Scan::Pushed => continue,
                Scan::End => return StreamDataResult::NoMore,
                Scan::Incomplete => return StreamDataResult::Incomplete,
                Scan::Invalid => return StreamDataResult::Invalid,
            }
        }
    }

    fn scan_more(&mut self, chain: &Chain, sections: &mut SectionTable, receive_complete: bool) -> Scan {
        let cursor = match self.cursor {
            Some(cursor) => cursor,
            // The depth parser has not located any body yet.
            None => return either!(receive_complete, Scan::End, Scan::Incomplete),
        };

        if cursor >= chain.extent() {
            return either!(receive_complete, Scan::End, Scan::Incomplete);
        }

        // Octets after the footer do not belong to any section.
        if self.finished {
            self.invalid = true;
            return Scan::Invalid;
        }

        let (code, location) = match scan_section(chain, cursor) {
            Ok(scanned) => scanned,
            Err(PipeError::Wait) => return Scan::Incomplete,
            Err(_) => {
                self.invalid = true;
                return Scan::Invalid;
            }
        };

        use crate::codec::sections;

        let kind = match code {
            sections::BODY_DATA | sections::BODY_SEQUENCE | sections::BODY_VALUE => SegmentKind::Body,
            sections::FOOTER => SegmentKind::Footer,
            _ => {
                self.invalid = true;
                return Scan::Invalid;
            }
        };

        if kind == SegmentKind::Footer {
            sections.footer = Some(location);
            self.finished = true;
        }

        self.segments.push(Segment {
            kind,
            location,
            released: false,
        });
        self.cursor = Some(location.end());

        Scan::Pushed
    }

    /// Walk the remaining body sections looking for the footer, without
    /// consuming segments. Used by depth checks that target the footer.
    pub fn locate_footer(
        &mut self,
        chain: &Chain,
        sections: &mut SectionTable,
        receive_complete: bool,
    ) -> crate::message::parse::DepthCheck {
        use crate::message::parse::DepthCheck;

        loop {
            if sections.footer.is_some() {
                return DepthCheck::Ok;
            }

            match self.scan_more(chain, sections, receive_complete) {
                Scan::Pushed => continue,
                // A complete message without a footer: the optional section
                // is absent.
                Scan::End => return DepthCheck::Ok,
                Scan::Incomplete => return DepthCheck::Incomplete,
                Scan::Invalid => return DepthCheck::Invalid,
            }
        }
    }

    /// Release one segment. Buffers are returned to the pool once the
    /// released region forms a contiguous prefix. Returns the number of
    /// buffers released.
    pub fn release(&mut self, chain: &mut Chain, id: usize) -> usize {
        if id >= self.segments.len() || self.segments[id].released {
            return 0;
        }

        self.segments[id].released = true;
        self.advance_released(chain)
    }

    /// Release the segment and every earlier still-held segment. Releasing
    /// below an already-released prefix is a no-op.
    pub fn release_up_to(&mut self, chain: &mut Chain, id: usize) -> usize {
        let limit = (id + 1).min(self.segments.len());

        for segment in &mut self.segments[..limit] {
            segment.released = true;
        }

        self.advance_released(chain)
    }

    fn advance_released(&mut self, chain: &mut Chain) -> usize {
        while self.released_prefix < self.segments.len() && self.segments[self.released_prefix].released {
            self.released_prefix += 1;
        }

        if self.released_prefix == 0 {
            return 0;
        }

        let released_to = self.segments[self.released_prefix - 1].location.end();
        chain.release_to(released_to)
    }
}

enum Scan {
    Pushed,
    End,
    Incomplete,
    Invalid,
}

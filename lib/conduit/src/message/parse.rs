use crate::annotations::RouterAnnotations;
use crate::chain::{Chain, ChainCursor};
use crate::codec::{self, sections, FieldLocation};
use crate::support::{ErrorType, PipeError, PipeResult};

/// How deep into the section sequence parsing has progressed. Depths only
/// ever increase; each step consumes one complete section off the chain.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum Depth {
    None,
    RouterAnnotations,
    Header,
    DeliveryAnnotations,
    MessageAnnotations,
    Properties,
    ApplicationProperties,
    Body,
    RawBody,
    Footer,
}

/// Result of a depth check. `Ok` covers absent optional sections.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DepthCheck {
    Ok,
    Incomplete,
    Invalid,
}

/// Whether the ingress link is allowed (and required) to carry the
/// router-annotations section.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RaPolicy {
    /// Inter-router ingress: the custom section must lead the message.
    Required,
    /// Client ingress: the custom section must be absent.
    Forbidden,
}

/// A located message section: the offset of its 0x00 constructor plus the
/// location of the value field that follows the descriptor.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SectionLocation {
    pub section_offset: u64,
    pub value: FieldLocation,
}

impl SectionLocation {
    /// Absolute offset one past the section.
    #[inline]
    pub fn end(&self) -> u64 {
        self.value.end()
    }
}

/// Per-section locations, recorded once when each section is fully
/// buffered.
#[derive(Debug, Default)]
pub struct SectionTable {
    pub ra: Option<SectionLocation>,
    pub header: Option<SectionLocation>,
    pub delivery_annotations: Option<SectionLocation>,
    pub message_annotations: Option<SectionLocation>,
    pub properties: Option<SectionLocation>,
    pub application_properties: Option<SectionLocation>,
    pub body_first: Option<SectionLocation>,
    pub footer: Option<SectionLocation>,
}

impl SectionTable {
    pub fn get(&self, depth: Depth) -> Option<&SectionLocation> {
        match depth {
            Depth::RouterAnnotations => self.ra.as_ref(),
            Depth::Header => self.header.as_ref(),
            Depth::DeliveryAnnotations => self.delivery_annotations.as_ref(),
            Depth::MessageAnnotations => self.message_annotations.as_ref(),
            Depth::Properties => self.properties.as_ref(),
            Depth::ApplicationProperties => self.application_properties.as_ref(),
            Depth::Body | Depth::RawBody => self.body_first.as_ref(),
            Depth::Footer => self.footer.as_ref(),
            Depth::None => None,
        }
    }
}

/// The resumable parse cursor and everything it has established so far.
#[derive(Debug)]
pub struct ParseState {
    pub cursor: u64,
    pub depth: Depth,
    pub error: Option<ErrorType>,
    pub sections: SectionTable,
    pub ra: Option<RouterAnnotations>,
    pub policy: RaPolicy,
}

impl ParseState {
    pub fn new(policy: RaPolicy) -> ParseState {
        ParseState {
            cursor: 0,
            depth: Depth::None,
            error: None,
            sections: SectionTable::default(),
            ra: None,
            policy,
        }
    }
}

/// Outcome of attempting to consume one section.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Step {
    /// A section was consumed and the depth advanced.
    Advanced,
    /// The chain ends exactly at the cursor.
    End,
    /// The next section is not fully buffered yet.
    Incomplete,
    /// The octets are malformed or the section order is violated.
    Invalid,
}

/// Scan the described section at `offset`: the descriptor code and the
/// location of the whole section.
pub fn scan_section(chain: &Chain, offset: u64) -> PipeResult<(u64, SectionLocation)> {
    let mut cursor = ChainCursor::new_at(offset);

    match cursor.read_u8(chain) {
        Some(codec::tags::DESCRIBED) => (),
        Some(_) => return Err(PipeError::Fatal(ErrorType::Malformed)),
        None => return Err(PipeError::Wait),
    }

    let code = codec::read_descriptor(chain, &mut cursor)?;
    let value = codec::scan_primitive(chain, &mut cursor)?;

    Ok((
        code,
        SectionLocation {
            section_offset: offset,
            value,
        },
    ))
}

fn section_depth(code: u64) -> Option<Depth> {
    match code {
        sections::ROUTER_ANNOTATIONS => Some(Depth::RouterAnnotations),
        sections::HEADER => Some(Depth::Header),
        sections::DELIVERY_ANNOTATIONS => Some(Depth::DeliveryAnnotations),
        sections::MESSAGE_ANNOTATIONS => Some(Depth::MessageAnnotations),
        sections::PROPERTIES => Some(Depth::Properties),
        sections::APPLICATION_PROPERTIES => Some(Depth::ApplicationProperties),
        sections::BODY_DATA | sections::BODY_SEQUENCE | sections::BODY_VALUE => Some(Depth::Body),
        sections::FOOTER => Some(Depth::Footer),
        _ => None,
    }
}

/// Consume the next section at the cursor, advancing the depth. Stops
/// advancing once the body is reached; body sections beyond the first are
/// the stream segmenter's to consume.
pub fn step(state: &mut ParseState, chain: &Chain, receive_complete: bool) -> Step {
    if state.error.is_some() {
        return Step::Invalid;
    }

    if state.depth >= Depth::Body {
        return Step::Advanced;
    }

    if state.cursor >= chain.extent() {
        return match receive_complete {
            true => Step::End,
            false => Step::Incomplete,
        };
    }

    let (code, location) = match scan_section(chain, state.cursor) {
        Ok(scanned) => scanned,
        Err(PipeError::Wait) => return Step::Incomplete,
        Err(_) => {
            state.error = Some(ErrorType::Malformed);
            return Step::Invalid;
        }
    };

    let depth = match section_depth(code) {
        Some(depth) => depth,
        None => {
            state.error = Some(ErrorType::Malformed);
            return Step::Invalid;
        }
    };

    // Sections must appear in the mandated order, each at most once.
    if depth <= state.depth {
        state.error = Some(ErrorType::SectionOrder);
        return Step::Invalid;
    }

    // The custom section leads the message or does not appear at all, and
    // only router ingress may carry it.
    if depth == Depth::RouterAnnotations {
        if state.policy == RaPolicy::Forbidden {
            state.error = Some(ErrorType::AnnotationsForbidden);
            return Step::Invalid;
        }

        match RouterAnnotations::parse(chain, state.cursor) {
            Ok((ra, _)) => state.ra = Some(ra),
            Err(PipeError::Wait) => return Step::Incomplete,
            Err(_) => {
                state.error = Some(ErrorType::Malformed);
                return Step::Invalid;
            }
        }
    } else if state.depth == Depth::None && state.policy == RaPolicy::Required {
        state.error = Some(ErrorType::AnnotationsMissing);
        return Step::Invalid;
    }

    match depth {
        Depth::RouterAnnotations => state.sections.ra = Some(location),
        Depth::Header => state.sections.header = Some(location),
        Depth::DeliveryAnnotations => state.sections.delivery_annotations = Some(location),
        Depth::MessageAnnotations => state.sections.message_annotations = Some(location),
        Depth::Properties => state.sections.properties = Some(location),
        Depth::ApplicationProperties => state.sections.application_properties = Some(location),
        Depth::Body => state.sections.body_first = Some(location),
        Depth::Footer => state.sections.footer = Some(location),
        Depth::None | Depth::RawBody => unreachable!(),
    }

    state.cursor = location.end();
    state.depth = depth;

    Step::Advanced
}

/// Drive the parser until `target` is reached or progress stops. Targets at
/// or beyond the body only guarantee the pre-body sections here; the body
/// stream itself is walked by the segmenter.
pub fn advance(state: &mut ParseState, chain: &Chain, target: Depth, receive_complete: bool) -> DepthCheck {
    loop {
        if state.depth >= target {
            return DepthCheck::Ok;
        }

        match step(state, chain, receive_complete) {
            Step::Advanced => {
                if state.depth >= Depth::Body {
                    return DepthCheck::Ok;
                }
            }
            // End of a complete message: the remaining optional sections
            // are absent.
            Step::End => return DepthCheck::Ok,
            Step::Incomplete => return DepthCheck::Incomplete,
            Step::Invalid => return DepthCheck::Invalid,
        }
    }
}

/// Lazily extract the priority octet from the header section. Defaults to 4
/// when the header or the field is absent, clamped to the valid range.
pub fn parse_priority(chain: &Chain, header: &SectionLocation) -> u8 {
    const DEFAULT_PRIORITY: u8 = 4;
    const MAX_PRIORITY: u8 = 9;

    let mut cursor = ChainCursor::new_at(header.value.offset);

    let (count, _) = match codec::read_list_header(chain, &mut cursor) {
        Ok(header) => header,
        Err(_) => return DEFAULT_PRIORITY,
    };

    if count < 2 {
        return DEFAULT_PRIORITY;
    }

    // Field 1 is durable, field 2 is priority.
    match codec::scan_primitive(chain, &mut cursor) {
        Ok(_) => (),
        Err(_) => return DEFAULT_PRIORITY,
    }

    let mut field = ChainCursor::new_at(cursor.offset());

    match field.read_u8(chain) {
        Some(codec::tags::UBYTE) => match field.read_u8(chain) {
            Some(priority) => priority.min(MAX_PRIORITY),
            None => DEFAULT_PRIORITY,
        },
        _ => DEFAULT_PRIORITY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Composed;

    fn header_section(priority: Option<u8>) -> Vec<u8> {
        let mut composed = Composed::new();
        composed.put_descriptor(sections::HEADER);
        composed.start_list();
        composed.put_bool(false);
        match priority {
            Some(priority) => composed.put_u8(priority),
            None => composed.put_null(),
        }
        composed.end();
        composed.into_vec()
    }

    fn properties_section() -> Vec<u8> {
        let mut composed = Composed::new();
        composed.put_descriptor(sections::PROPERTIES);
        composed.start_list();
        composed.put_null();
        composed.put_null();
        composed.put_str("dest/queue");
        composed.put_str("subject");
        composed.end();
        composed.into_vec()
    }

    fn body_section(payload: &[u8]) -> Vec<u8> {
        let mut composed = Composed::new();
        composed.put_descriptor(sections::BODY_DATA);
        composed.put_binary(payload);
        composed.into_vec()
    }

    fn chain_of(parts: &[Vec<u8>]) -> Chain {
        let mut chain = Chain::new();
        for part in parts {
            chain.append(part);
        }
        chain
    }

    #[test]
    fn test_advance_through_sections() {
        let chain = chain_of(&[header_section(Some(7)), properties_section(), body_section(b"hi")]);
        let mut state = ParseState::new(RaPolicy::Forbidden);

        assert_eq!(advance(&mut state, &chain, Depth::Properties, true), DepthCheck::Ok);
        assert_eq!(state.depth, Depth::Properties);
        assert!(state.sections.header.is_some());
        assert!(state.sections.properties.is_some());

        assert_eq!(advance(&mut state, &chain, Depth::Body, true), DepthCheck::Ok);
        assert_eq!(state.depth, Depth::Body);
        assert!(state.sections.body_first.is_some());
    }

    #[test]
    fn test_absent_optional_sections_are_ok() {
        // Properties only, complete: every other depth resolves Ok.
        let chain = chain_of(&[properties_section()]);
        let mut state = ParseState::new(RaPolicy::Forbidden);

        assert_eq!(advance(&mut state, &chain, Depth::Footer, true), DepthCheck::Ok);
        assert!(state.sections.header.is_none());
        assert!(state.sections.body_first.is_none());
    }

    #[test]
    fn test_incomplete_until_more_octets() {
        let full = properties_section();
        let mut chain = chain_of(&[full[..full.len() - 3].to_vec()]);
        let mut state = ParseState::new(RaPolicy::Forbidden);

        assert_eq!(advance(&mut state, &chain, Depth::Properties, false), DepthCheck::Incomplete);

        // Parsing resumes at the same cursor once the rest arrives.
        chain.append(&full[full.len() - 3..]);

        assert_eq!(advance(&mut state, &chain, Depth::Properties, false), DepthCheck::Ok);
    }

    #[test]
    fn test_out_of_order_sections_invalid() {
        let chain = chain_of(&[properties_section(), header_section(None)]);
        let mut state = ParseState::new(RaPolicy::Forbidden);

        assert_eq!(advance(&mut state, &chain, Depth::Body, true), DepthCheck::Invalid);
        assert_eq!(state.error, Some(ErrorType::SectionOrder));
    }

    #[test]
    fn test_ra_forbidden_on_client_ingress() {
        let mut ra = Composed::new();
        crate::annotations::RouterAnnotations::default().emit(
            crate::annotations::RaStrip::None,
            None,
            &mut ra,
        );

        let chain = chain_of(&[ra.into_vec(), properties_section()]);
        let mut state = ParseState::new(RaPolicy::Forbidden);

        assert_eq!(advance(&mut state, &chain, Depth::Properties, true), DepthCheck::Invalid);
        assert_eq!(state.error, Some(ErrorType::AnnotationsForbidden));
    }

    #[test]
    fn test_ra_required_on_router_ingress() {
        let chain = chain_of(&[properties_section()]);
        let mut state = ParseState::new(RaPolicy::Required);

        assert_eq!(advance(&mut state, &chain, Depth::Properties, true), DepthCheck::Invalid);
        assert_eq!(state.error, Some(ErrorType::AnnotationsMissing));
    }

    #[test]
    fn test_ra_parsed_on_router_ingress() {
        let mut ra_composed = Composed::new();
        crate::annotations::RouterAnnotations {
            flags: 1,
            ingress_router: Some("R1".to_string()),
            trace: vec!["R1".to_string()],
            ..Default::default()
        }
        .emit(crate::annotations::RaStrip::None, None, &mut ra_composed);

        let chain = chain_of(&[ra_composed.into_vec(), properties_section()]);
        let mut state = ParseState::new(RaPolicy::Required);

        assert_eq!(advance(&mut state, &chain, Depth::Properties, true), DepthCheck::Ok);

        let ra = state.ra.as_ref().expect("Annotations must be parsed");
        assert_eq!(ra.flags, 1);
        assert_eq!(ra.trace, vec!["R1"]);
    }

    #[test]
    fn test_depth_never_decreases() {
        let chain = chain_of(&[header_section(None), properties_section()]);
        let mut state = ParseState::new(RaPolicy::Forbidden);

        assert_eq!(advance(&mut state, &chain, Depth::Properties, true), DepthCheck::Ok);
        let reached = state.depth;

        // Asking for a shallower depth must not rewind anything.
        assert_eq!(advance(&mut state, &chain, Depth::Header, true), DepthCheck::Ok);
        assert_eq!(state.depth, reached);
    }

    #[test]
    fn test_priority_parse() {
        let chain = chain_of(&[header_section(Some(7))]);
        let mut state = ParseState::new(RaPolicy::Forbidden);
        advance(&mut state, &chain, Depth::Header, true);

        let header = state.sections.header.unwrap();
        assert_eq!(parse_priority(&chain, &header), 7);
    }

    #[test]
    fn test_priority_defaults_and_clamps() {
        let chain = chain_of(&[header_section(None)]);
        let mut state = ParseState::new(RaPolicy::Forbidden);
        advance(&mut state, &chain, Depth::Header, true);
        let header = state.sections.header.unwrap();
        assert_eq!(parse_priority(&chain, &header), 4);

        let chain = chain_of(&[header_section(Some(200))]);
        let mut state = ParseState::new(RaPolicy::Forbidden);
        advance(&mut state, &chain, Depth::Header, true);
        let header = state.sections.header.unwrap();
        assert_eq!(parse_priority(&chain, &header), 9);
    }
}

use crate::chain::{Chain, ChainCursor};
use crate::codec::{self, sections, Composed};
use crate::support::{ErrorType, PipeError, PipeResult};

/// Connection-open property key advertising the annotations version.
pub const VERSION_KEY: &str = "qd.annotations-version";

/// Version this router speaks. Peers use the numerical minimum.
pub const VERSION: i32 = 2;

/// Bit 0 of the flags field marks a streaming message. All other bits are
/// reserved and passed through unchanged.
pub const RA_FLAG_STREAMING: u32 = 0x01;

/// The effective version for a session given the peer's advertised value.
#[inline]
pub fn negotiate_version(peer: i32) -> i32 {
    VERSION.min(peer)
}

/// How much of the inbound annotations to reproduce on egress.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RaStrip {
    /// Inter-router egress: keep everything.
    None,
    /// Drop the ingress-router and ingress-mesh fields.
    Ingress,
    /// Emit an empty trace and do not append the local id.
    Trace,
    /// Non-router egress: the section is omitted entirely.
    All,
}

/// The custom leading section carried between routers: ingress router id,
/// the trace of interior routers crossed, an optional address override,
/// flags, and the ingress mesh id.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct RouterAnnotations {
    pub flags: u32,
    pub to_override: Option<String>,
    pub ingress_router: Option<String>,
    pub trace: Vec<String>,
    pub ingress_mesh: Option<String>,
}

impl RouterAnnotations {
    #[inline]
    pub fn is_streaming(&self) -> bool {
        self.flags & RA_FLAG_STREAMING != 0
    }

    /// Parse the section at `offset`, which must be the 0x00 constructor of
    /// the composite. Returns the annotations and the offset one past the
    /// section.
    pub fn parse(chain: &Chain, offset: u64) -> PipeResult<(RouterAnnotations, u64)> {
        let mut cursor = ChainCursor::new_at(offset);

        match cursor.read_u8(chain) {
            Some(codec::tags::DESCRIBED) => (),
            Some(_) => return Err(PipeError::Fatal(ErrorType::Malformed)),
            None => return Err(PipeError::Wait),
        }

        let descriptor = codec::read_descriptor(chain, &mut cursor)?;

        if descriptor != sections::ROUTER_ANNOTATIONS {
            return Err(PipeError::Fatal(ErrorType::Malformed));
        }

        let (count, end) = codec::read_list_header(chain, &mut cursor)?;

        if end > chain.extent() {
            return Err(PipeError::Wait);
        }

        let mut ra = RouterAnnotations::default();

        if count >= 1 {
            ra.flags = codec::read_u32_field(chain, &mut cursor)?.unwrap_or(0);
        }

        if count >= 2 {
            ra.to_override = codec::read_str(chain, &mut cursor)?;
        }

        if count >= 3 {
            ra.ingress_router = codec::read_str(chain, &mut cursor)?;
        }

        if count >= 4 {
            ra.trace = Self::parse_trace(chain, &mut cursor)?;
        }

        if count >= 5 {
            ra.ingress_mesh = codec::read_str(chain, &mut cursor)?;
        }

        // Fields added by a newer peer are skipped, not rejected.
        Ok((ra, end))
    }

    fn parse_trace(chain: &Chain, cursor: &mut ChainCursor) -> PipeResult<Vec<String>> {
        if cursor.peek_u8(chain) == Some(codec::tags::NULL) {
            let _ = cursor.read_u8(chain);
            return Ok(Vec::new());
        }

        let (count, end) = codec::read_list_header(chain, cursor)?;
        let mut trace = Vec::with_capacity(count as usize);

        for _ in 0..count {
            match codec::read_str(chain, cursor)? {
                Some(hop) => trace.push(hop),
                None => return Err(PipeError::Fatal(ErrorType::Malformed)),
            }
        }

        if cursor.offset() != end {
            return Err(PipeError::Fatal(ErrorType::Malformed));
        }

        Ok(trace)
    }

    /// Emit the egress form of these annotations. `local_id` is the id of
    /// this router when it is an interior router (appended to the trace
    /// exactly once); edge routers pass `None`. Returns false without
    /// writing anything when the strip mode omits the section.
    pub fn emit(&self, strip: RaStrip, local_id: Option<&str>, composed: &mut Composed) -> bool {
        if strip == RaStrip::All {
            return false;
        }

        composed.put_descriptor(sections::ROUTER_ANNOTATIONS);
        composed.start_list();

        composed.put_u32(self.flags);

        match &self.to_override {
            Some(addr) => composed.put_str(addr),
            None => composed.put_null(),
        }

        match (&self.ingress_router, strip) {
            (_, RaStrip::Ingress) | (None, _) => composed.put_null(),
            (Some(ingress), _) => composed.put_str(ingress),
        }

        composed.start_list();
        if strip != RaStrip::Trace {
            for hop in &self.trace {
                composed.put_str(hop);
            }
            if let Some(local) = local_id {
                composed.put_str(local);
            }
        }
        composed.end();

        match (&self.ingress_mesh, strip) {
            (_, RaStrip::Ingress) | (None, _) => composed.put_null(),
            (Some(mesh), _) => composed.put_str(mesh),
        }

        composed.end();

        true
    }
}

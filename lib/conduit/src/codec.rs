use crate::chain::{Chain, ChainCursor};
use crate::support::{ErrorType, PipeError, PipeResult};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

/// AMQP 1.0 type constructors used by the pipeline.
pub mod tags {
    pub const DESCRIBED: u8 = 0x00;
    pub const NULL: u8 = 0x40;
    pub const BOOL_TRUE: u8 = 0x41;
    pub const BOOL_FALSE: u8 = 0x42;
    pub const UINT0: u8 = 0x43;
    pub const ULONG0: u8 = 0x44;
    pub const LIST0: u8 = 0x45;
    pub const UBYTE: u8 = 0x50;
    pub const SMALL_UINT: u8 = 0x52;
    pub const SMALL_ULONG: u8 = 0x53;
    pub const USHORT: u8 = 0x60;
    pub const UINT: u8 = 0x70;
    pub const ULONG: u8 = 0x80;
    pub const TIMESTAMP: u8 = 0x83;
    pub const VBIN8: u8 = 0xA0;
    pub const STR8: u8 = 0xA1;
    pub const SYM8: u8 = 0xA3;
    pub const VBIN32: u8 = 0xB0;
    pub const STR32: u8 = 0xB1;
    pub const SYM32: u8 = 0xB3;
    pub const LIST8: u8 = 0xC0;
    pub const MAP8: u8 = 0xC1;
    pub const LIST32: u8 = 0xD0;
    pub const MAP32: u8 = 0xD1;
    pub const ARRAY8: u8 = 0xE0;
    pub const ARRAY32: u8 = 0xF0;
}

/// Standard section descriptor codes (amqp:header:list et al) plus the
/// custom router-annotations section.
pub mod sections {
    pub const HEADER: u64 = 0x70;
    pub const DELIVERY_ANNOTATIONS: u64 = 0x71;
    pub const MESSAGE_ANNOTATIONS: u64 = 0x72;
    pub const PROPERTIES: u64 = 0x73;
    pub const APPLICATION_PROPERTIES: u64 = 0x74;
    pub const BODY_DATA: u64 = 0x75;
    pub const BODY_SEQUENCE: u64 = 0x76;
    pub const BODY_VALUE: u64 = 0x77;
    pub const FOOTER: u64 = 0x78;

    /// Reserved-domain composite carrying inter-router control fields.
    pub const ROUTER_ANNOTATIONS: u64 = 0x534B_5052_2D2D_5241;
}

/// Names one typed AMQP field inside a chain without copying it: the
/// absolute offset of its leading tag octet, the octet count of its body,
/// and the header (tag plus size/count prefix) octets in between. A
/// location is recorded once, when the field is fully buffered, and never
/// moves afterwards.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FieldLocation {
    pub offset: u64,
    pub length: u64,
    pub header_length: u8,
    pub tag: u8,
    pub parsed: bool,
}

impl FieldLocation {
    /// Absolute offset of the first body octet.
    #[inline]
    pub fn body_offset(&self) -> u64 {
        self.offset + self.header_length as u64
    }

    /// Absolute offset one past the field.
    #[inline]
    pub fn end(&self) -> u64 {
        self.body_offset() + self.length
    }
}

/// Scan one primitive (non-described) field at the cursor, advancing past
/// it. Returns `Wait` when the chain does not yet hold the complete field.
pub fn scan_primitive(chain: &Chain, cursor: &mut ChainCursor) -> PipeResult<FieldLocation> {
    let start = *cursor;
    let offset = cursor.offset();

    let tag = match cursor.read_u8(chain) {
        Some(tag) => tag,
        None => return Err(PipeError::Wait),
    };

    let (header_length, length) = match field_extent(tag, chain, cursor) {
        Ok(meta) => meta,
        Err(err) => {
            *cursor = start;
            return Err(err);
        }
    };

    if !cursor.skip(chain, length) {
        *cursor = start;
        return Err(PipeError::Wait);
    }

    Ok(FieldLocation {
        offset,
        length,
        header_length,
        tag,
        parsed: true,
    })
}

/// Size of the field body and the full header given the tag. The cursor
/// must sit just past the tag octet; it is advanced past the size prefix.
fn field_extent(tag: u8, chain: &Chain, cursor: &mut ChainCursor) -> PipeResult<(u8, u64)> {
    match tag >> 4 {
        0x4 => Ok((1, 0)),
        0x5 => Ok((1, 1)),
        0x6 => Ok((1, 2)),
        0x7 => Ok((1, 4)),
        0x8 => Ok((1, 8)),
        0x9 => Ok((1, 16)),
        0xA | 0xC | 0xE => match cursor.read_u8(chain) {
            Some(size) => Ok((2, size as u64)),
            None => Err(PipeError::Wait),
        },
        0xB | 0xD | 0xF => match cursor.read_u32(chain) {
            Some(size) => Ok((5, size as u64)),
            None => Err(PipeError::Wait),
        },
        _ => Err(PipeError::Fatal(ErrorType::Malformed)),
    }
}

/// Read a descriptor field (the ulong following a 0x00 constructor).
/// The cursor must sit just past the 0x00 octet.
pub fn read_descriptor(chain: &Chain, cursor: &mut ChainCursor) -> PipeResult<u64> {
    let tag = match cursor.read_u8(chain) {
        Some(tag) => tag,
        None => return Err(PipeError::Wait),
    };

    match tag {
        tags::ULONG0 => Ok(0),
        tags::SMALL_ULONG => cursor.read_u8(chain).map(u64::from).ok_or(PipeError::Wait),
        tags::ULONG => cursor.read_u64(chain).ok_or(PipeError::Wait),
        _ => Err(PipeError::Fatal(ErrorType::Malformed)),
    }
}

/// Read a list header, returning the item count and the absolute offset one
/// past the list. The cursor advances to the first item.
pub fn read_list_header(chain: &Chain, cursor: &mut ChainCursor) -> PipeResult<(u32, u64)> {
    let tag = match cursor.read_u8(chain) {
        Some(tag) => tag,
        None => return Err(PipeError::Wait),
    };

    match tag {
        tags::LIST0 => Ok((0, cursor.offset())),
        tags::LIST8 => {
            let size = cursor.read_u8(chain).ok_or(PipeError::Wait)? as u64;
            let body = cursor.offset();
            let count = cursor.read_u8(chain).ok_or(PipeError::Wait)? as u32;
            Ok((count, body + size))
        }
        tags::LIST32 => {
            let size = cursor.read_u32(chain).ok_or(PipeError::Wait)? as u64;
            let body = cursor.offset();
            let count = cursor.read_u32(chain).ok_or(PipeError::Wait)?;
            Ok((count, body + size))
        }
        _ => Err(PipeError::Fatal(ErrorType::Malformed)),
    }
}

/// Read a map header, returning the key+value count and the absolute
/// offset one past the map. The cursor advances to the first key.
pub fn read_map_header(chain: &Chain, cursor: &mut ChainCursor) -> PipeResult<(u32, u64)> {
    let tag = match cursor.read_u8(chain) {
        Some(tag) => tag,
        None => return Err(PipeError::Wait),
    };

    match tag {
        tags::MAP8 => {
            let size = cursor.read_u8(chain).ok_or(PipeError::Wait)? as u64;
            let body = cursor.offset();
            let count = cursor.read_u8(chain).ok_or(PipeError::Wait)? as u32;
            Ok((count, body + size))
        }
        tags::MAP32 => {
            let size = cursor.read_u32(chain).ok_or(PipeError::Wait)? as u64;
            let body = cursor.offset();
            let count = cursor.read_u32(chain).ok_or(PipeError::Wait)?;
            Ok((count, body + size))
        }
        _ => Err(PipeError::Fatal(ErrorType::Malformed)),
    }
}

/// Read an optional string-ish field (str/sym of either width, or null).
pub fn read_str(chain: &Chain, cursor: &mut ChainCursor) -> PipeResult<Option<String>> {
    let tag = match cursor.read_u8(chain) {
        Some(tag) => tag,
        None => return Err(PipeError::Wait),
    };

    let len = match tag {
        tags::NULL => return Ok(None),
        tags::STR8 | tags::SYM8 => cursor.read_u8(chain).ok_or(PipeError::Wait)? as usize,
        tags::STR32 | tags::SYM32 => cursor.read_u32(chain).ok_or(PipeError::Wait)? as usize,
        _ => return Err(PipeError::Fatal(ErrorType::Malformed)),
    };

    let mut raw = vec![0u8; len];

    if !cursor.read_exact(chain, &mut raw) {
        return Err(PipeError::Wait);
    }

    String::from_utf8(raw)
        .map(Some)
        .map_err(|_| PipeError::Fatal(ErrorType::Malformed))
}

/// Read a uint field in any of its encodings, or null as `None`.
pub fn read_u32_field(chain: &Chain, cursor: &mut ChainCursor) -> PipeResult<Option<u32>> {
    let tag = match cursor.read_u8(chain) {
        Some(tag) => tag,
        None => return Err(PipeError::Wait),
    };

    match tag {
        tags::NULL => Ok(None),
        tags::UINT0 => Ok(Some(0)),
        tags::SMALL_UINT => cursor.read_u8(chain).map(|v| Some(u32::from(v))).ok_or(PipeError::Wait),
        tags::UINT => cursor.read_u32(chain).map(Some).ok_or(PipeError::Wait),
        _ => Err(PipeError::Fatal(ErrorType::Malformed)),
    }
}

/// An outgoing octet fragment under construction. Compound fields track
/// their size and item count through nesting, patched on close, so callers
/// just emit values in order.
pub struct Composed {
    octets: Vec<u8>,
    open: Vec<ListCtx>,
    described_pending: bool,
}

struct ListCtx {
    size_at: usize,
    count: u32,
}

impl Composed {
    pub fn new() -> Composed {
        Composed {
            octets: Vec::new(),
            open: Vec::new(),
            described_pending: false,
        }
    }

    /// The encoded octets. Panics while compound fields are still open.
    pub fn octets(&self) -> &[u8] {
        if !self.open.is_empty() {
            panic!("Attempted to read a composed fragment with open compound fields");
        }

        &self.octets
    }

    pub fn into_vec(self) -> Vec<u8> {
        if !self.open.is_empty() {
            panic!("Attempted to take a composed fragment with open compound fields");
        }

        self.octets
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.octets.len()
    }

    #[inline]
    fn bump(&mut self) {
        if self.described_pending {
            // The descriptor already counted the whole composite as one
            // item of the enclosing compound.
            self.described_pending = false;
            return;
        }

        if let Some(top) = self.open.last_mut() {
            top.count += 1;
        }
    }

    /// Begin a described composite: emits the 0x00 constructor and the
    /// descriptor code in its narrowest ulong encoding.
    pub fn put_descriptor(&mut self, code: u64) {
        self.bump();
        self.described_pending = true;

        self.octets.push(tags::DESCRIBED);

        if code == 0 {
            self.octets.push(tags::ULONG0);
        } else if code <= 0xFF {
            self.octets.push(tags::SMALL_ULONG);
            self.octets.push(code as u8);
        } else {
            self.octets.push(tags::ULONG);
            self.octets.write_u64::<BigEndian>(code).expect("Vec write cannot fail");
        }
    }

    /// Open a 32-bit list. Closed by `end`.
    pub fn start_list(&mut self) {
        self.bump();
        self.octets.push(tags::LIST32);
        let size_at = self.octets.len();
        // Size and count placeholders, patched on close.
        self.octets.extend_from_slice(&[0; 8]);
        self.open.push(ListCtx { size_at, count: 0 });
    }

    /// Open a 32-bit map. Closed by `end`; each key and value counts
    /// separately per the encoding.
    pub fn start_map(&mut self) {
        self.bump();
        self.octets.push(tags::MAP32);
        let size_at = self.octets.len();
        self.octets.extend_from_slice(&[0; 8]);
        self.open.push(ListCtx { size_at, count: 0 });
    }

    /// Close the innermost compound field, patching size and count.
    pub fn end(&mut self) {
        let ctx = self.open.pop().expect("Attempted to end a compound field that is not open");

        // Size covers the count field and the items, not the size field.
        let size = (self.octets.len() - ctx.size_at - 4) as u32;

        BigEndian::write_u32(&mut self.octets[ctx.size_at..ctx.size_at + 4], size);
        BigEndian::write_u32(&mut self.octets[ctx.size_at + 4..ctx.size_at + 8], ctx.count);
    }

    pub fn put_null(&mut self) {
        self.bump();
        self.octets.push(tags::NULL);
    }

    pub fn put_bool(&mut self, value: bool) {
        self.bump();
        self.octets.push(match value {
            true => tags::BOOL_TRUE,
            false => tags::BOOL_FALSE,
        });
    }

    pub fn put_u8(&mut self, value: u8) {
        self.bump();
        self.octets.push(tags::UBYTE);
        self.octets.push(value);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.bump();

        if value == 0 {
            self.octets.push(tags::UINT0);
        } else if value <= 0xFF {
            self.octets.push(tags::SMALL_UINT);
            self.octets.push(value as u8);
        } else {
            self.octets.push(tags::UINT);
            self.octets.write_u32::<BigEndian>(value).expect("Vec write cannot fail");
        }
    }

    pub fn put_ulong(&mut self, value: u64) {
        self.bump();

        if value == 0 {
            self.octets.push(tags::ULONG0);
        } else if value <= 0xFF {
            self.octets.push(tags::SMALL_ULONG);
            self.octets.push(value as u8);
        } else {
            self.octets.push(tags::ULONG);
            self.octets.write_u64::<BigEndian>(value).expect("Vec write cannot fail");
        }
    }

    pub fn put_str(&mut self, value: &str) {
        self.bump();
        Self::put_variable(&mut self.octets, tags::STR8, tags::STR32, value.as_bytes());
    }

    pub fn put_sym(&mut self, value: &str) {
        self.bump();
        Self::put_variable(&mut self.octets, tags::SYM8, tags::SYM32, value.as_bytes());
    }

    pub fn put_binary(&mut self, value: &[u8]) {
        self.bump();
        Self::put_variable(&mut self.octets, tags::VBIN8, tags::VBIN32, value);
    }

    /// Splice pre-encoded octets in as exactly one item.
    pub fn put_encoded(&mut self, raw: &[u8]) {
        self.bump();
        self.octets.extend_from_slice(raw);
    }

    fn put_variable(octets: &mut Vec<u8>, narrow: u8, wide: u8, value: &[u8]) {
        if value.len() <= 0xFF {
            octets.push(narrow);
            octets.push(value.len() as u8);
        } else {
            octets.push(wide);
            octets
                .write_u32::<BigEndian>(value.len() as u32)
                .expect("Vec write cannot fail");
        }

        octets.extend_from_slice(value);
    }
}

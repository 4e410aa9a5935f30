use byteorder::{BigEndian, ByteOrder};

/// Octets every HTTP/2 connection opens with.
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub const FRAME_HEADER_LEN: usize = 9;

/// Settings the adaptor advertises on every connection.
pub const MAX_CONCURRENT_STREAMS: u32 = 100;
pub const INITIAL_WINDOW_SIZE: u32 = 65536;
pub const MAX_FRAME_SIZE: u32 = 16384;
pub const ENABLE_PUSH: u32 = 0;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FrameKind {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    Goaway,
    WindowUpdate,
    Continuation,
    Unknown(u8),
}

impl From<u8> for FrameKind {
    fn from(raw: u8) -> FrameKind {
        match raw {
            0 => FrameKind::Data,
            1 => FrameKind::Headers,
            2 => FrameKind::Priority,
            3 => FrameKind::RstStream,
            4 => FrameKind::Settings,
            5 => FrameKind::PushPromise,
            6 => FrameKind::Ping,
            7 => FrameKind::Goaway,
            8 => FrameKind::WindowUpdate,
            9 => FrameKind::Continuation,
            other => FrameKind::Unknown(other),
        }
    }
}

impl From<FrameKind> for u8 {
    fn from(kind: FrameKind) -> u8 {
        match kind {
            FrameKind::Data => 0,
            FrameKind::Headers => 1,
            FrameKind::Priority => 2,
            FrameKind::RstStream => 3,
            FrameKind::Settings => 4,
            FrameKind::PushPromise => 5,
            FrameKind::Ping => 6,
            FrameKind::Goaway => 7,
            FrameKind::WindowUpdate => 8,
            FrameKind::Continuation => 9,
            FrameKind::Unknown(other) => other,
        }
    }
}

pub mod flags {
    pub const END_STREAM: u8 = 0x01;
    pub const ACK: u8 = 0x01;
    pub const END_HEADERS: u8 = 0x04;
    pub const PADDED: u8 = 0x08;
    pub const PRIORITY: u8 = 0x20;
}

pub mod settings {
    pub const HEADER_TABLE_SIZE: u16 = 0x1;
    pub const ENABLE_PUSH: u16 = 0x2;
    pub const MAX_CONCURRENT_STREAMS: u16 = 0x3;
    pub const INITIAL_WINDOW_SIZE: u16 = 0x4;
    pub const MAX_FRAME_SIZE: u16 = 0x5;
    pub const MAX_HEADER_LIST_SIZE: u16 = 0x6;
}

pub mod error_codes {
    pub const NO_ERROR: u32 = 0x0;
    pub const PROTOCOL_ERROR: u32 = 0x1;
    pub const INTERNAL_ERROR: u32 = 0x2;
    pub const FLOW_CONTROL_ERROR: u32 = 0x3;
    pub const SETTINGS_TIMEOUT: u32 = 0x4;
    pub const STREAM_CLOSED: u32 = 0x5;
    pub const FRAME_SIZE_ERROR: u32 = 0x6;
    pub const REFUSED_STREAM: u32 = 0x7;
    pub const CANCEL: u32 = 0x8;
    pub const COMPRESSION_ERROR: u32 = 0x9;
    pub const CONNECT_ERROR: u32 = 0xA;
    pub const ENHANCE_YOUR_CALM: u32 = 0xB;
    pub const INADEQUATE_SECURITY: u32 = 0xC;
    pub const HTTP_1_1_REQUIRED: u32 = 0xD;
}

/// Canonical reason string for a GOAWAY error code.
pub fn strerror(code: u32) -> &'static str {
    match code {
        error_codes::NO_ERROR => "no error",
        error_codes::PROTOCOL_ERROR => "protocol error",
        error_codes::INTERNAL_ERROR => "internal error",
        error_codes::FLOW_CONTROL_ERROR => "flow control error",
        error_codes::SETTINGS_TIMEOUT => "settings timeout",
        error_codes::STREAM_CLOSED => "stream closed",
        error_codes::FRAME_SIZE_ERROR => "frame size error",
        error_codes::REFUSED_STREAM => "refused stream",
        error_codes::CANCEL => "cancelled",
        error_codes::COMPRESSION_ERROR => "compression error",
        error_codes::CONNECT_ERROR => "connect error",
        error_codes::ENHANCE_YOUR_CALM => "enhance your calm",
        error_codes::INADEQUATE_SECURITY => "inadequate security",
        error_codes::HTTP_1_1_REQUIRED => "HTTP/1.1 required",
        _ => "unknown error",
    }
}

/// The fixed nine-octet frame header.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FrameHeader {
    pub length: u32,
    pub kind: FrameKind,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    pub fn parse(raw: &[u8; FRAME_HEADER_LEN]) -> FrameHeader {
        FrameHeader {
            length: BigEndian::read_u24(&raw[0..3]),
            kind: FrameKind::from(raw[3]),
            flags: raw[4],
            stream_id: BigEndian::read_u32(&raw[5..9]) & 0x7FFF_FFFF,
        }
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        let mut raw = [0u8; FRAME_HEADER_LEN];

        BigEndian::write_u24(&mut raw[0..3], self.length);
        raw[3] = self.kind.into();
        raw[4] = self.flags;
        BigEndian::write_u32(&mut raw[5..9], self.stream_id & 0x7FFF_FFFF);

        out.extend_from_slice(&raw);
    }
}

/// Serialize one complete frame.
pub fn write_frame(out: &mut Vec<u8>, kind: FrameKind, frame_flags: u8, stream_id: u32, payload: &[u8]) {
    FrameHeader {
        length: payload.len() as u32,
        kind,
        flags: frame_flags,
        stream_id,
    }
    .write(out);

    out.extend_from_slice(payload);
}

/// Serialize a SETTINGS payload from (identifier, value) pairs.
pub fn settings_payload(entries: &[(u16, u32)]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(entries.len() * 6);

    for (identifier, value) in entries {
        let mut raw = [0u8; 6];
        BigEndian::write_u16(&mut raw[0..2], *identifier);
        BigEndian::write_u32(&mut raw[2..6], *value);
        payload.extend_from_slice(&raw);
    }

    payload
}

/// The SETTINGS payload this adaptor advertises.
pub fn local_settings_payload() -> Vec<u8> {
    settings_payload(&[
        (settings::MAX_CONCURRENT_STREAMS, MAX_CONCURRENT_STREAMS),
        (settings::INITIAL_WINDOW_SIZE, INITIAL_WINDOW_SIZE),
        (settings::MAX_FRAME_SIZE, MAX_FRAME_SIZE),
        (settings::ENABLE_PUSH, ENABLE_PUSH),
    ])
}

/// Serialize a GOAWAY payload.
pub fn goaway_payload(last_stream_id: u32, error_code: u32, debug: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(8 + debug.len());
    let mut raw = [0u8; 8];

    BigEndian::write_u32(&mut raw[0..4], last_stream_id & 0x7FFF_FFFF);
    BigEndian::write_u32(&mut raw[4..8], error_code);

    payload.extend_from_slice(&raw);
    payload.extend_from_slice(debug.as_bytes());
    payload
}

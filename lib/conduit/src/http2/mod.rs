//! The HTTP/2 adaptor: a stream state machine that maps each HTTP/2
//! stream onto a pair of deliveries and translates frames into message
//! build, flow and abort operations over the raw transport buffers.

pub mod conn;
pub mod frame;
pub mod hpack;

pub use self::conn::{H2Event, Http2Connection, Stream, StreamStatus};

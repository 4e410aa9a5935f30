//! The message pipeline and stream-flow engine of the router: shared
//! message contents over pooled buffer chains, the resumable AMQP section
//! parser, router annotations, two-level back-pressure, the cut-through
//! fast path and the HTTP/2 adaptor.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod annotations;
pub mod buffer;
pub mod chain;
pub mod codec;
pub mod config;
pub mod connection;
pub mod core;
pub mod cutthrough;
pub mod delivery;
pub mod flow;
pub mod http2;
pub mod link;
pub mod message;
pub mod mgmt;
pub mod session;
pub mod support;
pub mod transport;

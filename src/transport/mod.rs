//! Broker socket transport
//!
//! Frame decoding and encoding, request parsing, and the outbound connection.

pub mod codec;
pub mod connection;
pub mod request;

pub use codec::FramingError;
pub use connection::Connection;
pub use request::Request;

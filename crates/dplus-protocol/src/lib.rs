//! # dplus-protocol
//!
//! Message types and JSON codec of the D+ simulator service interface.
//!
//! The same messages are used by the in-process service handle and by the
//! HTTP API of the binary.

pub mod codec;
pub mod messages;

pub use codec::CodecError;
pub use messages::*;

//! Line protocol spoken with the child process.
//!
//! # Architecture
//!
//! - **protocol**: Markers, request messages, payload validation
//! - **codec**: Nested-line framing codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;

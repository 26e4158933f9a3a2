//! IPC bridge between a coordinator and its worker process.
//!
//! # Architecture
//!
//! - **protocol**: Channel ids, request ids and topic-tagged frames
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite
//! - **envelope**: JSON-RPC 2.0 request/response envelopes
//! - **transport**: Unix socket listener/connector keyed by channel id

pub mod codec;
pub mod envelope;
pub mod protocol;
pub mod transport;

//! Wire layer shared by workers, coordinator and monitor.
//!
//! # Architecture
//!
//! - **protocol**: the fixed-size `Packet` and its tags
//! - **codec**: 12-byte framing for AsyncRead/AsyncWrite
//! - **transport**: shared pipe, FIFO, PID file and TCP helpers

pub mod codec;
pub mod protocol;
pub mod transport;

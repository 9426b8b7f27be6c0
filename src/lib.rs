//! servtest - conformance and fault-injection harness for HTTP servers.
//!
//! Drives an externally built HTTP server as a black box over TCP: crafted
//! request bytes go in, responses are framed by a streaming decoder, and a
//! process supervisor delivers signals at chosen points in the request
//! lifecycle. The server runs under a memory/descriptor instrumentation
//! tool (valgrind) whose log is analyzed for leaked descriptors and leaked
//! memory after every scenario.
//!
//! ## Subsystems
//!
//! - [`decoder`]: streaming HTTP response framing (fixed length, chunked,
//!   close-delimited) that never over-reads on a persistent connection.
//! - [`process`]: launch, worker-pid resolution behind the instrumentation
//!   wrapper, signal delivery, exit deadlines.
//! - [`valgrind`]: typed-record scanning of the instrumentation log.
//! - [`scenario`]: end-to-end scenarios composed from the above, run
//!   strictly sequentially.
//! - [`config`] and [`request`]: scenario configuration and raw request
//!   construction.

pub mod config;
pub mod decoder;
pub mod process;
pub mod request;
pub mod scenario;
pub mod valgrind;

//! Courier - request-forwarding core for an application server.
//!
//! Accepts client connections on a local request socket, authenticates them
//! with a connect password, parses the SCGI-style header frame, checks a
//! session out of the worker pool, and streams request and response bytes
//! between client and worker under backpressure.

pub mod config;
pub mod http;
pub mod io;
pub mod proxy;
pub mod server;

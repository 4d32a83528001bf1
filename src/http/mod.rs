//! Protocol handling: the SCGI request header frame on the client side and
//! the CGI-style response header on the worker side.
//!
//! - **`scgi`**: streaming parser for the length-prefixed request header
//!   block and the ordered header mapping it produces
//! - **`header_buffer`**: accumulates the worker response until the
//!   end-of-headers marker
//! - **`status`**: status-code / reason-phrase table
//! - **`response`**: response header rewriting (status line synthesis,
//!   identity header)
//! - **`error_page`**: templated 500 responses

pub mod error_page;
pub mod header_buffer;
pub mod response;
pub mod scgi;
pub mod status;

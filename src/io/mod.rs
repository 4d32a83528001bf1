//! Byte plumbing shared by both directions of a connection.
//!
//! - **`input`**: pull-based buffered reader over a socket read half
//! - **`pipe`**: unidirectional buffer that overflows from memory to a
//!   temporary file when a watermark is exceeded

pub mod input;
pub mod pipe;

pub use input::BufferedInput;
pub use pipe::{spill_pipe, PipeReader, PipeWriter};

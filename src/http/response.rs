//! Rewriting of the worker's response header before it reaches the client.
//!
//! The worker emits a CGI-style header block. Before forwarding, the block
//! is scanned for the `Status` header, a missing reason phrase is filled in
//! from the status table, an HTTP/1.1 status line is optionally prefixed,
//! and the server identity header is appended to the prefix. Everything
//! after the end-of-headers terminator passes through untouched.

use crate::http::status::code_and_reason;

/// Errors detected while rewriting a response header block.
#[derive(Debug, PartialEq, Eq)]
pub enum RewriteError {
    /// The worker did not send a `Status` header
    MissingStatus,
}

struct HeaderRef {
    /// Range of the full `Name: value\r\n` line within the block
    start: usize,
    end: usize,
    value_start: usize,
    value_end: usize,
}

/// Finds `name` as a header in `data`. The name must start the block or
/// directly follow a `\n`, and must be followed by `:`. Matching is
/// case-sensitive; the value has leading spaces stripped and runs to the
/// first `\r`.
fn find_header(data: &[u8], name: &[u8]) -> Option<HeaderRef> {
    let mut search = 0;
    while search + name.len() < data.len() {
        let pos = find_from(data, name, search)?;
        let at_line_start = pos == 0 || data[pos - 1] == b'\n';
        let followed_by_colon = data.len() > pos + name.len() && data[pos + name.len()] == b':';
        if at_line_start && followed_by_colon {
            let mut value_start = pos + name.len() + 1;
            while value_start < data.len() && data[value_start] == b' ' {
                value_start += 1;
            }
            let value_end = find_from(data, b"\r", value_start)?;
            return Some(HeaderRef {
                start: pos,
                end: (value_end + 2).min(data.len()),
                value_start,
                value_end,
            });
        }
        search = pos + name.len() + 1;
    }
    None
}

fn find_from(data: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= data.len() {
        return None;
    }
    data[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

fn identity_header() -> String {
    format!("X-Powered-By: courier/{}\r\n", env!("CARGO_PKG_VERSION"))
}

/// Produces the bytes to send to the client in place of the raw header
/// block: optional HTTP/1.1 status line, the identity header, then the
/// (possibly repaired) header block, terminator included. The caller
/// appends any bytes it read past the terminator.
pub fn rewrite_response_header(
    header: &[u8],
    print_status_line: bool,
) -> Result<Vec<u8>, RewriteError> {
    let status = find_header(header, b"Status").ok_or(RewriteError::MissingStatus)?;
    let value = &header[status.value_start..status.value_end];

    let mut repaired: Option<Vec<u8>> = None;
    let mut status_value = value.to_vec();

    if !value.contains(&b' ') {
        // No reason phrase; synthesize one from the table.
        let code: u16 = std::str::from_utf8(value)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let line = match code_and_reason(code) {
            Some(known) => known.to_string(),
            None => format!("{code} Unknown Reason-Phrase"),
        };

        let mut rebuilt = Vec::with_capacity(header.len() + line.len());
        rebuilt.extend_from_slice(&header[..status.start]);
        rebuilt.extend_from_slice(b"Status: ");
        rebuilt.extend_from_slice(line.as_bytes());
        rebuilt.extend_from_slice(b"\r\n");
        rebuilt.extend_from_slice(&header[status.end..]);
        repaired = Some(rebuilt);
        status_value = line.into_bytes();
    }

    let identity = identity_header();
    let body = repaired.as_deref().unwrap_or(header);
    let mut out = Vec::with_capacity(body.len() + identity.len() + 32);

    if print_status_line {
        out.extend_from_slice(b"HTTP/1.1 ");
        out.extend_from_slice(&status_value);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(identity.as_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

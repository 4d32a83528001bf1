use bytes::BytesMut;

const TERMINATOR: &[u8] = b"\r\n\r\n";

/// Accumulates bytes until the `\r\n\r\n` end-of-headers marker, which may
/// arrive split across chunks. Bytes past the terminator are never consumed.
pub struct HeaderBufferer {
    buf: BytesMut,
    matched: usize,
    complete: bool,
    error: bool,
    limit: usize,
}

impl HeaderBufferer {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            matched: 0,
            complete: false,
            error: false,
            limit,
        }
    }

    /// Feeds a chunk; returns how many bytes were consumed. Stops exactly
    /// after the terminator once it is seen.
    pub fn feed(&mut self, data: &[u8]) -> usize {
        if self.complete || self.error {
            return 0;
        }

        let mut consumed = data.len();
        for (i, byte) in data.iter().enumerate() {
            if *byte == TERMINATOR[self.matched] {
                self.matched += 1;
                if self.matched == TERMINATOR.len() {
                    self.complete = true;
                    consumed = i + 1;
                    break;
                }
            } else if *byte == b'\r' {
                self.matched = 1;
            } else {
                self.matched = 0;
            }
        }

        self.buf.extend_from_slice(&data[..consumed]);
        if self.buf.len() > self.limit {
            self.complete = false;
            self.error = true;
        }
        consumed
    }

    pub fn accepting_input(&self) -> bool {
        !self.complete && !self.error
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn has_error(&self) -> bool {
        self.error
    }

    /// The buffered header, terminator included.
    pub fn data(&self) -> &[u8] {
        &self.buf
    }
}

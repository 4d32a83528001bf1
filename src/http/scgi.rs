//! Streaming parser for the SCGI-style request header frame: a decimal ASCII
//! length, `:`, that many bytes of `key\0value\0` pairs, then `,`.

use bytes::{BufMut, Bytes, BytesMut};

/// Errors that can end header parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScgiError {
    /// The declared or accumulated size exceeds the configured limit
    TooLarge,
    /// The length field, framing, or pair structure is malformed
    Malformed,
}

/// Ordered header mapping, byte keys to byte values, serializable back into
/// the null-separated wire form.
#[derive(Debug, Default, Clone)]
pub struct HeaderBlock {
    entries: Vec<(Bytes, Bytes)>,
}

impl HeaderBlock {
    pub fn get(&self, name: &[u8]) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(k, _)| k.as_ref() == name)
            .map(|(_, v)| v.as_ref())
    }

    pub fn get_str(&self, name: &[u8]) -> Option<&str> {
        self.get(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn contains(&self, name: &[u8]) -> bool {
        self.get(name).is_some()
    }

    pub fn insert(&mut self, name: impl Into<Bytes>, value: impl Into<Bytes>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn remove(&mut self, name: &[u8]) -> Option<Bytes> {
        let pos = self.entries.iter().position(|(k, _)| k.as_ref() == name)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_ref(), v.as_ref()))
    }

    /// Reads a boolean request option; anything other than the literal
    /// `true` is false.
    pub fn bool_option(&self, name: &[u8], default: bool) -> bool {
        match self.get(name) {
            Some(value) => value == b"true",
            None => default,
        }
    }

    /// Serializes back into `key\0value\0` pairs.
    pub fn serialize(&self) -> Bytes {
        let total: usize = self
            .entries
            .iter()
            .map(|(k, v)| k.len() + v.len() + 2)
            .sum();
        let mut buf = BytesMut::with_capacity(total);
        for (key, value) in &self.entries {
            buf.put_slice(key);
            buf.put_u8(0);
            buf.put_slice(value);
            buf.put_u8(0);
        }
        buf.freeze()
    }

    /// Applies the Rack-style rewrite: `HTTP_CONTENT_LENGTH` and
    /// `HTTP_CONTENT_TYPE` must not exist; each is moved to its non-`HTTP_`
    /// name when that is absent, dropped otherwise. Returns whether the
    /// block was modified.
    pub fn normalize(&mut self) -> bool {
        let mut modified = false;
        for (prefixed, bare) in [
            (&b"HTTP_CONTENT_LENGTH"[..], &b"CONTENT_LENGTH"[..]),
            (&b"HTTP_CONTENT_TYPE"[..], &b"CONTENT_TYPE"[..]),
        ] {
            if let Some(value) = self.remove(prefixed) {
                if !self.contains(bare) {
                    self.insert(Bytes::copy_from_slice(bare), value);
                }
                modified = true;
            }
        }
        modified
    }
}

#[derive(Debug)]
enum ParserState {
    Length,
    Body,
    Done,
    Failed(ScgiError),
}

/// Streaming SCGI header parser. Feed it bytes as they arrive; it stops
/// consuming at the end of the frame and leaves everything after the `,`
/// terminator to the caller.
pub struct ScgiParser {
    state: ParserState,
    limit: usize,
    declared_len: usize,
    length_digits: usize,
    body: BytesMut,
    raw: Bytes,
    block: HeaderBlock,
}

impl ScgiParser {
    pub fn new(limit: usize) -> Self {
        Self {
            state: ParserState::Length,
            limit,
            declared_len: 0,
            length_digits: 0,
            body: BytesMut::new(),
            raw: Bytes::new(),
            block: HeaderBlock::default(),
        }
    }

    /// Consumes bytes from `data`, returning how many were used. Once the
    /// parser stops accepting input, remaining bytes belong to the request
    /// body and must be handled by the caller.
    pub fn feed(&mut self, data: &[u8]) -> usize {
        let mut consumed = 0;

        while consumed < data.len() {
            match self.state {
                ParserState::Length => {
                    let byte = data[consumed];
                    consumed += 1;
                    match byte {
                        b'0'..=b'9' => {
                            self.length_digits += 1;
                            if self.length_digits > 10 {
                                self.state = ParserState::Failed(ScgiError::TooLarge);
                                return consumed;
                            }
                            self.declared_len =
                                self.declared_len * 10 + usize::from(byte - b'0');
                        }
                        b':' if self.length_digits > 0 => {
                            if self.declared_len > self.limit {
                                self.state = ParserState::Failed(ScgiError::TooLarge);
                                return consumed;
                            }
                            self.body.reserve(self.declared_len);
                            self.state = ParserState::Body;
                        }
                        _ => {
                            self.state = ParserState::Failed(ScgiError::Malformed);
                            return consumed;
                        }
                    }
                }
                ParserState::Body => {
                    if self.body.len() < self.declared_len {
                        let want = self.declared_len - self.body.len();
                        let take = want.min(data.len() - consumed);
                        self.body.extend_from_slice(&data[consumed..consumed + take]);
                        consumed += take;
                        if self.body.len() < self.declared_len {
                            return consumed;
                        }
                    }
                    // Full body buffered; the next byte must be the `,`.
                    if consumed == data.len() {
                        return consumed;
                    }
                    if data[consumed] != b',' {
                        self.state = ParserState::Failed(ScgiError::Malformed);
                        return consumed;
                    }
                    consumed += 1;
                    match parse_pairs(&self.body) {
                        Ok(block) => {
                            self.block = block;
                            self.raw = std::mem::take(&mut self.body).freeze();
                            self.state = ParserState::Done;
                        }
                        Err(e) => self.state = ParserState::Failed(e),
                    }
                    return consumed;
                }
                ParserState::Done | ParserState::Failed(_) => return consumed,
            }
        }

        consumed
    }

    pub fn accepting_input(&self) -> bool {
        matches!(self.state, ParserState::Length | ParserState::Body)
    }

    pub fn has_error(&self) -> bool {
        matches!(self.state, ParserState::Failed(_))
    }

    pub fn error(&self) -> Option<ScgiError> {
        match self.state {
            ParserState::Failed(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, ParserState::Done)
    }

    /// The raw `key\0value\0` block exactly as received.
    pub fn header_data(&self) -> Bytes {
        self.raw.clone()
    }

    pub fn block(&self) -> &HeaderBlock {
        &self.block
    }

    pub fn take_block(&mut self) -> HeaderBlock {
        std::mem::take(&mut self.block)
    }
}

fn parse_pairs(body: &[u8]) -> Result<HeaderBlock, ScgiError> {
    let mut block = HeaderBlock::default();
    if body.is_empty() {
        return Ok(block);
    }
    if *body.last().unwrap() != 0 {
        return Err(ScgiError::Malformed);
    }

    let mut fields = Vec::new();
    let mut start = 0;
    for (i, byte) in body.iter().enumerate() {
        if *byte == 0 {
            fields.push(&body[start..i]);
            start = i + 1;
        }
    }
    if fields.len() % 2 != 0 {
        return Err(ScgiError::Malformed);
    }

    for pair in fields.chunks(2) {
        if pair[0].is_empty() {
            return Err(ScgiError::Malformed);
        }
        block.insert(
            Bytes::copy_from_slice(pair[0]),
            Bytes::copy_from_slice(pair[1]),
        );
    }
    Ok(block)
}

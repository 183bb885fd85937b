//! Minimal DER reader/writer for the policy extension grammar.
//!
//! The extensions skua projects out of certificates use a small fixed
//! vocabulary: INTEGER, UTF8String, OCTET STRING, SEQUENCE, SET, and
//! implicit context tags for the two CHOICEs. Decoders demand that the
//! input is consumed exactly; any surplus is a `trailing bytes` error.
//! Certificates and revocation lists themselves never pass through this
//! module.

use crate::{Error, Result};

pub const TAG_INTEGER: u8 = 0x02;
pub const TAG_OCTET_STRING: u8 = 0x04;
pub const TAG_UTF8_STRING: u8 = 0x0C;
pub const TAG_SEQUENCE: u8 = 0x30;
pub const TAG_SET: u8 = 0x31;

/// Implicit context tag `[n]`, primitive or constructed.
pub const fn context(n: u8, constructed: bool) -> u8 {
    0x80 | n | if constructed { 0x20 } else { 0 }
}

fn malformed(msg: &str) -> Error {
    Error::Policy(format!("der: {}", msg))
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Cursor over a DER byte string.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn peek_tag(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn byte(&mut self) -> Result<u8> {
        let b = self
            .data
            .get(self.pos)
            .copied()
            .ok_or_else(|| malformed("unexpected end of input"))?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.data.len() - self.pos < n {
            return Err(malformed("unexpected end of input"));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn length(&mut self) -> Result<usize> {
        let first = self.byte()?;
        if first < 0x80 {
            return Ok(first as usize);
        }
        let count = (first & 0x7F) as usize;
        if count == 0 || count > 4 {
            return Err(malformed("unsupported length encoding"));
        }
        let mut len = 0usize;
        for _ in 0..count {
            len = (len << 8) | self.byte()? as usize;
        }
        if len < 0x80 {
            return Err(malformed("non-minimal length"));
        }
        Ok(len)
    }

    /// Read the next TLV, returning its tag and content.
    pub fn tlv(&mut self) -> Result<(u8, &'a [u8])> {
        let tag = self.byte()?;
        let len = self.length()?;
        Ok((tag, self.take(len)?))
    }

    /// Read the next TLV and require its tag.
    pub fn expect(&mut self, tag: u8) -> Result<&'a [u8]> {
        let (got, content) = self.tlv()?;
        if got != tag {
            return Err(malformed(&format!(
                "expected tag {:#04x}, found {:#04x}",
                tag, got
            )));
        }
        Ok(content)
    }

    /// Fail unless the input was consumed exactly.
    pub fn finish(self) -> Result<()> {
        if self.pos != self.data.len() {
            return Err(Error::Policy("trailing bytes".to_string()));
        }
        Ok(())
    }
}

/// Interpret an INTEGER content as an unsigned value.
pub fn integer_value(content: &[u8]) -> Result<u64> {
    if content.is_empty() {
        return Err(malformed("empty integer"));
    }
    if content[0] & 0x80 != 0 {
        return Err(malformed("negative integer"));
    }
    if content.len() > 1 && content[0] == 0 && content[1] < 0x80 {
        return Err(malformed("non-minimal integer"));
    }
    if content.len() > 9 || (content.len() == 9 && content[0] != 0) {
        return Err(malformed("integer out of range"));
    }
    let mut value = 0u64;
    for &b in content {
        value = (value << 8) | b as u64;
    }
    Ok(value)
}

/// Interpret a UTF8String content.
pub fn utf8_value(content: &[u8]) -> Result<String> {
    String::from_utf8(content.to_vec()).map_err(|_| malformed("invalid utf-8"))
}

// ---------------------------------------------------------------------------
// Whole-input decoders (used per extension payload)
// ---------------------------------------------------------------------------

pub fn decode_integer(data: &[u8]) -> Result<u64> {
    let mut r = Reader::new(data);
    let content = r.expect(TAG_INTEGER)?;
    let value = integer_value(content)?;
    r.finish()?;
    Ok(value)
}

pub fn decode_utf8(data: &[u8]) -> Result<String> {
    let mut r = Reader::new(data);
    let content = r.expect(TAG_UTF8_STRING)?;
    let value = utf8_value(content)?;
    r.finish()?;
    Ok(value)
}

pub fn decode_octets(data: &[u8]) -> Result<Vec<u8>> {
    let mut r = Reader::new(data);
    let content = r.expect(TAG_OCTET_STRING)?;
    r.finish()?;
    Ok(content.to_vec())
}

/// SET OF INTEGER.
pub fn decode_integer_set(data: &[u8]) -> Result<Vec<u64>> {
    let mut r = Reader::new(data);
    let content = r.expect(TAG_SET)?;
    r.finish()?;
    let mut inner = Reader::new(content);
    let mut out = Vec::new();
    while !inner.is_empty() {
        out.push(integer_value(inner.expect(TAG_INTEGER)?)?);
    }
    Ok(out)
}

/// SEQUENCE OF UTF8String.
pub fn decode_utf8_seq(data: &[u8]) -> Result<Vec<String>> {
    let mut r = Reader::new(data);
    let content = r.expect(TAG_SEQUENCE)?;
    r.finish()?;
    let mut inner = Reader::new(content);
    let mut out = Vec::new();
    while !inner.is_empty() {
        out.push(utf8_value(inner.expect(TAG_UTF8_STRING)?)?);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

fn push_length(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
        return;
    }
    let bytes = len.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    out.push(0x80 | (bytes.len() - skip) as u8);
    out.extend_from_slice(&bytes[skip..]);
}

/// Encode one TLV.
pub fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + content.len());
    out.push(tag);
    push_length(&mut out, content.len());
    out.extend_from_slice(content);
    out
}

pub fn integer(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count().min(7);
    let mut content = bytes[skip..].to_vec();
    if content[0] & 0x80 != 0 {
        content.insert(0, 0);
    }
    tlv(TAG_INTEGER, &content)
}

pub fn utf8(s: &str) -> Vec<u8> {
    tlv(TAG_UTF8_STRING, s.as_bytes())
}

pub fn octets(b: &[u8]) -> Vec<u8> {
    tlv(TAG_OCTET_STRING, b)
}

/// SEQUENCE over already-encoded children.
pub fn sequence(children: &[u8]) -> Vec<u8> {
    tlv(TAG_SEQUENCE, children)
}

/// SET over already-encoded children.
pub fn set(children: &[u8]) -> Vec<u8> {
    tlv(TAG_SET, children)
}

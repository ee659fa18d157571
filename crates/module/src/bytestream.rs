//! Shallow reader over an in-memory module image.

/// Cursor over a borrowed byte slice. All reads assume the module is
/// well-formed; running off the end is a bug in the caller (or a module
/// that should have been rejected by validation) and panics.
#[derive(Copy, Clone, Debug)]
pub struct ByteStream<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteStream<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn has_more(&self) -> bool {
        self.pos < self.bytes.len()
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub fn skip(&mut self, n: usize) {
        assert!(self.pos + n <= self.bytes.len(), "skip past end of stream");
        self.pos += n;
    }

    /// Splits off a sub-stream covering exactly the next `len` bytes.
    /// The parent cursor is not advanced; pair with [`ByteStream::skip`].
    pub fn sub_stream(&self, len: usize) -> ByteStream<'a> {
        assert!(self.pos + len <= self.bytes.len(), "section extends past end of stream");
        ByteStream::new(&self.bytes[self.pos..self.pos + len])
    }

    fn take(&mut self, n: usize) -> &'a [u8] {
        assert!(self.pos + n <= self.bytes.len(), "read past end of stream");
        let r = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        r
    }

    pub fn read_u8(&mut self) -> u8 {
        self.take(1)[0]
    }

    pub fn peek_u8(&self) -> u8 {
        assert!(self.pos < self.bytes.len(), "peek past end of stream");
        self.bytes[self.pos]
    }

    pub fn read_u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take(4).try_into().unwrap())
    }

    pub fn read_u64(&mut self) -> u64 {
        u64::from_le_bytes(self.take(8).try_into().unwrap())
    }

    pub fn read_f32(&mut self) -> f32 {
        f32::from_le_bytes(self.take(4).try_into().unwrap())
    }

    pub fn read_f64(&mut self) -> f64 {
        f64::from_le_bytes(self.take(8).try_into().unwrap())
    }

    /// Unsigned LEB128, at most 32 significant bits.
    pub fn read_uleb32(&mut self) -> u32 {
        let mut result = 0u32;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8();
            if shift < 32 {
                result |= u32::from(byte & 0x7f) << shift;
            }
            if byte & 0x80 == 0 {
                return result;
            }
            shift += 7;
        }
    }

    /// Signed LEB128, at most 64 significant bits.
    pub fn read_sleb64(&mut self) -> i64 {
        let mut result = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8();
            if shift < 64 {
                result |= u64::from(byte & 0x7f) << shift;
            }
            shift += 7;
            if byte & 0x80 == 0 {
                if byte & 0x40 != 0 && shift < 64 {
                    result |= u64::MAX << shift;
                }
                return result as i64;
            }
        }
    }

    pub fn read_sleb32(&mut self) -> i32 {
        self.read_sleb64() as i32
    }

    /// Length-prefixed UTF-8 name, borrowed from the module image.
    pub fn read_name(&mut self) -> &'a str {
        let len = self.read_uleb32() as usize;
        std::str::from_utf8(self.take(len)).expect("module name is not UTF-8")
    }

    /// Length-prefixed raw bytes (data segment payloads).
    pub fn read_bytes(&mut self) -> &'a [u8] {
        let len = self.read_uleb32() as usize;
        self.take(len)
    }

    /// Consumes the stream, returning the unread remainder.
    pub fn into_bytes(self) -> &'a [u8] {
        &self.bytes[self.pos..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_round_trip() {
        let mut bytes = Vec::new();
        bytes.push(0x2a);
        bytes.extend_from_slice(&0xdead_beefu32.to_le_bytes());
        bytes.extend_from_slice(&u64::MAX.to_le_bytes());
        bytes.extend_from_slice(&1.5f32.to_le_bytes());
        bytes.extend_from_slice(&(-2.25f64).to_le_bytes());

        let mut s = ByteStream::new(&bytes);
        assert_eq!(s.read_u8(), 0x2a);
        assert_eq!(s.read_u32(), 0xdead_beef);
        assert_eq!(s.read_u64(), u64::MAX);
        assert_eq!(s.read_f32(), 1.5);
        assert_eq!(s.read_f64(), -2.25);
        assert!(!s.has_more());
    }

    #[test]
    fn uleb() {
        let bytes = [0x00, 0x7f, 0xe5, 0x8e, 0x26, 0xff, 0xff, 0xff, 0xff, 0x0f];
        let mut s = ByteStream::new(&bytes);
        assert_eq!(s.read_uleb32(), 0);
        assert_eq!(s.read_uleb32(), 127);
        assert_eq!(s.read_uleb32(), 624485);
        assert_eq!(s.read_uleb32(), u32::MAX);
    }

    #[test]
    fn sleb() {
        // -123456 is e5 8e 26 with the sign bit logic inverted: c0 bb 78
        let bytes = [0xc0, 0xbb, 0x78];
        let mut s = ByteStream::new(&bytes);
        assert_eq!(s.read_sleb64(), -123456);

        let bytes = [0x7f];
        let mut s = ByteStream::new(&bytes);
        assert_eq!(s.read_sleb64(), -1);

        let bytes = [0x80, 0x7f];
        let mut s = ByteStream::new(&bytes);
        assert_eq!(s.read_sleb64(), -128);

        let bytes = [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01];
        let mut s = ByteStream::new(&bytes);
        assert_eq!(s.read_sleb64(), -1);
    }

    #[test]
    fn sub_stream_is_independent() {
        let bytes = [1, 2, 3, 4];
        let mut s = ByteStream::new(&bytes);
        s.skip(1);
        let mut sub = s.sub_stream(2);
        assert_eq!(sub.read_u8(), 2);
        assert_eq!(sub.read_u8(), 3);
        assert!(!sub.has_more());
        s.skip(2);
        assert_eq!(s.read_u8(), 4);
    }
}

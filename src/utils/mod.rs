use std::{fmt, str};

/// Fixed-capacity text buffer that never allocates.
///
/// Writes past the capacity are silently truncated on a char boundary, and the
/// content is always followed by a NUL byte, so the buffer can be handed to the
/// host as a C string. Used by every path that may run inside a fault handler.
pub struct BoundedBuf<const N: usize> {
    buf: [u8; N],
    len: usize,
}

impl<const N: usize> BoundedBuf<N> {
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            len: 0,
        }
    }

    /// Max number of text bytes, one byte is reserved for the terminator.
    pub const fn capacity(&self) -> usize {
        N.saturating_sub(1)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn as_str(&self) -> &str {
        // only whole chars are ever copied in.
        str::from_utf8(self.as_bytes()).unwrap_or_default()
    }

    /// Pointer to the NUL-terminated content.
    pub fn as_ptr(&self) -> *const u8 {
        self.buf.as_ptr()
    }

    pub fn clear(&mut self) {
        self.buf[..self.len].iter_mut().for_each(|b| *b = 0);
        self.len = 0;
    }

    /// Appends as much of `s` as fits, returns the number of bytes taken.
    pub fn push_str(&mut self, s: &str) -> usize {
        let room = self.capacity() - self.len;
        let mut n = s.len().min(room);
        while !s.is_char_boundary(n) {
            n -= 1;
        }
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        if N != 0 {
            self.buf[self.len] = 0;
        }
        n
    }
}

impl<const N: usize> Default for BoundedBuf<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Write for BoundedBuf<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        // Truncation is not an error, the report must still go out.
        self.push_str(s);
        Ok(())
    }
}

impl<const N: usize> fmt::Debug for BoundedBuf<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl<const N: usize> fmt::Display for BoundedBuf<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::BoundedBuf;
    use std::fmt::Write;

    #[test]
    fn bounded_buf_truncate() {
        let mut buf = BoundedBuf::<8>::new();
        write!(buf, "{}-{}", "abcd", 1234).unwrap();
        assert_eq!(buf.as_str(), "abcd-12");
        assert!(buf.is_full());
        assert_eq!(buf.as_bytes().len(), 7);
        // terminator stays in place
        let raw = unsafe { std::slice::from_raw_parts(buf.as_ptr(), 8) };
        assert_eq!(raw[7], 0);
    }

    #[test]
    fn bounded_buf_char_boundary() {
        let mut buf = BoundedBuf::<6>::new();
        assert_eq!(buf.push_str("ab\u{00e9}\u{00e9}"), 4);
        assert_eq!(buf.as_str(), "ab\u{00e9}");
        assert_eq!(buf.push_str("x"), 1);
        assert_eq!(buf.push_str("y"), 0);
        assert_eq!(buf.as_str(), "ab\u{00e9}x");
    }

    #[test]
    fn bounded_buf_clear() {
        let mut buf = BoundedBuf::<16>::new();
        buf.push_str("hello");
        buf.clear();
        assert!(buf.is_empty());
        buf.push_str("hi");
        assert_eq!(buf.as_str(), "hi");
    }
}

use bytes::{BufMut, Bytes, BytesMut};

/// Extra room added on top of doubling whenever the buffer has to grow
const GROWTH_MARGIN: usize = 32;

/// Output buffer for one generated message.
///
/// Grows by doubling plus a small margin rather than to the exact size requested, so a message
/// built from thousands of tiny appends only reallocates a handful of times.
#[derive(Debug, Default)]
pub struct MessageBuffer {
    inner: BytesMut,
}

impl MessageBuffer {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        MessageBuffer {
            inner: BytesMut::with_capacity(capacity),
        }
    }

    /// Makes sure `additional` more bytes fit without another allocation.
    pub fn ensure(&mut self, additional: usize) {
        let needed = self.inner.len() + additional;
        if needed <= self.inner.capacity() {
            return;
        }
        let target = (self.inner.capacity() * 2 + GROWTH_MARGIN).max(needed + GROWTH_MARGIN);
        self.inner.reserve(target - self.inner.len());
    }

    pub fn push_str(&mut self, s: &str) {
        self.push_slice(s.as_bytes());
    }

    pub fn push_slice(&mut self, bytes: &[u8]) {
        self.ensure(bytes.len());
        self.inner.put_slice(bytes);
    }

    pub fn push_byte(&mut self, b: u8) {
        self.ensure(1);
        self.inner.put_u8(b);
    }

    /// Appends `count` copies of `b`, used to pad skipped fields
    pub fn push_repeated(&mut self, b: u8, count: usize) {
        self.ensure(count);
        self.inner.put_bytes(b, count);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.inner
    }

    pub fn freeze(self) -> Bytes {
        self.inner.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_by_doubling_with_margin() {
        let mut buf = MessageBuffer::with_capacity(16);
        buf.push_slice(&[b'x'; 16]);
        let before = buf.capacity();

        buf.push_byte(b'y');
        assert!(buf.capacity() >= before * 2 + GROWTH_MARGIN);
        assert_eq!(buf.len(), 17);
    }

    #[test]
    fn large_append_grows_past_doubling() {
        let mut buf = MessageBuffer::with_capacity(4);
        buf.push_slice(&[b'z'; 1000]);
        assert!(buf.capacity() >= 1000 + GROWTH_MARGIN);
    }

    #[test]
    fn many_small_appends_reallocate_rarely() {
        let mut buf = MessageBuffer::with_capacity(1);
        let mut growths = 0;
        let mut last_capacity = buf.capacity();

        for _ in 0..10_000 {
            buf.push_byte(b'|');
            if buf.capacity() != last_capacity {
                growths += 1;
                last_capacity = buf.capacity();
            }
        }

        assert_eq!(buf.len(), 10_000);
        assert!(growths < 20, "{} reallocations for 10k appends", growths);
    }

    #[test]
    fn push_repeated_pads() {
        let mut buf = MessageBuffer::new();
        buf.push_str("PID");
        buf.push_repeated(b'|', 3);
        assert_eq!(buf.as_slice(), b"PID|||");
    }
}

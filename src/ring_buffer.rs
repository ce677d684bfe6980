use std::cmp;
use std::sync::Mutex;

const MIN_CAPACITY: usize = 64;

// Fresh pool buffers start at 1 KiB; buffers that grew past 64 KiB are
// dropped on return instead of being retained forever.
const POOL_BUFFER_CAPACITY: usize = 1024;
const POOL_MAX_CAPACITY: usize = 64 * 1024;

static POOL: Mutex<Vec<RingBuffer>> = Mutex::new(Vec::new());

/// Takes a ring buffer from the shared pool, or allocates one.
pub fn get_from_pool() -> RingBuffer {
    let buffer = POOL.lock().unwrap().pop();
    buffer.unwrap_or_else(|| RingBuffer::with_capacity(POOL_BUFFER_CAPACITY))
}

/// Returns a ring buffer to the shared pool. Oversized buffers are dropped.
pub fn put_in_pool(mut buffer: RingBuffer) {
    if buffer.capacity() > POOL_MAX_CAPACITY {
        return;
    }

    buffer.retrieve_all();
    POOL.lock().unwrap().push(buffer);
}

/// A growable circular byte queue.
///
/// Capacity is always a power of two. Reads come in two flavors: the real
/// read index, advanced by `read`/`retrieve`, and a speculative virtual
/// cursor advanced by `virtual_read` that a stream parser uses to decode a
/// frame which may turn out to be incomplete. `virtual_flush` commits the
/// speculative reads and `virtual_revert` abandons them.
pub struct RingBuffer {
    buf: Box<[u8]>,
    r: usize,
    w: usize,
    size: usize,
    vr: usize,
    vsize: usize,
}

impl RingBuffer {
    pub fn new() -> RingBuffer {
        RingBuffer::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> RingBuffer {
        let capacity = if capacity == 0 {
            0
        } else {
            capacity.next_power_of_two()
        };

        RingBuffer {
            buf: vec![0u8; capacity].into_boxed_slice(),
            r: 0,
            w: 0,
            size: 0,
            vr: 0,
            vsize: 0,
        }
    }

    /// Number of readable bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Readable bytes remaining from the virtual cursor.
    #[inline]
    pub fn virtual_length(&self) -> usize {
        self.vsize
    }

    /// Appends `p`, growing capacity as needed. Always writes all of it.
    pub fn write(&mut self, p: &[u8]) -> usize {
        if p.is_empty() {
            return 0;
        }

        if self.capacity() - self.size < p.len() {
            self.grow(p.len());
        }

        let cap = self.capacity();
        let n = p.len();
        let end = cap - self.w;
        if n <= end {
            self.buf[self.w..self.w + n].copy_from_slice(p);
        } else {
            self.buf[self.w..].copy_from_slice(&p[..end]);
            self.buf[..n - end].copy_from_slice(&p[end..]);
        }

        self.w = (self.w + n) & (cap - 1);
        self.size += n;
        self.vsize += n;
        n
    }

    /// Copies up to `p.len()` bytes into `p` and consumes them.
    pub fn read(&mut self, p: &mut [u8]) -> usize {
        let n = self.copy_out(self.r, p, self.size);
        self.retrieve(n);
        n
    }

    /// The readable region, up to `n` bytes, as two slices bracketing the
    /// wrap point. Does not consume.
    pub fn peek(&self, n: usize) -> (&[u8], &[u8]) {
        let n = cmp::min(n, self.size);
        if n == 0 {
            return (&[], &[]);
        }

        let cap = self.capacity();
        let end = cap - self.r;
        if n <= end {
            (&self.buf[self.r..self.r + n], &[])
        } else {
            (&self.buf[self.r..], &self.buf[..n - end])
        }
    }

    /// The whole readable region as two slices bracketing the wrap point.
    pub fn peek_all(&self) -> (&[u8], &[u8]) {
        self.peek(self.size)
    }

    /// Big-endian u32 at the read index, if four bytes are buffered.
    pub fn peek_u32(&self) -> Option<u32> {
        if self.size < 4 {
            return None;
        }

        let mut b = [0u8; 4];
        self.copy_out(self.r, &mut b, self.size);
        Some(u32::from_be_bytes(b))
    }

    /// Big-endian u16 at the read index, if two bytes are buffered.
    pub fn peek_u16(&self) -> Option<u16> {
        if self.size < 2 {
            return None;
        }

        let mut b = [0u8; 2];
        self.copy_out(self.r, &mut b, self.size);
        Some(u16::from_be_bytes(b))
    }

    /// Advances the read index by up to `n` bytes. The virtual cursor is
    /// re-synchronized to the read index.
    pub fn retrieve(&mut self, n: usize) {
        let n = cmp::min(n, self.size);
        if n == 0 {
            return;
        }

        self.r = (self.r + n) & (self.capacity() - 1);
        self.size -= n;
        self.vr = self.r;
        self.vsize = self.size;
    }

    pub fn retrieve_all(&mut self) {
        self.r = 0;
        self.w = 0;
        self.size = 0;
        self.vr = 0;
        self.vsize = 0;
    }

    /// Zeroes the indices so free space is contiguous again. No-op unless
    /// the buffer is empty.
    pub fn reset(&mut self) {
        if self.size == 0 {
            self.retrieve_all();
        }
    }

    /// Copies up to `p.len()` bytes starting at the virtual cursor and
    /// advances it. The real read index is untouched.
    pub fn virtual_read(&mut self, p: &mut [u8]) -> usize {
        let n = self.copy_out(self.vr, p, self.vsize);
        if n > 0 {
            self.vr = (self.vr + n) & (self.capacity() - 1);
            self.vsize -= n;
        }
        n
    }

    /// Commits the virtual reads: the read index catches up to the cursor.
    pub fn virtual_flush(&mut self) {
        self.r = self.vr;
        self.size = self.vsize;
    }

    /// Abandons the virtual reads: the cursor snaps back to the read index.
    pub fn virtual_revert(&mut self) {
        self.vr = self.r;
        self.vsize = self.size;
    }

    /// Reloads the buffer with a copy of `data`, replacing any content.
    /// Used by the read fast path to run the protocol over freshly-read
    /// bytes without touching the persistent in-buffer.
    pub fn with_data(&mut self, data: &[u8]) {
        self.retrieve_all();
        self.write(data);
    }

    fn copy_out(&self, from: usize, p: &mut [u8], avail: usize) -> usize {
        let n = cmp::min(p.len(), avail);
        if n == 0 {
            return 0;
        }

        let cap = self.capacity();
        let end = cap - from;
        if n <= end {
            p[..n].copy_from_slice(&self.buf[from..from + n]);
        } else {
            p[..end].copy_from_slice(&self.buf[from..]);
            p[end..n].copy_from_slice(&self.buf[..n - end]);
        }
        n
    }

    fn grow(&mut self, need: usize) {
        let required = self.size + need;
        let new_cap = cmp::max(MIN_CAPACITY, required.next_power_of_two());
        let mut new_buf = vec![0u8; new_cap].into_boxed_slice();

        let (first, second) = self.peek_all();
        new_buf[..first.len()].copy_from_slice(first);
        new_buf[first.len()..first.len() + second.len()].copy_from_slice(second);

        // The virtual cursor keeps its offset from the read index.
        let virtual_consumed = self.size - self.vsize;
        self.buf = new_buf;
        self.r = 0;
        self.w = self.size;
        self.vr = virtual_consumed;
    }
}

impl Default for RingBuffer {
    fn default() -> RingBuffer {
        RingBuffer::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn collect(rb: &RingBuffer) -> Vec<u8> {
        let (first, second) = rb.peek_all();
        let mut out = first.to_vec();
        out.extend_from_slice(second);
        out
    }

    #[test]
    fn write_then_retrieve_tracks_length() {
        let mut rb = RingBuffer::with_capacity(8);
        rb.write(b"abcdefgh");
        assert_eq!(rb.len(), 8);

        rb.retrieve(3);
        assert_eq!(rb.len(), 5);
        assert_eq!(collect(&rb), b"defgh");
    }

    #[test]
    fn peek_all_spans_the_wrap() {
        let mut rb = RingBuffer::with_capacity(8);
        rb.write(b"abcdef");
        rb.retrieve(4);
        rb.write(b"ghij");

        let (first, second) = rb.peek_all();
        assert_eq!(first, b"efghi");
        assert_eq!(second, b"j");
        assert_eq!(collect(&rb), b"efghij");
    }

    #[test]
    fn grows_preserving_content() {
        let mut rb = RingBuffer::with_capacity(8);
        rb.write(b"abcdef");
        rb.retrieve(4);
        rb.write(b"ghij");
        rb.write(&[b'x'; 100]);

        assert_eq!(rb.len(), 106);
        let mut expected = b"efghij".to_vec();
        expected.extend_from_slice(&[b'x'; 100]);
        assert_eq!(collect(&rb), expected);
    }

    #[test]
    fn virtual_read_then_revert_is_a_no_op() {
        let mut rb = RingBuffer::with_capacity(16);
        rb.write(b"hello world");

        let mut buf = [0u8; 5];
        assert_eq!(rb.virtual_read(&mut buf), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(rb.virtual_length(), 6);
        assert_eq!(rb.len(), 11);

        rb.virtual_revert();
        assert_eq!(rb.virtual_length(), 11);
        assert_eq!(collect(&rb), b"hello world");
    }

    #[test]
    fn virtual_read_then_flush_equals_retrieve() {
        let mut a = RingBuffer::with_capacity(16);
        let mut b = RingBuffer::with_capacity(16);
        a.write(b"hello world");
        b.write(b"hello world");

        let mut buf = [0u8; 6];
        a.virtual_read(&mut buf);
        a.virtual_flush();
        b.retrieve(6);

        assert_eq!(a.len(), b.len());
        assert_eq!(collect(&a), collect(&b));
    }

    #[test]
    fn virtual_cursor_survives_growth() {
        let mut rb = RingBuffer::with_capacity(8);
        rb.write(b"abcdefg");

        let mut buf = [0u8; 3];
        rb.virtual_read(&mut buf);
        rb.write(&[b'y'; 50]);

        assert_eq!(rb.virtual_length(), 4 + 50);
        let mut rest = vec![0u8; 4];
        rb.virtual_read(&mut rest);
        assert_eq!(rest, b"defg");
    }

    #[test]
    fn peek_fixed_width_big_endian() {
        let mut rb = RingBuffer::with_capacity(8);
        assert_eq!(rb.peek_u32(), None);

        rb.write(&[0x00, 0x00, 0x01, 0x02, 0xff]);
        assert_eq!(rb.peek_u32(), Some(0x0102));
        assert_eq!(rb.peek_u16(), Some(0x0000));
        assert_eq!(rb.len(), 5);
    }

    #[test]
    fn peek_u32_spans_the_wrap() {
        let mut rb = RingBuffer::with_capacity(8);
        rb.write(b"abcdef");
        rb.retrieve(6);
        rb.write(&[0xde, 0xad, 0xbe, 0xef]);

        assert_eq!(rb.peek_u32(), Some(0xdeadbeef));
    }

    #[test]
    fn reset_requires_empty() {
        let mut rb = RingBuffer::with_capacity(8);
        rb.write(b"abc");
        rb.reset();
        assert_eq!(collect(&rb), b"abc");

        rb.retrieve_all();
        rb.reset();
        assert!(rb.is_empty());
    }

    #[test]
    fn with_data_replaces_content() {
        let mut rb = RingBuffer::with_capacity(8);
        rb.write(b"old");
        rb.with_data(b"new data");
        assert_eq!(collect(&rb), b"new data");
    }

    #[test]
    fn zero_capacity_grows_on_first_write() {
        let mut rb = RingBuffer::new();
        assert_eq!(rb.capacity(), 0);
        rb.write(b"x");
        assert_eq!(collect(&rb), b"x");
    }

    #[test]
    fn pool_caps_returned_capacity() {
        let mut rb = RingBuffer::with_capacity(1024);
        rb.write(&vec![0u8; POOL_MAX_CAPACITY * 2]);
        put_in_pool(rb);

        let fresh = get_from_pool();
        assert!(fresh.capacity() <= POOL_MAX_CAPACITY);
    }
}

use bytes::BytesMut;
use tracing::{debug, trace};

/// Pool for buffers that are too big for a single frame. These are written as a sequence of
///  fragments, so their memory is never put on the wire directly.
///
/// Buffers are pooled in size classes, starting at twice the fragment size and doubling from
///  there. A request is served from the smallest class that is big enough, or from a bigger
///  class if that has a free buffer.
pub struct BigBufferPool {
    fragment_size: usize,
    size_classes: Vec<Vec<BytesMut>>,
}

impl BigBufferPool {
    pub fn new(fragment_size: usize) -> BigBufferPool {
        BigBufferPool {
            fragment_size,
            size_classes: Vec::new(),
        }
    }

    fn class_index(&self, size: usize) -> usize {
        let mut class_size = self.fragment_size * 2;
        let mut result = 0;
        while class_size < size {
            class_size *= 2;
            result += 1;
        }
        result
    }

    fn class_size(&self, class_index: usize) -> usize {
        (self.fragment_size * 2) << class_index
    }

    /// Returns a buffer with at least `size` bytes
    pub fn poll(&mut self, size: usize) -> BytesMut {
        let class_index = self.class_index(size);

        for candidates in self.size_classes.iter_mut().skip(class_index) {
            if let Some(buf) = candidates.pop() {
                trace!("returning big buffer of {} bytes from pool", buf.len());
                return buf;
            }
        }

        let class_size = self.class_size(class_index);
        debug!("no big buffer for {} bytes in pool: creating new buffer of {} bytes", size, class_size);
        BytesMut::zeroed(class_size)
    }

    pub fn put(&mut self, buf: BytesMut) {
        let class_index = self.class_index(buf.len());
        if self.class_size(class_index) != buf.len() {
            debug!("returned big buffer of {} bytes does not match a size class: discarding", buf.len());
            return;
        }

        if self.size_classes.len() <= class_index {
            self.size_classes.resize_with(class_index + 1, Vec::new);
        }
        trace!("returning big buffer of {} bytes to pool", buf.len());
        self.size_classes[class_index].push(buf);
    }

    pub fn num_free(&self) -> usize {
        self.size_classes.iter()
            .map(|c| c.len())
            .sum()
    }

    pub fn clear(&mut self) {
        self.size_classes.clear();
    }
}

use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use bytes::buf::UninitSlice;
use bytes::BytesMut;
use crate::buffers::socket_block::BlockId;
use crate::ripc::{FrameHeader, RipcFlags, HEADER_LEN, PACKED_HEADER_LEN};
use crate::safe_converter::PrecheckedCast;

/// Identifies the channel a buffer was handed out by
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ChannelId(u64);

impl ChannelId {
    pub fn next() -> ChannelId {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        ChannelId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

pub(crate) enum BufferOrigin {
    /// a slice of one of the channel's blocks
    Block(BlockId),
    /// a big buffer, with the block slice reserved for its first fragment
    Big { first_fragment: Option<Box<TransportBuffer>> },
}

/// A buffer for writing a single outgoing message (or a sequence of packed messages).
///
/// Buffers are obtained from a channel (`Channel::get_buffer`) and owned by the application
///  until they are passed back to the channel, either by writing them or by releasing them. The
///  application writes its message through the `BufMut` implementation, or through `as_mut()`
///  after extending the buffer with `put_bytes()`.
///
/// Internally, a regular buffer reserves space for the frame header in front of the message, so
///  the frame can be sent without copying. A big buffer holds the raw message, which is copied
///  into fragments when it is written.
pub struct TransportBuffer {
    storage: BytesMut,
    /// first byte of the frame that was not yet written to the socket
    frame_start: usize,
    /// start of the current message, i.e. after the frame header or packed message length
    data_start: usize,
    /// end of the data written so far
    len: usize,
    /// start of the frame payload, i.e. after the frame header if that is reserved
    payload_start: usize,
    pack_len_pos: Option<usize>,
    packed: bool,
    origin: BufferOrigin,
    owner: ChannelId,
}

impl TransportBuffer {
    pub(crate) fn new_slice(storage: BytesMut, block_id: BlockId, owner: ChannelId, packed: bool) -> TransportBuffer {
        let (data_start, pack_len_pos) = if packed {
            (HEADER_LEN + PACKED_HEADER_LEN, Some(HEADER_LEN))
        }
        else {
            (HEADER_LEN, None)
        };

        TransportBuffer {
            storage,
            frame_start: 0,
            data_start,
            len: data_start,
            payload_start: HEADER_LEN,
            pack_len_pos,
            packed,
            origin: BufferOrigin::Block(block_id),
            owner,
        }
    }

    /// A buffer for frames assembled by the channel itself, e.g. fragments: the frame header is
    ///  part of the data.
    pub(crate) fn new_frame(storage: BytesMut, block_id: BlockId, owner: ChannelId) -> TransportBuffer {
        TransportBuffer {
            storage,
            frame_start: 0,
            data_start: 0,
            len: 0,
            payload_start: 0,
            pack_len_pos: None,
            packed: false,
            origin: BufferOrigin::Block(block_id),
            owner,
        }
    }

    pub(crate) fn new_big(storage: BytesMut, first_fragment: TransportBuffer, owner: ChannelId) -> TransportBuffer {
        TransportBuffer {
            storage,
            frame_start: 0,
            data_start: 0,
            len: 0,
            payload_start: 0,
            pack_len_pos: None,
            packed: false,
            origin: BufferOrigin::Big { first_fragment: Some(Box::new(first_fragment)) },
            owner,
        }
    }

    /// length of the current message
    pub fn len(&self) -> usize {
        self.len - self.data_start
    }

    pub fn is_empty(&self) -> bool {
        self.len == self.data_start
    }

    /// total space for the current message, including what was already written
    pub fn capacity(&self) -> usize {
        self.storage.len() - self.data_start
    }

    /// discards the current message
    pub fn clear(&mut self) {
        self.len = self.data_start;
    }

    pub fn is_big(&self) -> bool {
        matches!(self.origin, BufferOrigin::Big { .. })
    }

    pub fn is_packed(&self) -> bool {
        self.packed
    }

    pub(crate) fn owner(&self) -> ChannelId {
        self.owner
    }

    pub(crate) fn origin(&self) -> &BufferOrigin {
        &self.origin
    }

    pub(crate) fn take_first_fragment(&mut self) -> Option<TransportBuffer> {
        match &mut self.origin {
            BufferOrigin::Block(_) => None,
            BufferOrigin::Big { first_fragment } => first_fragment.take().map(|b| *b),
        }
    }

    pub(crate) fn into_storage(self) -> (BytesMut, BufferOrigin) {
        (self.storage, self.origin)
    }

    /// Closes the current packed message and starts a new one. Returns the space that is left
    ///  for the new message.
    pub(crate) fn pack(&mut self) -> usize {
        let Some(pos) = self.pack_len_pos else {
            return 0;
        };
        let entry_len: u16 = (self.len - self.data_start).prechecked_cast();
        self.storage[pos..pos + PACKED_HEADER_LEN].copy_from_slice(&entry_len.to_be_bytes());

        if self.storage.len() - self.len < PACKED_HEADER_LEN {
            // no room for another message
            self.pack_len_pos = None;
            self.data_start = self.len;
            return 0;
        }

        self.pack_len_pos = Some(self.len);
        self.len += PACKED_HEADER_LEN;
        self.data_start = self.len;
        self.storage.len() - self.len
    }

    /// Number of payload bytes the frame will have after [TransportBuffer::finalize_pack], i.e.
    ///  without a trailing empty packed message
    pub(crate) fn pending_payload_len(&self) -> usize {
        match self.pack_len_pos {
            Some(pos) if self.len == self.data_start => pos - HEADER_LEN,
            _ => self.len - self.payload_start,
        }
    }

    /// Writes the length of the last packed message. An empty last message is dropped.
    pub(crate) fn finalize_pack(&mut self) {
        let Some(pos) = self.pack_len_pos.take() else {
            return;
        };

        if self.len == self.data_start {
            self.len = pos;
        }
        else {
            let entry_len: u16 = (self.len - self.data_start).prechecked_cast();
            self.storage[pos..pos + PACKED_HEADER_LEN].copy_from_slice(&entry_len.to_be_bytes());
        }
        self.data_start = self.len;
    }

    /// The message data as it goes into the frame: everything after the frame header for
    ///  regular buffers, the whole data for big buffers
    pub(crate) fn payload(&self) -> &[u8] {
        &self.storage[self.payload_start..self.len]
    }

    /// Replaces the payload, e.g. with its compressed form. The caller ensures that the new
    ///  payload fits.
    pub(crate) fn replace_payload(&mut self, payload: &[u8]) {
        let start = self.payload_start;
        self.storage[start..start + payload.len()].copy_from_slice(payload);
        self.len = start + payload.len();
        self.data_start = self.data_start.min(self.len);
    }

    /// space for the frame in total, including the header
    pub(crate) fn frame_capacity(&self) -> usize {
        self.storage.len()
    }

    pub(crate) fn write_header(&mut self, flags: RipcFlags) {
        FrameHeader::new(self.len, flags).write_to(&mut self.storage[..HEADER_LEN]);
    }

    /// the part of the frame that still needs to go to the socket
    pub(crate) fn frame(&self) -> &[u8] {
        &self.storage[self.frame_start..self.len]
    }

    pub(crate) fn frame_len(&self) -> usize {
        self.len - self.frame_start
    }

    pub(crate) fn advance_frame_start(&mut self, num_bytes: usize) {
        self.frame_start = (self.frame_start + num_bytes).min(self.len);
    }
}

impl Debug for TransportBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportBuffer")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("big", &self.is_big())
            .field("packed", &self.packed)
            .finish()
    }
}

impl AsRef<[u8]> for TransportBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.storage[self.data_start..self.len]
    }
}
impl AsMut<[u8]> for TransportBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.data_start..self.len]
    }
}

unsafe impl bytes::BufMut for TransportBuffer {
    fn remaining_mut(&self) -> usize {
        self.storage.len() - self.len
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        assert!(self.len + cnt <= self.storage.len());
        self.len += cnt;
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        UninitSlice::new(&mut self.storage[self.len..])
    }
}

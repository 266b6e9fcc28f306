//! Parsing of incoming frames.
//!
//! Bytes are received into a fixed-size buffer of twice the maximum frame size. Frames are
//!  parsed in place: a frame is handed to the application (or consumed internally, e.g. as
//!  a fragment) once all its bytes are in the buffer, and the buffer is compacted only when the
//!  next frame would not fit into the rest of it.
//!
//! The state machine is advanced lazily: after a read returned a message, the message's bytes
//!  stay valid until the next read, which first moves past them.

use std::io;
use std::ops::Range;
use anyhow::{anyhow, bail, Context};
use bytes::{Buf, Bytes};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};
use crate::compression::Compressor;
use crate::error::{TransportError, TransportResult};
use crate::ripc::{FrameHeader, RipcExtFlags, RipcFlags, RipcVersion, HEADER_LEN, PACKED_HEADER_LEN};
use crate::safe_converter::SafeCast;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReadBufferState {
    NoData,
    /// the current frame's length is known, and the rest of it fits into the buffer
    KnownIncomplete,
    /// the current frame's length is known, and the buffer must be compacted before reading more
    KnownInsufficient,
    /// not even the current frame's header is complete
    UnknownIncomplete,
    UnknownInsufficient,
    KnownComplete,
    EndOfStream,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReadSubState {
    Normal,
    ProcessingCompressed,
    ProcessingPacked,
    ProcessingPackedCompressed,
    ProcessingFragmented,
    ProcessingFragmentedCompressed,
    ProcessingCompleteFragmented,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ReadOutcome {
    /// `remaining` is the number of bytes that are buffered beyond this message, plus one if
    ///  the current packed frame has more messages. If it is 0, the next read goes to the socket.
    Message { data: Bytes, remaining: usize },
    Ping,
    WouldBlock,
    /// another thread is reading from the channel
    ReadInProgress,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum DataSource {
    ReadBuffer,
    Decompressed,
    Reassembled,
}

/// What the first part of a compressed payload that was split across two frames belongs to
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum CompFragmentKind {
    Plain,
    Packed,
    Fragment(u16),
}

struct CompFragment {
    kind: CompFragmentKind,
    data: Vec<u8>,
}

struct Reassembly {
    total_len: usize,
    data: Vec<u8>,
}

pub struct ReadFramingStateMachine {
    buf: Vec<u8>,
    /// end of the received data
    filled: usize,
    msg_start: usize,
    frame_len: usize,
    frame_flags: RipcFlags,
    state: ReadBufferState,
    sub_state: ReadSubState,
    /// the current complete frame was reported to the caller and must be moved past
    delivered: bool,

    data_source: DataSource,
    data_pos: usize,
    data_len: usize,
    /// end of the packed messages in the current frame
    packed_end: usize,

    version: RipcVersion,
    max_msg_len: usize,
    decompressor: Option<Box<dyn Compressor>>,
    decompressed: Vec<u8>,
    comp_fragment: Option<CompFragment>,
    fragments: FxHashMap<u16, Reassembly>,
    reassembled: Vec<u8>,
}

impl ReadFramingStateMachine {
    /// `internal_max` is the maximum frame length including the header
    pub fn new(internal_max: usize, version: RipcVersion, decompressor: Option<Box<dyn Compressor>>) -> ReadFramingStateMachine {
        ReadFramingStateMachine {
            buf: vec![0; internal_max * 2],
            filled: 0,
            msg_start: 0,
            frame_len: 0,
            frame_flags: RipcFlags::empty(),
            state: ReadBufferState::NoData,
            sub_state: ReadSubState::Normal,
            delivered: false,
            data_source: DataSource::ReadBuffer,
            data_pos: 0,
            data_len: 0,
            packed_end: 0,
            version,
            max_msg_len: internal_max,
            decompressor,
            decompressed: Vec::new(),
            comp_fragment: None,
            fragments: FxHashMap::default(),
            reassembled: Vec::new(),
        }
    }

    pub fn state(&self) -> ReadBufferState {
        self.state
    }

    pub fn sub_state(&self) -> ReadSubState {
        self.sub_state
    }

    /// Bytes that were received during the handshake but belong to the first frames
    pub fn put_back(&mut self, data: &[u8]) -> anyhow::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if self.filled + data.len() > self.buf.len() {
            bail!("{} bytes left over from the handshake exceed the read buffer", data.len());
        }

        self.buf[self.filled..self.filled + data.len()].copy_from_slice(data);
        self.filled += data.len();
        self.update_state_after_receive()
    }

    /// Returns the next message, receiving from the socket at most once. Frames that are
    ///  consumed internally (fragments, the first part of a split compressed payload) do not
    ///  end the call if more complete frames are buffered.
    pub fn read(&mut self, mut receive: impl FnMut(&mut [u8]) -> io::Result<usize>) -> TransportResult<ReadOutcome> {
        let mut received = false;

        loop {
            if self.state == ReadBufferState::KnownComplete && self.delivered {
                self.advance_on_application_read()?;
            }

            if self.state != ReadBufferState::KnownComplete {
                if received {
                    return Ok(ReadOutcome::WouldBlock);
                }
                self.perform_read_io(&mut receive)?;
                received = true;

                match self.state {
                    ReadBufferState::KnownComplete => {}
                    ReadBufferState::EndOfStream => {
                        debug!("end of stream");
                        return Err(TransportError::failure("socket read returned end-of-stream"));
                    }
                    _ => return Ok(ReadOutcome::WouldBlock),
                }
            }

            self.delivered = true;
            if self.frame_len == HEADER_LEN {
                trace!("received ping");
                return Ok(ReadOutcome::Ping);
            }
            if self.data_len > 0 {
                let mut remaining = self.filled - (self.msg_start + self.frame_len);
                if self.has_remaining_packed_data() {
                    remaining += 1;
                }
                return Ok(ReadOutcome::Message {
                    data: Bytes::copy_from_slice(self.current_data()),
                    remaining,
                });
            }
            trace!("frame consumed internally");
        }
    }

    fn perform_read_io(&mut self, receive: &mut impl FnMut(&mut [u8]) -> io::Result<usize>) -> TransportResult<()> {
        match self.state {
            ReadBufferState::KnownInsufficient | ReadBufferState::UnknownInsufficient => self.compact(),
            _ => {}
        }

        let num_read = match receive(&mut self.buf[self.filled..]) {
            Ok(0) => {
                self.state = ReadBufferState::EndOfStream;
                return Ok(());
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        trace!("received {} bytes", num_read);

        self.filled += num_read;
        self.update_state_after_receive()?;
        Ok(())
    }

    fn update_state_after_receive(&mut self) -> anyhow::Result<()> {
        match self.state {
            ReadBufferState::KnownIncomplete => self.update_state_len_known(),
            ReadBufferState::NoData | ReadBufferState::UnknownIncomplete => self.update_state_len_unknown(),
            _ => Ok(()),
        }
    }

    fn compact(&mut self) {
        trace!("compacting read buffer: moving {} bytes", self.filled - self.msg_start);
        self.buf.copy_within(self.msg_start..self.filled, 0);
        self.filled -= self.msg_start;
        self.msg_start = 0;
        self.state = match self.state {
            ReadBufferState::KnownInsufficient => ReadBufferState::KnownIncomplete,
            _ => ReadBufferState::UnknownIncomplete,
        };
    }

    fn update_state_len_unknown(&mut self) -> anyhow::Result<()> {
        match FrameHeader::peek(&self.buf[self.msg_start..self.filled]) {
            Some(header) => {
                if header.len < HEADER_LEN || header.len > self.buf.len() {
                    bail!("invalid frame length {}", header.len);
                }
                self.frame_len = header.len;
                self.frame_flags = header.flags;
                self.update_state_len_known()
            }
            None => {
                self.state = if self.msg_start + HEADER_LEN <= self.buf.len() {
                    ReadBufferState::UnknownIncomplete
                }
                else {
                    ReadBufferState::UnknownInsufficient
                };
                Ok(())
            }
        }
    }

    fn update_state_len_known(&mut self) -> anyhow::Result<()> {
        let end = self.msg_start + self.frame_len;
        if end <= self.filled {
            self.state = ReadBufferState::KnownComplete;
            self.delivered = false;
            self.process_complete_frame()
        }
        else {
            self.state = if end <= self.buf.len() {
                ReadBufferState::KnownIncomplete
            }
            else {
                ReadBufferState::KnownInsufficient
            };
            Ok(())
        }
    }

    fn advance_on_application_read(&mut self) -> anyhow::Result<()> {
        if self.has_remaining_packed_data() {
            self.advance_to_next_packed_message()?;
            if self.data_pos != self.packed_end {
                self.delivered = false;
                return Ok(());
            }
        }

        let frame_end = self.msg_start + self.frame_len;
        if frame_end == self.filled {
            self.msg_start = 0;
            self.filled = 0;
            self.state = ReadBufferState::NoData;
            Ok(())
        }
        else {
            self.msg_start = frame_end;
            self.update_state_len_unknown()
        }
    }

    fn has_remaining_packed_data(&self) -> bool {
        match self.sub_state {
            ReadSubState::ProcessingPacked | ReadSubState::ProcessingPackedCompressed =>
                self.data_pos + self.data_len != self.packed_end,
            _ => false,
        }
    }

    fn current_data(&self) -> &[u8] {
        match self.data_source {
            DataSource::ReadBuffer => &self.buf[self.data_pos..self.data_pos + self.data_len],
            DataSource::Decompressed => &self.decompressed[self.data_pos..self.data_pos + self.data_len],
            DataSource::Reassembled => &self.reassembled[self.data_pos..self.data_pos + self.data_len],
        }
    }

    fn packed_source(&self) -> &[u8] {
        match self.data_source {
            DataSource::Decompressed => &self.decompressed,
            _ => &self.buf,
        }
    }

    fn set_no_data(&mut self) {
        self.data_source = DataSource::ReadBuffer;
        self.data_pos = self.msg_start + self.frame_len;
        self.data_len = 0;
    }

    fn process_complete_frame(&mut self) -> anyhow::Result<()> {
        self.set_no_data();
        if self.frame_len == HEADER_LEN {
            self.sub_state = ReadSubState::Normal;
            return Ok(());
        }

        let flags = self.frame_flags;
        let payload = self.msg_start + HEADER_LEN..self.msg_start + self.frame_len;

        if flags.contains(RipcFlags::PACKING) {
            if !flags.contains(RipcFlags::COMPRESSION) {
                self.sub_state = ReadSubState::ProcessingPacked;
                self.start_packed(DataSource::ReadBuffer, payload.start, payload.end)
            }
            else {
                self.sub_state = ReadSubState::ProcessingPackedCompressed;
                if flags.contains(RipcFlags::COMP_FRAGMENT) {
                    self.stash_comp_fragment(CompFragmentKind::Packed, payload);
                    Ok(())
                }
                else {
                    self.decompress(payload)?;
                    self.start_packed(DataSource::Decompressed, 0, self.decompressed.len())
                }
            }
        }
        else if flags.contains(RipcFlags::HAS_OPTIONAL_FLAGS) {
            self.sub_state = if flags.contains(RipcFlags::COMPRESSION) {
                ReadSubState::ProcessingFragmentedCompressed
            }
            else {
                ReadSubState::ProcessingFragmented
            };
            self.process_fragment(flags, payload)
        }
        else if flags.contains(RipcFlags::COMPRESSION) {
            if flags.contains(RipcFlags::COMP_FRAGMENT) {
                self.sub_state = ReadSubState::Normal;
                self.stash_comp_fragment(CompFragmentKind::Plain, payload);
                Ok(())
            }
            else if let Some(first_part) = self.comp_fragment.take() {
                self.process_second_comp_fragment(first_part, payload)
            }
            else {
                self.sub_state = ReadSubState::ProcessingCompressed;
                self.decompress(payload)?;
                self.data_source = DataSource::Decompressed;
                self.data_pos = 0;
                self.data_len = self.decompressed.len();
                Ok(())
            }
        }
        else {
            self.sub_state = ReadSubState::Normal;
            self.data_pos = payload.start;
            self.data_len = payload.len();
            Ok(())
        }
    }

    fn stash_comp_fragment(&mut self, kind: CompFragmentKind, payload: Range<usize>) {
        if self.comp_fragment.is_some() {
            debug!("discarding unfinished split compressed payload");
        }
        trace!("waiting for the rest of a split compressed payload ({:?})", kind);
        self.comp_fragment = Some(CompFragment {
            kind,
            data: self.buf[payload].to_vec(),
        });
    }

    fn process_second_comp_fragment(&mut self, mut first_part: CompFragment, payload: Range<usize>) -> anyhow::Result<()> {
        first_part.data.extend_from_slice(&self.buf[payload]);
        decompress_into(&mut self.decompressor, &first_part.data, &mut self.decompressed, self.max_msg_len)?;

        match first_part.kind {
            CompFragmentKind::Plain => {
                self.sub_state = ReadSubState::Normal;
                self.data_source = DataSource::Decompressed;
                self.data_pos = 0;
                self.data_len = self.decompressed.len();
                Ok(())
            }
            CompFragmentKind::Packed => {
                self.sub_state = ReadSubState::ProcessingPackedCompressed;
                self.start_packed(DataSource::Decompressed, 0, self.decompressed.len())
            }
            CompFragmentKind::Fragment(fragment_id) => {
                self.sub_state = ReadSubState::ProcessingFragmentedCompressed;
                if let Some(reassembly) = self.fragments.get_mut(&fragment_id) {
                    append_fragment(reassembly, &self.decompressed)?;
                }
                self.update_fragment_handler(fragment_id);
                Ok(())
            }
        }
    }

    fn start_packed(&mut self, source: DataSource, start: usize, end: usize) -> anyhow::Result<()> {
        self.data_source = source;
        self.packed_end = end;
        self.read_packed_entry(start)
    }

    fn advance_to_next_packed_message(&mut self) -> anyhow::Result<()> {
        self.read_packed_entry(self.data_pos + self.data_len)
    }

    /// A packed message length of 0, or a trailing partial length, ends the sequence
    fn read_packed_entry(&mut self, pos: usize) -> anyhow::Result<()> {
        let end = self.packed_end;
        if pos + PACKED_HEADER_LEN > end {
            self.data_pos = end;
            self.data_len = 0;
            return Ok(());
        }

        let source = self.packed_source();
        let len: usize = u16::from_be_bytes([source[pos], source[pos + 1]]).safe_cast();
        if len == 0 {
            self.data_pos = end;
            self.data_len = 0;
            return Ok(());
        }
        if pos + PACKED_HEADER_LEN + len > end {
            bail!("packed message of {} bytes exceeds its frame", len);
        }

        self.data_pos = pos + PACKED_HEADER_LEN;
        self.data_len = len;
        Ok(())
    }

    fn process_fragment(&mut self, flags: RipcFlags, payload: Range<usize>) -> anyhow::Result<()> {
        let mut header = &self.buf[payload.clone()];
        let ext_flags = RipcExtFlags::from_bits_truncate(header.try_get_u8()?);

        let fragment_id = if ext_flags.contains(RipcExtFlags::FRAGMENT_HEADER) {
            let total_len: usize = header.try_get_u32()?.safe_cast();
            let fragment_id = self.version.try_get_fragment_id(&mut header)?;
            trace!("first fragment of a {} byte message with fragment id {}", total_len, fragment_id);

            let reassembly = Reassembly {
                total_len,
                data: Vec::with_capacity(total_len.min(self.max_msg_len * 4)),
            };
            if self.fragments.insert(fragment_id, reassembly).is_some() {
                debug!("discarding incomplete message with fragment id {}", fragment_id);
            }
            fragment_id
        }
        else if ext_flags.contains(RipcExtFlags::FRAGMENT) {
            self.version.try_get_fragment_id(&mut header)?
        }
        else {
            debug!("ignoring frame with unsupported extended flags {:?}", ext_flags);
            return Ok(());
        };
        let data = payload.end - header.len()..payload.end;

        if flags.contains(RipcFlags::COMPRESSION) {
            if flags.contains(RipcFlags::COMP_FRAGMENT) {
                self.stash_comp_fragment(CompFragmentKind::Fragment(fragment_id), data);
                return Ok(());
            }
            // decompress even for unknown ids to keep the decompressor's stream in sync
            decompress_into(&mut self.decompressor, &self.buf[data], &mut self.decompressed, self.max_msg_len)?;
            if let Some(reassembly) = self.fragments.get_mut(&fragment_id) {
                append_fragment(reassembly, &self.decompressed)?;
            }
        }
        else if let Some(reassembly) = self.fragments.get_mut(&fragment_id) {
            append_fragment(reassembly, &self.buf[data])?;
        }

        if !self.fragments.contains_key(&fragment_id) {
            debug!("dropping fragment with unknown fragment id {}", fragment_id);
        }
        self.update_fragment_handler(fragment_id);
        Ok(())
    }

    fn update_fragment_handler(&mut self, fragment_id: u16) {
        let is_complete = self.fragments.get(&fragment_id)
            .map(|r| r.data.len() == r.total_len)
            .unwrap_or(false);

        if is_complete {
            if let Some(reassembly) = self.fragments.remove(&fragment_id) {
                debug!("reassembled {} byte message with fragment id {}", reassembly.total_len, fragment_id);
                self.reassembled = reassembly.data;
                self.data_source = DataSource::Reassembled;
                self.data_pos = 0;
                self.data_len = self.reassembled.len();
                self.sub_state = ReadSubState::ProcessingCompleteFragmented;
            }
        }
        else {
            self.set_no_data();
        }
    }

    fn decompress(&mut self, payload: Range<usize>) -> anyhow::Result<()> {
        decompress_into(&mut self.decompressor, &self.buf[payload], &mut self.decompressed, self.max_msg_len)
    }
}

fn decompress_into(decompressor: &mut Option<Box<dyn Compressor>>, src: &[u8], dst: &mut Vec<u8>, max_len: usize) -> anyhow::Result<()> {
    let decompressor = decompressor.as_mut()
        .ok_or_else(|| anyhow!("received compressed data, but compression was not negotiated"))?;

    dst.clear();
    decompressor.decompress(src, dst, max_len)
        .context("decompression failed")?;
    Ok(())
}

fn append_fragment(reassembly: &mut Reassembly, data: &[u8]) -> anyhow::Result<()> {
    if reassembly.data.len() + data.len() > reassembly.total_len {
        bail!("fragments exceed the total message length of {} bytes", reassembly.total_len);
    }
    reassembly.data.extend_from_slice(data);
    Ok(())
}


#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use bytes::BufMut;
    use rstest::rstest;
    use crate::compression::{CompressionType, MockCompressor};
    use crate::ripc::PING_FRAME;
    use super::*;

    /// Hands out prepared chunks of bytes, an empty chunk signals end of stream
    struct Feed {
        chunks: VecDeque<Vec<u8>>,
        num_receives: usize,
    }

    impl Feed {
        fn new(chunks: Vec<Vec<u8>>) -> Feed {
            Feed { chunks: chunks.into(), num_receives: 0 }
        }

        fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.num_receives += 1;
            match self.chunks.pop_front() {
                None => Err(io::ErrorKind::WouldBlock.into()),
                Some(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        self.chunks.push_front(chunk[n..].to_vec());
                    }
                    Ok(n)
                }
            }
        }
    }

    fn frame(flags: RipcFlags, payload: &[u8]) -> Vec<u8> {
        let mut result = vec![0; HEADER_LEN];
        FrameHeader::new(HEADER_LEN + payload.len(), flags).write_to(&mut result);
        result.extend_from_slice(payload);
        result
    }

    fn packed(messages: &[&[u8]]) -> Vec<u8> {
        let mut result = Vec::new();
        for m in messages {
            result.put_u16(m.len() as u16);
            result.put_slice(m);
        }
        result
    }

    fn first_fragment(version: RipcVersion, total_len: u32, fragment_id: u16, data: &[u8]) -> Vec<u8> {
        let mut payload = vec![RipcExtFlags::FRAGMENT_HEADER.bits()];
        payload.put_u32(total_len);
        version.put_fragment_id(&mut payload, fragment_id);
        payload.put_slice(data);
        frame(RipcFlags::HAS_OPTIONAL_FLAGS | RipcFlags::DATA, &payload)
    }

    fn next_fragment(version: RipcVersion, fragment_id: u16, data: &[u8]) -> Vec<u8> {
        let mut payload = vec![RipcExtFlags::FRAGMENT.bits()];
        version.put_fragment_id(&mut payload, fragment_id);
        payload.put_slice(data);
        frame(RipcFlags::HAS_OPTIONAL_FLAGS | RipcFlags::DATA, &payload)
    }

    fn message(data: &[u8], remaining: usize) -> ReadOutcome {
        ReadOutcome::Message { data: Bytes::copy_from_slice(data), remaining }
    }

    fn read(sm: &mut ReadFramingStateMachine, feed: &mut Feed) -> ReadOutcome {
        sm.read(|buf| feed.receive(buf)).unwrap()
    }

    #[test]
    fn test_single_frame() {
        let mut sm = ReadFramingStateMachine::new(100, RipcVersion::Ripc14, None);
        let mut feed = Feed::new(vec![frame(RipcFlags::DATA, b"hello")]);

        assert_eq!(read(&mut sm, &mut feed), message(b"hello", 0));
        assert_eq!(sm.state(), ReadBufferState::KnownComplete);
        assert_eq!(read(&mut sm, &mut feed), ReadOutcome::WouldBlock);
        assert_eq!(sm.state(), ReadBufferState::NoData);
    }

    #[test]
    fn test_buffered_frames_without_receive() {
        let mut sm = ReadFramingStateMachine::new(100, RipcVersion::Ripc14, None);
        let mut chunk = frame(RipcFlags::DATA, b"abc");
        chunk.extend(frame(RipcFlags::DATA, b"defg"));
        let mut feed = Feed::new(vec![chunk]);

        assert_eq!(read(&mut sm, &mut feed), message(b"abc", 7));
        assert_eq!(read(&mut sm, &mut feed), message(b"defg", 0));
        assert_eq!(feed.num_receives, 1);
    }

    #[test]
    fn test_byte_by_byte() {
        let mut sm = ReadFramingStateMachine::new(100, RipcVersion::Ripc14, None);
        let f = frame(RipcFlags::DATA, b"xyz");
        let mut feed = Feed::new(f.iter().map(|b| vec![*b]).collect());

        for _ in 0..f.len() - 1 {
            assert_eq!(read(&mut sm, &mut feed), ReadOutcome::WouldBlock);
        }
        assert_eq!(read(&mut sm, &mut feed), message(b"xyz", 0));
    }

    #[rstest]
    #[case::header_incomplete(2, ReadBufferState::UnknownIncomplete)]
    #[case::known_incomplete(4, ReadBufferState::KnownIncomplete)]
    fn test_incomplete_states(#[case] num_bytes: usize, #[case] expected: ReadBufferState) {
        let mut sm = ReadFramingStateMachine::new(100, RipcVersion::Ripc14, None);
        let mut feed = Feed::new(vec![frame(RipcFlags::DATA, b"hello")[..num_bytes].to_vec()]);

        assert_eq!(read(&mut sm, &mut feed), ReadOutcome::WouldBlock);
        assert_eq!(sm.state(), expected);
    }

    #[test]
    fn test_compaction() {
        // buffer of 32 bytes
        let mut sm = ReadFramingStateMachine::new(16, RipcVersion::Ripc14, None);
        let mut data = Vec::new();
        data.extend(frame(RipcFlags::DATA, &[1; 10]));
        data.extend(frame(RipcFlags::DATA, &[2; 10]));
        data.extend(frame(RipcFlags::DATA, &[3; 10]));
        let mut feed = Feed::new(vec![data[..30].to_vec(), data[30..].to_vec()]);

        assert_eq!(read(&mut sm, &mut feed), message(&[1; 10], 17));
        assert_eq!(read(&mut sm, &mut feed), message(&[2; 10], 4));
        assert_eq!(read(&mut sm, &mut feed), ReadOutcome::WouldBlock);
        assert_eq!(sm.state(), ReadBufferState::KnownInsufficient);
        assert_eq!(read(&mut sm, &mut feed), message(&[3; 10], 0));
    }

    #[test]
    fn test_ping() {
        let mut sm = ReadFramingStateMachine::new(100, RipcVersion::Ripc14, None);
        let mut chunk = PING_FRAME.to_vec();
        chunk.extend(frame(RipcFlags::DATA, b"a"));
        let mut feed = Feed::new(vec![chunk]);

        assert_eq!(read(&mut sm, &mut feed), ReadOutcome::Ping);
        assert_eq!(read(&mut sm, &mut feed), message(b"a", 0));
    }

    #[test]
    fn test_packed() {
        let mut sm = ReadFramingStateMachine::new(100, RipcVersion::Ripc14, None);
        let mut feed = Feed::new(vec![frame(RipcFlags::DATA | RipcFlags::PACKING, &packed(&[b"ab", b"cde", b"f"]))]);

        assert_eq!(read(&mut sm, &mut feed), message(b"ab", 1));
        assert_eq!(sm.sub_state(), ReadSubState::ProcessingPacked);
        assert_eq!(read(&mut sm, &mut feed), message(b"cde", 1));
        assert_eq!(read(&mut sm, &mut feed), message(b"f", 0));
        assert_eq!(read(&mut sm, &mut feed), ReadOutcome::WouldBlock);
        assert_eq!(feed.num_receives, 2);
    }

    #[test]
    fn test_packed_terminated_by_zero_length() {
        let mut sm = ReadFramingStateMachine::new(100, RipcVersion::Ripc14, None);
        let mut payload = packed(&[b"ab"]);
        payload.extend_from_slice(&[0, 0, 9, 9]);
        let mut chunk = frame(RipcFlags::DATA | RipcFlags::PACKING, &payload);
        chunk.extend(frame(RipcFlags::DATA, b"next"));
        let mut feed = Feed::new(vec![chunk]);

        assert_eq!(read(&mut sm, &mut feed), message(b"ab", 8));
        assert_eq!(read(&mut sm, &mut feed), message(b"next", 0));
    }

    #[test]
    fn test_packed_entry_exceeding_frame() {
        let mut sm = ReadFramingStateMachine::new(100, RipcVersion::Ripc14, None);
        let mut feed = Feed::new(vec![frame(RipcFlags::DATA | RipcFlags::PACKING, &[0, 9, 1, 2])]);
        assert!(sm.read(|buf| feed.receive(buf)).is_err());
    }

    #[rstest]
    #[case::ripc14(RipcVersion::Ripc14)]
    #[case::ripc11(RipcVersion::Ripc11)]
    fn test_fragmented(#[case] version: RipcVersion) {
        let mut sm = ReadFramingStateMachine::new(100, version, None);
        let mut feed = Feed::new(vec![
            first_fragment(version, 9, 7, b"abcd"),
            next_fragment(version, 7, b"efg"),
            next_fragment(version, 7, b"hi"),
        ]);

        assert_eq!(read(&mut sm, &mut feed), ReadOutcome::WouldBlock);
        assert_eq!(sm.sub_state(), ReadSubState::ProcessingFragmented);
        assert_eq!(read(&mut sm, &mut feed), ReadOutcome::WouldBlock);
        assert_eq!(read(&mut sm, &mut feed), message(b"abcdefghi", 0));
        assert_eq!(sm.sub_state(), ReadSubState::ProcessingCompleteFragmented);
    }

    #[test]
    fn test_fragments_buffered_together() {
        let version = RipcVersion::Ripc13;
        let mut sm = ReadFramingStateMachine::new(100, version, None);
        let mut chunk = first_fragment(version, 6, 300, b"abc");
        chunk.extend(next_fragment(version, 300, b"def"));
        let mut feed = Feed::new(vec![chunk]);

        assert_eq!(read(&mut sm, &mut feed), message(b"abcdef", 0));
    }

    #[test]
    fn test_interleaved_fragment_ids() {
        let version = RipcVersion::Ripc14;
        let mut sm = ReadFramingStateMachine::new(100, version, None);
        let mut feed = Feed::new(vec![
            first_fragment(version, 4, 1, b"aa"),
            first_fragment(version, 4, 2, b"bb"),
            next_fragment(version, 2, b"BB"),
            next_fragment(version, 1, b"AA"),
        ]);

        assert_eq!(read(&mut sm, &mut feed), ReadOutcome::WouldBlock);
        assert_eq!(read(&mut sm, &mut feed), ReadOutcome::WouldBlock);
        assert_eq!(read(&mut sm, &mut feed), message(b"bbBB", 0));
        assert_eq!(read(&mut sm, &mut feed), message(b"aaAA", 0));
    }

    #[test]
    fn test_new_first_fragment_replaces_incomplete() {
        let version = RipcVersion::Ripc14;
        let mut sm = ReadFramingStateMachine::new(100, version, None);
        let mut feed = Feed::new(vec![
            first_fragment(version, 10, 5, b"old"),
            first_fragment(version, 4, 5, b"ne"),
            next_fragment(version, 5, b"w!"),
        ]);

        assert_eq!(read(&mut sm, &mut feed), ReadOutcome::WouldBlock);
        assert_eq!(read(&mut sm, &mut feed), ReadOutcome::WouldBlock);
        assert_eq!(read(&mut sm, &mut feed), message(b"new!", 0));
    }

    #[test]
    fn test_unknown_fragment_id_is_dropped() {
        let version = RipcVersion::Ripc14;
        let mut sm = ReadFramingStateMachine::new(100, version, None);
        let mut chunk = next_fragment(version, 99, b"lost");
        chunk.extend(frame(RipcFlags::DATA, b"ok"));
        let mut feed = Feed::new(vec![chunk]);

        assert_eq!(read(&mut sm, &mut feed), message(b"ok", 0));
    }

    #[test]
    fn test_fragment_exceeding_total_len() {
        let version = RipcVersion::Ripc14;
        let mut sm = ReadFramingStateMachine::new(100, version, None);
        let mut feed = Feed::new(vec![first_fragment(version, 2, 1, b"abc")]);
        assert!(sm.read(|buf| feed.receive(buf)).is_err());
    }

    #[test]
    fn test_compressed() {
        let mut compressor = CompressionType::Zlib.new_compressor(6).unwrap();
        let mut compressed = Vec::new();
        compressor.compress(&[b'x'; 500], &mut compressed).unwrap();

        let mut sm = ReadFramingStateMachine::new(1000, RipcVersion::Ripc14, CompressionType::Zlib.new_compressor(6));
        let mut feed = Feed::new(vec![frame(RipcFlags::COMPRESSION, &compressed)]);

        assert_eq!(read(&mut sm, &mut feed), message(&[b'x'; 500], 0));
        assert_eq!(sm.sub_state(), ReadSubState::ProcessingCompressed);
    }

    #[test]
    fn test_compressed_packed() {
        let mut compressor = CompressionType::Lz4.new_compressor(0).unwrap();
        let mut compressed = Vec::new();
        compressor.compress(&packed(&[&[1; 200], &[2; 200]]), &mut compressed).unwrap();

        let mut sm = ReadFramingStateMachine::new(1000, RipcVersion::Ripc14, CompressionType::Lz4.new_compressor(0));
        let mut feed = Feed::new(vec![frame(RipcFlags::COMPRESSION | RipcFlags::PACKING, &compressed)]);

        assert_eq!(read(&mut sm, &mut feed), message(&[1; 200], 1));
        assert_eq!(sm.sub_state(), ReadSubState::ProcessingPackedCompressed);
        assert_eq!(read(&mut sm, &mut feed), message(&[2; 200], 0));
    }

    #[test]
    fn test_split_compressed_payload() {
        let mut decompressor = MockCompressor::new();
        decompressor.expect_decompress()
            .withf(|src, _, _| src == b"firstsecond")
            .times(1)
            .returning(|_, dst, _| {
                dst.extend_from_slice(b"decompressed");
                Ok(12)
            });

        let mut sm = ReadFramingStateMachine::new(100, RipcVersion::Ripc14, Some(Box::new(decompressor)));
        let mut feed = Feed::new(vec![
            frame(RipcFlags::COMPRESSION | RipcFlags::COMP_FRAGMENT, b"first"),
            frame(RipcFlags::COMPRESSION, b"second"),
        ]);

        assert_eq!(read(&mut sm, &mut feed), ReadOutcome::WouldBlock);
        assert_eq!(read(&mut sm, &mut feed), message(b"decompressed", 0));
    }

    #[test]
    fn test_split_compressed_fragment() {
        let version = RipcVersion::Ripc14;
        let mut decompressor = MockCompressor::new();
        decompressor.expect_decompress()
            .withf(|src, _, _| src == b"c1c2")
            .times(1)
            .returning(|_, dst, _| {
                dst.extend_from_slice(b"abcdef");
                Ok(6)
            });

        let mut payload = vec![RipcExtFlags::FRAGMENT_HEADER.bits()];
        payload.put_u32(6);
        version.put_fragment_id(&mut payload, 3);
        payload.put_slice(b"c1");

        let mut sm = ReadFramingStateMachine::new(100, version, Some(Box::new(decompressor)));
        let mut chunk = frame(RipcFlags::HAS_OPTIONAL_FLAGS | RipcFlags::COMPRESSION | RipcFlags::COMP_FRAGMENT, &payload);
        chunk.extend(frame(RipcFlags::COMPRESSION, b"c2"));
        let mut feed = Feed::new(vec![chunk]);

        assert_eq!(read(&mut sm, &mut feed), message(b"abcdef", 0));
    }

    #[test]
    fn test_compressed_without_negotiated_compression() {
        let mut sm = ReadFramingStateMachine::new(100, RipcVersion::Ripc14, None);
        let mut feed = Feed::new(vec![frame(RipcFlags::COMPRESSION, b"zzz")]);
        assert!(sm.read(|buf| feed.receive(buf)).is_err());
    }

    #[test]
    fn test_end_of_stream() {
        let mut sm = ReadFramingStateMachine::new(100, RipcVersion::Ripc14, None);
        let mut feed = Feed::new(vec![vec![]]);

        assert!(matches!(sm.read(|buf| feed.receive(buf)), Err(TransportError::Failure(_))));
        assert_eq!(sm.state(), ReadBufferState::EndOfStream);
    }

    #[test]
    fn test_io_error() {
        let mut sm = ReadFramingStateMachine::new(100, RipcVersion::Ripc14, None);
        let result = sm.read(|_| Err(io::ErrorKind::ConnectionReset.into()));
        assert!(matches!(result, Err(TransportError::Io(_))));
    }

    #[rstest]
    #[case::too_short(vec![0, 2, 2])]
    #[case::too_long(vec![0xff, 0xff, 2])]
    fn test_invalid_frame_length(#[case] data: Vec<u8>) {
        let mut sm = ReadFramingStateMachine::new(100, RipcVersion::Ripc14, None);
        let mut feed = Feed::new(vec![data]);
        assert!(sm.read(|buf| feed.receive(buf)).is_err());
    }

    #[test]
    fn test_put_back() {
        let mut sm = ReadFramingStateMachine::new(100, RipcVersion::Ripc14, None);
        let mut leftover = frame(RipcFlags::DATA, b"early");
        leftover.extend_from_slice(&frame(RipcFlags::DATA, b"late")[..2]);
        sm.put_back(&leftover).unwrap();

        let mut feed = Feed::new(vec![frame(RipcFlags::DATA, b"late")[2..].to_vec()]);
        assert_eq!(read(&mut sm, &mut feed), message(b"early", 2));
        assert_eq!(feed.num_receives, 0);
        assert_eq!(read(&mut sm, &mut feed), message(b"late", 0));
    }
}

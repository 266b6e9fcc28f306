use std::io;
use std::sync::Arc;
use bitflags::bitflags;
use bytes::{BufMut, BytesMut};
use tracing::{debug, trace, warn};
use crate::buffers::big_buffer_pool::BigBufferPool;
use crate::buffers::shared_pool::SharedBlockPool;
use crate::buffers::socket_block::{BlockId, SocketBlocks};
use crate::buffers::transport_buffer::{BufferOrigin, ChannelId, TransportBuffer};
use crate::compression::{CompressionType, Compressor};
use crate::config::{validate_flush_order, ChannelConfig};
use crate::error::{TransportError, TransportResult};
use crate::handshake::Negotiated;
use crate::ripc::{FragmentIdGenerator, RipcExtFlags, RipcFlags, RipcVersion, HEADER_LEN, PACKED_HEADER_LEN};
use crate::safe_converter::PrecheckedCast;
use crate::socket::ChannelSocket;
use crate::write_engine::{FlushOrder, Priority, WriteFlushEngine};

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct WriteFlags: u8 {
        const DO_NOT_COMPRESS = 0x01;
        /// flush right away instead of waiting for the high water mark
        const DIRECT_SOCKET_WRITE = 0x02;
    }
}

#[derive(Debug)]
pub enum WriteOutcome {
    /// The message was queued. This is the number of bytes queued in total.
    Queued(usize),
    /// The write triggered a flush. This is the number of bytes that remain queued.
    Flushed(usize),
    /// A fragmented write ran out of buffers. Pass the paused write to
    ///  `Channel::resume_write` once buffers were freed, e.g. by flushing.
    CallAgain(PausedWrite),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct FragmentProgress {
    fragment_id: u16,
    /// message bytes that were queued as fragments
    offset: usize,
}

/// A fragmented write that stopped because the channel ran out of buffers. It holds on to the
///  message, and resuming it continues with the first byte that was not queued yet.
#[derive(Debug)]
pub struct PausedWrite {
    buffer: TransportBuffer,
    priority: Priority,
    flags: WriteFlags,
    progress: FragmentProgress,
}

impl PausedWrite {
    pub fn bytes_written(&self) -> usize {
        self.progress.offset
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub(crate) fn buffer(&self) -> &TransportBuffer {
        &self.buffer
    }

    pub(crate) fn into_buffer(self) -> TransportBuffer {
        self.buffer
    }
}

fn parse_flush_order(flush_order: &str) -> anyhow::Result<FlushOrder> {
    validate_flush_order(flush_order)?;
    flush_order.parse()
}

/// The write side of an active channel: its buffer memory, the priority queues and compression
pub(crate) struct ChannelOutput {
    channel_id: ChannelId,
    blocks: SocketBlocks,
    shared: Arc<SharedBlockPool>,
    big_buffers: BigBufferPool,
    engine: WriteFlushEngine,
    compressor: Option<Box<dyn Compressor>>,
    compression_type: CompressionType,
    compression_threshold: usize,
    /// compression is restricted to the priority of the first compressed message, so that
    ///  compressed frames go over the wire in the order in which they were compressed
    compress_priority: Option<Priority>,
    fragment_ids: FragmentIdGenerator,
    version: RipcVersion,
    /// maximum frame length, including the header
    internal_max: usize,
    high_water_mark: usize,
    compressed: Vec<u8>,
}

impl ChannelOutput {
    pub fn new(channel_id: ChannelId, negotiated: &Negotiated, config: &ChannelConfig, shared: Arc<SharedBlockPool>, borrow_from_shared: bool) -> TransportResult<ChannelOutput> {
        let internal_max = negotiated.max_user_msg_size + HEADER_LEN;
        let flush_order = parse_flush_order(&config.flush_order)
            .map_err(|e| TransportError::InvalidArgument(format!("invalid flush order: {}", e)))?;

        let mut blocks = SocketBlocks::new(internal_max, config.max_output_buffers, borrow_from_shared);
        blocks.grow_guaranteed(config.guaranteed_output_buffers, &shared);

        let compression_type = negotiated.compression_type;
        let compression_threshold = config.compression_threshold
            .unwrap_or_default()
            .max(compression_type.min_threshold());

        Ok(ChannelOutput {
            channel_id,
            blocks,
            shared,
            big_buffers: BigBufferPool::new(internal_max - HEADER_LEN - PACKED_HEADER_LEN),
            engine: WriteFlushEngine::new(flush_order),
            compressor: compression_type.new_compressor(negotiated.compression_level),
            compression_type,
            compression_threshold,
            compress_priority: None,
            fragment_ids: FragmentIdGenerator::new(),
            version: negotiated.version,
            internal_max,
            high_water_mark: config.high_water_mark,
            compressed: Vec::new(),
        })
    }

    /// the largest message that fits into a single frame, with room for a packed length
    pub fn max_fragment_size(&self) -> usize {
        self.internal_max - HEADER_LEN - PACKED_HEADER_LEN
    }

    pub fn buffer_usage(&self) -> usize {
        self.blocks.used()
    }

    pub fn guaranteed_buffers(&self) -> usize {
        self.blocks.guaranteed()
    }

    pub fn max_buffers(&self) -> usize {
        self.blocks.max()
    }

    pub fn compression_threshold(&self) -> usize {
        self.compression_threshold
    }

    pub fn flush_order(&self) -> String {
        self.engine.flush_order().to_string()
    }

    pub fn bytes_queued(&self) -> usize {
        self.engine.bytes_queued()
    }

    pub fn get_buffer(&mut self, size: usize, packed: bool, socket: &dyn ChannelSocket) -> TransportResult<TransportBuffer> {
        let len = HEADER_LEN + size + if packed { PACKED_HEADER_LEN } else { 0 };
        if len > self.internal_max {
            if packed {
                return Err(TransportError::InvalidArgument(format!("packed buffer of {} bytes exceeds the max fragment size of {} bytes", size, self.max_fragment_size())));
            }

            // reserved for the first fragment, so a fragmented write can always start
            let (storage, block_id) = self.slice(self.internal_max, socket)?;
            let first_fragment = TransportBuffer::new_frame(storage, block_id, self.channel_id);
            trace!("big buffer for {} bytes", size);
            return Ok(TransportBuffer::new_big(self.big_buffers.poll(size), first_fragment, self.channel_id));
        }

        let (storage, block_id) = self.slice(len, socket)?;
        Ok(TransportBuffer::new_slice(storage, block_id, self.channel_id, packed))
    }

    /// Cuts a slice from the channel's blocks. If there is no free block, queued frames are
    ///  flushed to free some.
    fn slice(&mut self, len: usize, socket: &dyn ChannelSocket) -> TransportResult<(BytesMut, BlockId)> {
        if let Some(result) = self.blocks.slice(len, &self.shared) {
            return Ok(result);
        }

        debug!("out of buffers, flushing to free some");
        self.flush(socket)?;
        self.blocks.slice(len, &self.shared)
            .ok_or_else(|| TransportError::NoBuffers("channel out of buffers".to_string()))
    }

    /// Returns a buffer's memory to the pool it came from
    pub fn release(&mut self, mut buffer: TransportBuffer) {
        if let Some(first_fragment) = buffer.take_first_fragment() {
            self.release(first_fragment);
        }

        let (storage, origin) = buffer.into_storage();
        match origin {
            BufferOrigin::Block(block_id) => {
                // the block can only be reclaimed once the slice's memory is gone
                drop(storage);
                if !self.blocks.release(block_id, &self.shared) {
                    trace!("released buffer of a recycled block");
                }
            }
            BufferOrigin::Big { .. } => self.big_buffers.put(storage),
        }
    }

    pub fn write(&mut self, buffer: TransportBuffer, priority: Priority, flags: WriteFlags, socket: &dyn ChannelSocket) -> TransportResult<WriteOutcome> {
        if buffer.is_big() {
            if u32::try_from(buffer.len()).is_err() {
                self.release(buffer);
                return Err(TransportError::InvalidArgument("message exceeds the maximum message length".to_string()));
            }
            let progress = FragmentProgress {
                fragment_id: self.fragment_ids.next_id(self.version),
                offset: 0,
            };
            return self.write_fragmented(PausedWrite { buffer, priority, flags, progress }, socket);
        }

        self.write_frame(buffer, priority, flags)?;
        self.after_write(flags, socket)
    }

    pub fn resume(&mut self, paused: PausedWrite, socket: &dyn ChannelSocket) -> TransportResult<WriteOutcome> {
        debug!("resuming fragmented write at {} of {} bytes", paused.progress.offset, paused.buffer.len());
        self.write_fragmented(paused, socket)
    }

    fn should_compress(&mut self, payload_len: usize, priority: Priority, flags: WriteFlags) -> bool {
        if self.compressor.is_none() || flags.contains(WriteFlags::DO_NOT_COMPRESS) || payload_len < self.compression_threshold {
            return false;
        }
        match self.compress_priority {
            Some(p) => p == priority,
            None => {
                debug!("compressing messages with priority {:?}", priority);
                self.compress_priority = Some(priority);
                true
            }
        }
    }

    fn compress(&mut self, src: &[u8]) -> TransportResult<()> {
        let compressor = self.compressor.as_mut()
            .ok_or_else(|| TransportError::failure("compression was not negotiated"))?;
        self.compressed.clear();
        compressor.compress(src, &mut self.compressed)
            .map_err(|e| TransportError::failure(format!("compression failed: {}", e)))?;
        Ok(())
    }

    /// Queues a buffer that holds a single frame, compressing its payload if appropriate
    fn write_frame(&mut self, mut buffer: TransportBuffer, priority: Priority, flags: WriteFlags) -> TransportResult<()> {
        buffer.finalize_pack();
        let packing = if buffer.is_packed() { RipcFlags::PACKING } else { RipcFlags::empty() };
        let payload_len = buffer.payload().len();

        if !self.should_compress(payload_len, priority, flags) {
            buffer.write_header(RipcFlags::DATA | packing);
            self.engine.enqueue(buffer, priority);
            return Ok(());
        }

        // If the compressed payload may not fit into the buffer, the rest goes into a second
        //  frame. That frame is reserved up front: once data went through the compressor, it
        //  must be sent.
        let room = buffer.frame_capacity() - HEADER_LEN;
        let max_compressed_len = self.compression_type.max_compressed_len(payload_len);
        let overflow = if max_compressed_len > room {
            let len = (HEADER_LEN + max_compressed_len - room).min(self.internal_max);
            match self.blocks.slice(len, &self.shared) {
                Some((storage, block_id)) => Some(TransportBuffer::new_frame(storage, block_id, self.channel_id)),
                None => {
                    debug!("no buffer for compression overflow, sending uncompressed");
                    buffer.write_header(RipcFlags::DATA | packing);
                    self.engine.enqueue(buffer, priority);
                    return Ok(());
                }
            }
        }
        else {
            None
        };

        if let Err(e) = self.compress(buffer.payload()) {
            self.release(buffer);
            if let Some(overflow) = overflow {
                self.release(overflow);
            }
            return Err(e);
        }
        let compressed_len = self.compressed.len();
        trace!("compressed {} bytes to {}", payload_len, compressed_len);

        match overflow {
            Some(overflow) if compressed_len > room => {
                let mut second = overflow;
                if compressed_len - room > second.frame_capacity() - HEADER_LEN {
                    self.release(second);
                    self.release(buffer);
                    return Err(TransportError::failure(format!("compressed data of {} bytes exceeds two frames", compressed_len)));
                }
                buffer.replace_payload(&self.compressed[..room]);
                buffer.write_header(RipcFlags::COMPRESSION | RipcFlags::COMP_FRAGMENT | packing);

                second.put_bytes(0, HEADER_LEN);
                second.put_slice(&self.compressed[room..]);
                second.write_header(RipcFlags::COMPRESSION);

                self.engine.enqueue(buffer, priority);
                self.engine.enqueue(second, priority);
            }
            overflow => {
                if compressed_len > room {
                    self.release(buffer);
                    if let Some(overflow) = overflow {
                        self.release(overflow);
                    }
                    return Err(TransportError::failure(format!("compressed data of {} bytes exceeds the frame", compressed_len)));
                }
                buffer.replace_payload(&self.compressed);
                buffer.write_header(RipcFlags::COMPRESSION | packing);
                self.engine.enqueue(buffer, priority);
                if let Some(overflow) = overflow {
                    self.release(overflow);
                }
            }
        }
        Ok(())
    }

    /// A frame for the next fragment, or `None` if there is no free block even after flushing
    fn fragment_frame(&mut self, socket: &dyn ChannelSocket) -> TransportResult<Option<TransportBuffer>> {
        if self.blocks.slice(self.internal_max, &self.shared).is_none() {
            self.flush(socket)?;
        }
        Ok(self.blocks.slice(self.internal_max, &self.shared)
            .map(|(storage, block_id)| TransportBuffer::new_frame(storage, block_id, self.channel_id)))
    }

    /// Splits a big buffer into fragments. Each fragment is compressed separately, with its
    ///  uncompressed length limited so that the compressed data is guaranteed to fit.
    fn write_fragmented(&mut self, mut paused: PausedWrite, socket: &dyn ChannelSocket) -> TransportResult<WriteOutcome> {
        let total_len = paused.buffer.len();
        let may_compress = self.compressor.is_some()
            && !paused.flags.contains(WriteFlags::DO_NOT_COMPRESS)
            && self.compress_priority.map_or(true, |p| p == paused.priority);

        while paused.progress.offset < total_len {
            let offset = paused.progress.offset;
            let is_first = offset == 0;

            let reserved = if is_first { paused.buffer.take_first_fragment() } else { None };
            let mut frame = match reserved {
                Some(frame) => frame,
                None => match self.fragment_frame(socket) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => {
                        debug!("out of buffers after {} of {} bytes, pausing fragmented write", offset, total_len);
                        return Ok(WriteOutcome::CallAgain(paused));
                    }
                    Err(e) => {
                        self.release(paused.buffer);
                        return Err(e);
                    }
                },
            };

            let header_len = if is_first { self.version.first_fragment_header_len() } else { self.version.next_fragment_header_len() };
            let room = self.internal_max - header_len;
            let mut chunk_len = (total_len - offset).min(room);
            let mut frame_flags = RipcFlags::HAS_OPTIONAL_FLAGS | RipcFlags::DATA;

            let compressible_len = chunk_len.min(self.compression_type.max_input_len(room));
            let compress = may_compress && compressible_len >= self.compression_threshold;
            if compress {
                chunk_len = compressible_len;
                frame_flags |= RipcFlags::COMPRESSION;
                if self.compress_priority.is_none() {
                    debug!("compressing messages with priority {:?}", paused.priority);
                    self.compress_priority = Some(paused.priority);
                }
            }

            frame.put_bytes(0, HEADER_LEN);
            if is_first {
                frame.put_u8(RipcExtFlags::FRAGMENT_HEADER.bits());
                frame.put_u32(total_len.prechecked_cast());
            }
            else {
                frame.put_u8(RipcExtFlags::FRAGMENT.bits());
            }
            self.version.put_fragment_id(&mut frame, paused.progress.fragment_id);

            let chunk = &paused.buffer.payload()[offset..offset + chunk_len];
            if compress {
                if let Err(e) = self.compress(chunk) {
                    self.release(frame);
                    self.release(paused.buffer);
                    return Err(e);
                }
                frame.put_slice(&self.compressed);
            }
            else {
                frame.put_slice(chunk);
            }
            frame.write_header(frame_flags);
            trace!("queueing fragment {} of message {} ({} bytes)", offset, paused.progress.fragment_id, chunk_len);

            self.engine.enqueue(frame, paused.priority);
            paused.progress.offset += chunk_len;
        }

        let flags = paused.flags;
        self.release(paused.buffer);
        self.after_write(flags, socket)
    }

    fn after_write(&mut self, flags: WriteFlags, socket: &dyn ChannelSocket) -> TransportResult<WriteOutcome> {
        if flags.contains(WriteFlags::DIRECT_SOCKET_WRITE) || self.engine.bytes_queued() > self.high_water_mark {
            return match self.flush(socket) {
                Ok(remaining) => Ok(WriteOutcome::Flushed(remaining)),
                Err(e) => Err(TransportError::WriteFlushFailed(format!("flush after write failed: {}", e))),
            };
        }
        Ok(WriteOutcome::Queued(self.engine.bytes_queued()))
    }

    /// Returns the number of bytes that remain queued
    pub fn flush(&mut self, socket: &dyn ChannelSocket) -> io::Result<usize> {
        let mut written = Vec::new();
        let result = self.engine.flush(|bufs| socket.send(bufs), &mut written);
        for frame in written {
            self.release(frame);
        }
        result
    }

    pub fn ping(&mut self, socket: &dyn ChannelSocket) -> io::Result<usize> {
        let mut written = Vec::new();
        let result = self.engine.ping(|bufs| socket.send(bufs), &mut written);
        for frame in written {
            self.release(frame);
        }
        result
    }

    pub fn set_flush_order(&mut self, flush_order: &str) -> TransportResult<()> {
        match parse_flush_order(flush_order) {
            Ok(flush_order) => {
                debug!("flush order is now {}", flush_order);
                self.engine.set_flush_order(flush_order);
                Ok(())
            }
            Err(e) => {
                warn!("rejected flush order {:?}: {}", flush_order, e);
                Err(TransportError::InvalidArgument(format!("invalid flush order: {}", e)))
            }
        }
    }

    pub fn set_max_buffers(&mut self, max: usize) -> usize {
        self.blocks.set_max(max)
    }

    pub fn set_guaranteed_buffers(&mut self, num_blocks: usize) -> usize {
        self.blocks.set_guaranteed(num_blocks, &self.shared)
    }

    pub fn set_high_water_mark(&mut self, high_water_mark: usize) {
        self.high_water_mark = high_water_mark;
    }

    pub fn set_compression_threshold(&mut self, threshold: usize) -> TransportResult<()> {
        let min_threshold = self.compression_type.min_threshold();
        if threshold < min_threshold {
            warn!("rejected compression threshold {} below {}", threshold, min_threshold);
            return Err(TransportError::InvalidArgument(format!("compression threshold must be at least {} for {:?}", min_threshold, self.compression_type)));
        }
        self.compression_threshold = threshold;
        Ok(())
    }

    /// Releases all queued frames and returns all blocks to the shared pool
    pub fn close(&mut self) {
        for frame in self.engine.drain_all() {
            self.release(frame);
        }
        self.big_buffers.clear();
        self.blocks.release_all(&self.shared);
    }
}

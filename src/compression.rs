use std::io;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
#[cfg(test)] use mockall::automock;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::debug;

/// Compression algorithms as they are numbered in the handshake
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default, TryFromPrimitive, IntoPrimitive)]
pub enum CompressionType {
    #[default]
    None = 0,
    Zlib = 1,
    Lz4 = 2,
}

impl CompressionType {
    /// Payloads smaller than this are never compressed
    pub fn min_threshold(self) -> usize {
        match self {
            CompressionType::None => 0,
            CompressionType::Zlib => ZlibCompressor::MIN_THRESHOLD,
            CompressionType::Lz4 => Lz4Compressor::MIN_THRESHOLD,
        }
    }

    /// the bit representing this type in a connection request's bitmap of supported types
    pub fn bitmap_bit(self) -> u8 {
        1 << u8::from(self)
    }

    /// An upper bound for the compressed size of `len` bytes
    pub fn max_compressed_len(self, len: usize) -> usize {
        match self {
            CompressionType::None => len,
            // zlib's compressBound, plus the sync flush marker and pending bits
            CompressionType::Zlib => len + (len >> 12) + (len >> 14) + (len >> 25) + 13 + 16,
            CompressionType::Lz4 => lz4_flex::block::get_maximum_output_size(len),
        }
    }

    /// The largest input that is guaranteed to compress into at most `room` bytes
    pub fn max_input_len(self, room: usize) -> usize {
        let overhead = self.max_compressed_len(room) - room;
        room.saturating_sub(overhead)
    }

    /// `level` is only relevant for zlib, with the usual range of 0 to 9
    pub fn new_compressor(self, level: u8) -> Option<Box<dyn Compressor>> {
        match self {
            CompressionType::None => None,
            CompressionType::Zlib => Some(Box::new(ZlibCompressor::new(level))),
            CompressionType::Lz4 => Some(Box::new(Lz4Compressor::new())),
        }
    }
}

/// A compression algorithm, with state for a single direction of a single channel: an instance
///  may keep history across calls, so all payloads of a direction must pass through the same
///  instance in the order in which they go over the wire.
#[cfg_attr(test, automock)]
pub trait Compressor: Send {
    fn compression_type(&self) -> CompressionType;

    /// Appends the compressed form of `src` to `dst`, returning the number of bytes appended
    fn compress(&mut self, src: &[u8], dst: &mut Vec<u8>) -> io::Result<usize>;

    /// Appends the decompressed form of `src` to `dst`, returning the number of bytes appended.
    ///  Fails if the decompressed data exceeds `max_len` bytes.
    fn decompress(&mut self, src: &[u8], dst: &mut Vec<u8>, max_len: usize) -> io::Result<usize>;
}

/// zlib with a persistent stream per direction and a sync flush after each payload, so each
///  frame can be decompressed as soon as it is received.
pub struct ZlibCompressor {
    deflate: Compress,
    inflate: Decompress,
}

impl ZlibCompressor {
    pub const MIN_THRESHOLD: usize = 30;

    pub fn new(level: u8) -> ZlibCompressor {
        debug!("initializing zlib compression with level {}", level);
        ZlibCompressor {
            deflate: Compress::new(Compression::new(level.min(9) as u32), true),
            inflate: Decompress::new(true),
        }
    }
}

fn invalid_data(e: impl std::error::Error + Send + Sync + 'static) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

impl Compressor for ZlibCompressor {
    fn compression_type(&self) -> CompressionType {
        CompressionType::Zlib
    }

    fn compress(&mut self, src: &[u8], dst: &mut Vec<u8>) -> io::Result<usize> {
        let initial_len = dst.len();
        let initial_in = self.deflate.total_in();

        loop {
            dst.reserve(src.len() / 2 + 64);
            let consumed = (self.deflate.total_in() - initial_in) as usize;
            self.deflate.compress_vec(&src[consumed..], dst, FlushCompress::Sync)
                .map_err(invalid_data)?;

            let consumed = (self.deflate.total_in() - initial_in) as usize;
            // output space left over means the flush is complete
            if consumed == src.len() && dst.len() < dst.capacity() {
                break;
            }
        }
        Ok(dst.len() - initial_len)
    }

    fn decompress(&mut self, src: &[u8], dst: &mut Vec<u8>, max_len: usize) -> io::Result<usize> {
        let initial_len = dst.len();
        let initial_in = self.inflate.total_in();

        loop {
            dst.reserve(src.len() * 2 + 64);
            let consumed = (self.inflate.total_in() - initial_in) as usize;
            let status = self.inflate.decompress_vec(&src[consumed..], dst, FlushDecompress::Sync)
                .map_err(invalid_data)?;

            if dst.len() - initial_len > max_len {
                return Err(io::Error::new(io::ErrorKind::InvalidData, format!("decompressed data exceeds {} bytes", max_len)));
            }

            let consumed = (self.inflate.total_in() - initial_in) as usize;
            if status == Status::StreamEnd || (consumed == src.len() && dst.len() < dst.capacity()) {
                break;
            }
        }
        Ok(dst.len() - initial_len)
    }
}

/// LZ4 block compression. Each payload is compressed independently.
pub struct Lz4Compressor {}

impl Lz4Compressor {
    pub const MIN_THRESHOLD: usize = 300;

    pub fn new() -> Lz4Compressor {
        Lz4Compressor {}
    }
}

impl Compressor for Lz4Compressor {
    fn compression_type(&self) -> CompressionType {
        CompressionType::Lz4
    }

    fn compress(&mut self, src: &[u8], dst: &mut Vec<u8>) -> io::Result<usize> {
        let compressed = lz4_flex::block::compress(src);
        dst.extend_from_slice(&compressed);
        Ok(compressed.len())
    }

    fn decompress(&mut self, src: &[u8], dst: &mut Vec<u8>, max_len: usize) -> io::Result<usize> {
        let decompressed = lz4_flex::block::decompress(src, max_len)
            .map_err(invalid_data)?;
        dst.extend_from_slice(&decompressed);
        Ok(decompressed.len())
    }
}

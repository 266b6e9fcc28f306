//! This is the channel transport engine of the RIPC session protocol: a connection object that
//!  performs the RIPC handshake over a stream socket (optionally tunneled through an HTTP proxy,
//!  optionally with a key exchange) and then exchanges length-prefixed, optionally packed,
//!  compressed and fragmented application messages.
//!
//! ## Design goals
//!
//! * The API is non-blocking and re-entrant: `init()`, `read()`, `write()` and `flush()` each do
//!   at most a bounded amount of socket I/O and report 'would block' / 'in progress' as values
//! * Buffer memory is bounded and reused. Outgoing messages are written into slices of
//!   fixed-size blocks, and a block goes back to its pool only after the last slice cut from it
//!   was flushed or released
//! * Priority: outgoing frames are queued per priority (high / medium / low) and drained in a
//!   configurable flush order, e.g. "HMHLHM"
//! * Messages larger than a single frame are fragmented transparently, and a fragmented write
//!   that runs out of buffers can be resumed where it stopped
//! * A channel can be driven from several threads: reads are serialized against each other, and
//!   so are writes. Callers that guarantee single-threaded access can opt out of locking
//!
//! ## Frame header
//!
//! All numbers in network byte order (BE):
//!
//! ```ascii
//! 0: length (u16) - total frame length *including* this header
//! 2: flags (u8):
//!    * 0x01 HAS_OPTIONAL_FLAGS - an extended flags byte follows the header
//!    * 0x02 DATA
//!    * 0x04 COMPRESSION - the payload is compressed
//!    * 0x08 COMP_FRAGMENT - compressed payload continues in the next frame
//!    * 0x10 PACKING - the payload is a sequence of packed messages
//! 3: payload
//! ```
//!
//! A frame consisting only of the header (length 3) is a ping.
//!
//! Packed payload:
//!
//! ```ascii
//! 0: message length (u16)
//! 2: message
//! *: message length (u16)
//! *: message
//! ...
//! ```
//!
//! A packed message length of 0 terminates the sequence.
//!
//! ## Fragmentation
//!
//! Messages that do not fit into a single frame are split. The first fragment carries the total
//!  (uncompressed) message length, all fragments carry a fragment id that is unique per channel
//!  among messages that are being sent:
//!
//! ```ascii
//! first fragment:
//! 0: frame header, flags HAS_OPTIONAL_FLAGS | DATA (| COMPRESSION)
//! 3: extended flags (u8): 0x01 FRAGMENT_HEADER
//! 4: total message length (u32)
//! 8: fragment id (u16 for RIPC 13 and later, u8 before that)
//! *: data
//!
//! continuation fragment:
//! 0: frame header, flags HAS_OPTIONAL_FLAGS | DATA (| COMPRESSION)
//! 3: extended flags (u8): 0x02 FRAGMENT
//! 4: fragment id (u16 / u8)
//! *: data
//! ```
//!
//! Compressed fragments are compressed one by one, each from a chunk small enough that the
//!  compressed data always fits into the fragment.
//!
//! ## Compression
//!
//! Compression (zlib or LZ4) is negotiated during the handshake. Only payloads at or above the
//!  compression threshold are compressed, and only for a single priority: the priority of the
//!  first compressed write. If compression makes a payload larger than a frame, the remainder
//!  is sent in a following frame:
//!
//! ```ascii
//! 0: frame header, flags COMPRESSION | COMP_FRAGMENT, first part of the compressed data
//! *: frame header, flags COMPRESSION, rest of the compressed data
//! ```
//!
//! ## Handshake
//!
//! The connector sends a ConnectReq with its preferred protocol version. If the acceptor does
//!  not understand that version, it closes the connection, and the connector reconnects and
//!  tries the next lower version. The acceptor answers with a ConnectAck (or a ConnectNak).
//!  For RIPC 14 with key exchange, the connector finally sends its public key in a ClientKey
//!  message. See [handshake::messages] for the message layouts.

pub mod buffers;
pub mod channel;
pub mod compression;
pub mod config;
pub mod error;
pub mod handshake;
pub mod locks;
pub mod read_state_machine;
pub mod ripc;
pub mod safe_converter;
pub mod socket;
pub mod write_engine;

#[cfg(test)] pub mod test_util;

pub use channel::Channel;
pub use error::{TransportError, TransportResult};

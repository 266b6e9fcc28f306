//! Buffer memory for outgoing messages.
//!
//! Outgoing messages are written into [transport_buffer::TransportBuffer]s. A regular transport
//!  buffer is a slice of a fixed-size block: each channel owns a number of 'guaranteed' blocks
//!  and cuts consecutive slices from its 'current' block ([socket_block::SocketBlocks]). A block
//!  is recycled only after every slice cut from it was returned. Blocks that are not needed by
//!  a channel live in a process-wide [shared_pool::SharedBlockPool].
//!
//! Messages that do not fit into a single frame are written into a big buffer
//!  ([big_buffer_pool::BigBufferPool]) and fragmented when they are written.

pub mod big_buffer_pool;
pub mod shared_pool;
pub mod socket_block;
pub mod transport_buffer;

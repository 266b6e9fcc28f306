//! The RIPC handshake, as a pair of re-entrant state machines: [connector::ConnectorHandshake]
//!  for channels that connect to a server, and [acceptor::AcceptorHandshake] for channels a
//!  server accepted. Each call to [Handshake::step] performs at most one non-blocking receive
//!  and one non-blocking send, and at most one state transition.

pub mod acceptor;
pub mod connector;
pub mod key_exchange;
pub mod messages;
pub mod proxy;

use std::io;
use std::io::IoSlice;
use std::mem;
use std::sync::Arc;
use bytes::{Buf, BytesMut};
use tokio::io::Interest;
use tracing::trace;
use crate::compression::CompressionType;
use crate::error::TransportResult;
use crate::handshake::messages::complete_frame_len;
use crate::ripc::{RipcVersion, SessionFlags};
use crate::socket::ChannelSocket;

const RECEIVE_CHUNK_SIZE: usize = 4096;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum InitState {
    /// connector: waiting for the connection to the server, then sending the ConnectReq
    Connecting,
    /// connector: waiting for the connection to the proxy, then sending the CONNECT request
    ProxyConnecting,
    ClientWaitProxyAck,
    WaitAck,
    /// connector: sending its public key. acceptor: waiting for the connector's public key.
    WaitClientKey,
    /// connector: the server closed the connection, try again with the next lower version
    Reconnecting,
    /// acceptor: waiting for the ConnectReq
    ReadHdr,
    /// acceptor: sending the ConnectAck
    Complete,
    Active,
    /// the handshake was rejected
    Inactive,
}

/// The parameters both sides agreed on
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Negotiated {
    pub version: RipcVersion,
    /// the largest frame payload either side sends
    pub max_user_msg_size: usize,
    pub ping_timeout: u8,
    pub session_flags: SessionFlags,
    pub protocol_type: u8,
    pub major_version: u8,
    pub minor_version: u8,
    pub compression_type: CompressionType,
    pub compression_level: u8,
    pub shared_key: Option<u64>,
    pub peer_component_version: String,
}

pub struct Established {
    pub negotiated: Negotiated,
    pub socket: Arc<dyn ChannelSocket>,
    /// bytes that were received after the last handshake message, i.e. the start of regular
    ///  traffic
    pub leftover: Vec<u8>,
}

pub enum HandshakeStatus {
    InProgress,
    Established(Established),
}

pub trait Handshake: Send {
    fn step(&mut self) -> TransportResult<HandshakeStatus>;

    fn init_state(&self) -> InitState;

    /// The socket to wait on between steps in blocking mode, together with the kind of readiness
    ///  the next step needs. `None` while a connection is being established.
    fn readiness(&self) -> Option<(Arc<dyn ChannelSocket>, Interest)>;

    /// Closes the socket, if any
    fn abort(&mut self);
}

enum Received {
    Data,
    WouldBlock,
    EndOfStream,
}

/// A connected socket with the handshake's buffers
struct HandshakeIo {
    socket: Arc<dyn ChannelSocket>,
    received: Vec<u8>,
    out: BytesMut,
}

impl HandshakeIo {
    fn new(socket: Arc<dyn ChannelSocket>) -> HandshakeIo {
        HandshakeIo {
            socket,
            received: Vec::new(),
            out: BytesMut::new(),
        }
    }

    fn has_pending_out(&self) -> bool {
        !self.out.is_empty()
    }

    /// Returns `true` once everything queued for sending was written
    fn send_pending(&mut self) -> io::Result<bool> {
        if self.out.is_empty() {
            return Ok(true);
        }

        match self.socket.send(&[IoSlice::new(&self.out)]) {
            Ok(n) => {
                trace!("sent {} of {} handshake bytes", n, self.out.len());
                self.out.advance(n);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
        Ok(self.out.is_empty())
    }

    fn receive(&mut self) -> io::Result<Received> {
        let mut chunk = [0u8; RECEIVE_CHUNK_SIZE];
        match self.socket.receive(&mut chunk) {
            Ok(0) => Ok(Received::EndOfStream),
            Ok(n) => {
                trace!("received {} handshake bytes", n);
                self.received.extend_from_slice(&chunk[..n]);
                Ok(Received::Data)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => Ok(Received::WouldBlock),
            Err(e) => Err(e),
        }
    }

    /// Removes the first frame from the received bytes if it is complete
    fn take_frame(&mut self) -> Option<Vec<u8>> {
        let len = complete_frame_len(&self.received)?;
        Some(self.received.drain(..len).collect())
    }

    fn take_leftover(&mut self) -> Vec<u8> {
        mem::take(&mut self.received)
    }

    fn interest(&self) -> Interest {
        if self.has_pending_out() {
            Interest::WRITABLE
        }
        else {
            Interest::READABLE
        }
    }
}

//! The channel façade: a single RIPC connection with its handshake, read framing, priority
//!  queues and buffer memory.
//!
//! A channel starts out `Initializing`. The application drives the handshake by calling
//!  [Channel::init] until it reports [InitOutcome::Active] (or [Channel::init_blocking] in an
//!  async context), and then exchanges messages:
//!
//! * [Channel::get_buffer] hands out a buffer, which the application fills and passes to
//!   [Channel::write] (or returns through [Channel::release_buffer])
//! * written messages are queued per priority and go to the socket on [Channel::flush], or
//!   implicitly when the queued bytes exceed the high water mark
//! * [Channel::read] returns one message at a time
//!
//! Failures of the connection close the channel. Misuse is reported as
//!  [TransportError::InvalidArgument] and leaves the channel unchanged. Writing or releasing a
//!  buffer that belongs to another channel fails with [TransportError::NotOwned], which hands
//!  the buffer back.

mod output;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::{debug, error, info, trace, warn};
use crate::buffers::shared_pool::SharedBlockPool;
use crate::buffers::transport_buffer::{ChannelId, TransportBuffer};
use crate::compression::CompressionType;
use crate::config::{AcceptConfig, ChannelConfig, ConnectConfig};
use crate::error::{TransportError, TransportResult};
use crate::handshake::acceptor::AcceptorHandshake;
use crate::handshake::connector::ConnectorHandshake;
use crate::handshake::proxy::{NoAuthentication, ProxyAuthenticator};
use crate::handshake::{Established, Handshake, HandshakeStatus, InitState, Negotiated};
use crate::locks::{LockCell, LockingStrategy, RealLocks};
use crate::read_state_machine::{ReadFramingStateMachine, ReadOutcome};
use crate::ripc::{RipcVersion, SessionFlags, HEADER_LEN};
use crate::socket::{ChannelSocket, SocketConnector};
use crate::write_engine::Priority;

use output::ChannelOutput;
pub use output::{PausedWrite, WriteFlags, WriteOutcome};

const NOT_OWNED: &str = "Application does not own this buffer.";

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum ChannelState {
    /// the handshake failed
    Inactive = 0,
    Initializing = 1,
    Active = 2,
    Closed = 3,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum InitOutcome {
    InProgress,
    Active,
}

/// Tuning of an active channel. Each code carries the new value.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum IoctlCode {
    PriorityFlushOrder(String),
    MaxNumBuffers(usize),
    NumGuaranteedBuffers(usize),
    HighWaterMark(usize),
    SystemWriteBuffers(usize),
    SystemReadBuffers(usize),
    CompressionThreshold(usize),
}

/// The parameters of an active channel, as negotiated in the handshake and adjusted through
///  [Channel::ioctl]
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ChannelInfo {
    /// the largest message that is sent in a single frame
    pub max_fragment_size: usize,
    pub max_output_buffers: usize,
    pub guaranteed_output_buffers: usize,
    pub ping_timeout: u8,
    pub client_to_server_pings: bool,
    pub server_to_client_pings: bool,
    pub compression_type: CompressionType,
    pub compression_threshold: usize,
    pub protocol_type: u8,
    pub major_version: u8,
    pub minor_version: u8,
    pub ripc_version: RipcVersion,
    pub shared_key: Option<u64>,
    pub peer_component_version: String,
    pub priority_flush_order: String,
}

/// A buffer that a channel refused because another channel handed it out
#[derive(Debug)]
pub enum RejectedBuffer {
    Buffer(TransportBuffer),
    /// the remainder of a fragmented write, which can be resumed on the owning channel
    PausedWrite(PausedWrite),
}

impl RejectedBuffer {
    pub fn into_buffer(self) -> TransportBuffer {
        match self {
            RejectedBuffer::Buffer(buffer) => buffer,
            RejectedBuffer::PausedWrite(paused) => paused.into_buffer(),
        }
    }
}

fn not_owned(rejected: RejectedBuffer) -> TransportError {
    TransportError::NotOwned(Box::new(rejected))
}

struct ReadSide {
    socket: Option<Arc<dyn ChannelSocket>>,
    framing: Option<ReadFramingStateMachine>,
}

struct WriteSide {
    socket: Option<Arc<dyn ChannelSocket>>,
    handshake: Option<Box<dyn Handshake>>,
    output: Option<ChannelOutput>,
    negotiated: Option<Negotiated>,
    config: ChannelConfig,
    shared: Arc<SharedBlockPool>,
}

/// A RIPC channel. All operations are non-blocking, and they can be called from several threads
///  concurrently: reads are serialized by the read side's lock, everything else by the write
///  side's lock. `init()` and `close()` take both, read side first.
///
/// With `L = NoLocks`, the channel is not `Sync`, and the locks are replaced by `RefCell`s.
pub struct Channel<L: LockingStrategy = RealLocks> {
    id: ChannelId,
    is_server: bool,
    state: AtomicU8,
    read_side: L::Cell<ReadSide>,
    write_side: L::Cell<WriteSide>,
}

impl <L: LockingStrategy> Channel<L> {
    /// Starts connecting to the server in `config`. The connection is established by calling
    ///  [Channel::init].
    pub fn connect(config: ConnectConfig, connector: Arc<dyn SocketConnector>, shared: Arc<SharedBlockPool>) -> TransportResult<Channel<L>> {
        Self::connect_with_authenticator(config, connector, Box::new(NoAuthentication::new()), shared)
    }

    pub fn connect_with_authenticator(config: ConnectConfig, connector: Arc<dyn SocketConnector>, authenticator: Box<dyn ProxyAuthenticator>, shared: Arc<SharedBlockPool>) -> TransportResult<Channel<L>> {
        let channel_config = config.channel.clone();
        let handshake = ConnectorHandshake::new(config, connector, authenticator)
            .map_err(|e| TransportError::InvalidArgument(format!("{:#}", e)))?;
        Ok(Self::new(Box::new(handshake), None, channel_config, shared, false))
    }

    /// A server side channel for a connection that was accepted. Server channels borrow blocks
    ///  from the shared pool once their guaranteed blocks are in use.
    pub fn accept(socket: Arc<dyn ChannelSocket>, config: AcceptConfig, shared: Arc<SharedBlockPool>) -> TransportResult<Channel<L>> {
        let channel_config = config.channel.clone();
        let handshake = AcceptorHandshake::new(socket.clone(), config)
            .map_err(|e| TransportError::InvalidArgument(format!("{:#}", e)))?;
        Ok(Self::new(Box::new(handshake), Some(socket), channel_config, shared, true))
    }

    fn new(handshake: Box<dyn Handshake>, socket: Option<Arc<dyn ChannelSocket>>, config: ChannelConfig, shared: Arc<SharedBlockPool>, is_server: bool) -> Channel<L> {
        let id = ChannelId::next();
        debug!("new {} channel {:?}", if is_server { "server" } else { "client" }, id);
        Channel {
            id,
            is_server,
            state: AtomicU8::new(ChannelState::Initializing.into()),
            read_side: LockCell::new(ReadSide {
                socket: None,
                framing: None,
            }),
            write_side: LockCell::new(WriteSide {
                socket,
                handshake: Some(handshake),
                output: None,
                negotiated: None,
                config,
                shared,
            }),
        }
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::try_from(self.state.load(Ordering::Acquire))
            .unwrap_or(ChannelState::Closed)
    }

    pub fn init_state(&self) -> InitState {
        match self.state() {
            ChannelState::Active => InitState::Active,
            ChannelState::Initializing => self.write_side.lock().handshake.as_ref()
                .map(|h| h.init_state())
                .unwrap_or(InitState::Inactive),
            ChannelState::Inactive | ChannelState::Closed => InitState::Inactive,
        }
    }

    pub fn is_server(&self) -> bool {
        self.is_server
    }

    /// Performs the next step of the handshake. This is re-entrant: it returns
    ///  [InitOutcome::InProgress] whenever the handshake waits for the socket.
    ///
    /// If the handshake fails, the channel becomes `Inactive` and its resources are released.
    pub fn init(&self) -> TransportResult<InitOutcome> {
        let mut read_side = self.read_side.lock();
        let mut write_side = self.write_side.lock();

        match self.state() {
            ChannelState::Active => return Ok(InitOutcome::Active),
            ChannelState::Initializing => {}
            state => return Err(TransportError::failure(format!("socket channel is {:?}, it can not be initialized", state))),
        }

        let status = match write_side.handshake.as_mut() {
            Some(handshake) => handshake.step(),
            None => Err(TransportError::failure("socket channel has no handshake in progress")),
        };

        match status {
            Ok(HandshakeStatus::InProgress) => Ok(InitOutcome::InProgress),
            Ok(HandshakeStatus::Established(established)) => {
                match self.activate(&mut read_side, &mut write_side, established) {
                    Ok(()) => Ok(InitOutcome::Active),
                    Err(e) => {
                        self.deactivate(&mut read_side, &mut write_side, &e);
                        Err(e)
                    }
                }
            }
            Err(e) => {
                self.deactivate(&mut read_side, &mut write_side, &e);
                Err(e)
            }
        }
    }

    fn activate(&self, read_side: &mut ReadSide, write_side: &mut WriteSide, established: Established) -> TransportResult<()> {
        let Established { negotiated, socket, leftover } = established;

        let internal_max = negotiated.max_user_msg_size + HEADER_LEN;
        let decompressor = negotiated.compression_type.new_compressor(negotiated.compression_level);
        let mut framing = ReadFramingStateMachine::new(internal_max, negotiated.version, decompressor);
        framing.put_back(&leftover)?;

        let output = ChannelOutput::new(self.id, &negotiated, &write_side.config, write_side.shared.clone(), self.is_server)?;

        if let Some(size) = write_side.config.sys_send_buffer_size {
            if let Err(e) = socket.set_send_buffer_size(size) {
                warn!("error setting system send buffer size to {}: {}", size, e);
            }
        }

        info!("channel {:?} is active: RIPC {:?}, max message size {}, compression {:?}, ping timeout {}",
            self.id, negotiated.version, negotiated.max_user_msg_size, negotiated.compression_type, negotiated.ping_timeout);

        read_side.socket = Some(socket.clone());
        read_side.framing = Some(framing);
        write_side.socket = Some(socket);
        write_side.handshake = None;
        write_side.output = Some(output);
        write_side.negotiated = Some(negotiated);
        self.state.store(ChannelState::Active.into(), Ordering::Release);
        Ok(())
    }

    fn deactivate(&self, read_side: &mut ReadSide, write_side: &mut WriteSide, e: &TransportError) {
        error!("handshake of channel {:?} failed: {}", self.id, e);
        if let Some(mut handshake) = write_side.handshake.take() {
            handshake.abort();
        }
        if let Some(socket) = write_side.socket.take() {
            let _ = socket.shutdown();
        }
        read_side.socket = None;
        read_side.framing = None;
        self.state.store(ChannelState::Inactive.into(), Ordering::Release);
    }

    /// Loops [Channel::init] until the channel is active, waiting for the socket between steps
    pub async fn init_blocking(&self) -> TransportResult<()> {
        loop {
            if self.init()? == InitOutcome::Active {
                return Ok(());
            }

            let readiness = self.write_side.lock().handshake.as_ref()
                .and_then(|h| h.readiness());
            match readiness {
                Some((socket, interest)) => socket.wait_ready(interest).await?,
                // the connection is being established
                None => tokio::time::sleep(Duration::from_millis(1)).await,
            }
        }
    }

    /// Reads the next message. Returns [ReadOutcome::ReadInProgress] if another thread is
    ///  reading. A failure closes the channel.
    pub fn read(&self) -> TransportResult<ReadOutcome> {
        let Some(mut read_side) = self.read_side.try_lock() else {
            return Ok(ReadOutcome::ReadInProgress);
        };
        if self.state() != ChannelState::Active {
            return Err(TransportError::failure("socket channel is not in the active state for read"));
        }

        let read_side_ref = &mut *read_side;
        let result = match (read_side_ref.socket.as_deref(), read_side_ref.framing.as_mut()) {
            (Some(socket), Some(framing)) => framing.read(|buf| socket.receive(buf)),
            _ => return Err(TransportError::failure("socket channel is not in the active state for read")),
        };
        drop(read_side);

        if let Err(e) = &result {
            error!("read on channel {:?} failed: {}", self.id, e);
            self.close();
        }
        result
    }

    /// Runs an operation on the write side of an active channel. Connection failures reported
    ///  by the operation close the channel.
    fn with_output<T>(&self, op: &str, f: impl FnOnce(&mut ChannelOutput, &dyn ChannelSocket) -> TransportResult<T>) -> TransportResult<T> {
        let mut write_side = self.write_side.lock();
        let write_side_ref = &mut *write_side;
        let (output, socket) = match (self.state(), write_side_ref.output.as_mut(), write_side_ref.socket.as_deref()) {
            (ChannelState::Active, Some(output), Some(socket)) => (output, socket),
            _ => return Err(TransportError::failure(format!("socket channel is not in active state for {}", op))),
        };

        let result = f(output, socket);
        drop(write_side);

        if let Err(e) = &result {
            if matches!(e, TransportError::Failure(_) | TransportError::WriteFlushFailed(_) | TransportError::Io(_)) {
                error!("{} on channel {:?} failed: {}", op, self.id, e);
                self.close();
            }
        }
        result
    }

    /// Returns a buffer for a message of `size` bytes. Messages that do not fit into a single
    ///  frame are fragmented when they are written; packed buffers must fit into a single frame.
    pub fn get_buffer(&self, size: usize, packed: bool) -> TransportResult<TransportBuffer> {
        self.with_output("getBuffer", |output, socket| output.get_buffer(size, packed, socket))
    }

    pub fn release_buffer(&self, buffer: TransportBuffer) -> TransportResult<()> {
        if buffer.owner() != self.id {
            return Err(not_owned(RejectedBuffer::Buffer(buffer)));
        }
        match self.write_side.lock().output.as_mut() {
            Some(output) => output.release(buffer),
            None => trace!("dropping buffer of inactive channel {:?}", self.id),
        }
        Ok(())
    }

    /// Closes the current message in a packed buffer and starts the next one. Returns the space
    ///  that is left for the next message.
    pub fn pack_buffer(&self, buffer: &mut TransportBuffer) -> TransportResult<usize> {
        if buffer.owner() != self.id {
            return Err(TransportError::InvalidArgument(NOT_OWNED.to_string()));
        }
        if !buffer.is_packed() {
            return Err(TransportError::InvalidArgument("buffer was not requested as a packed buffer".to_string()));
        }
        Ok(buffer.pack())
    }

    /// Queues a message, flushing if it was requested or if the high water mark is exceeded.
    ///  The buffer passes to the channel unless it belongs to another channel.
    pub fn write(&self, buffer: TransportBuffer, priority: Priority, flags: WriteFlags) -> TransportResult<WriteOutcome> {
        if buffer.owner() != self.id {
            return Err(not_owned(RejectedBuffer::Buffer(buffer)));
        }

        self.with_output("write", |output, socket| {
            if buffer.pending_payload_len() == 0 {
                output.release(buffer);
                return Err(TransportError::InvalidArgument("Encoded buffer of length zero cannot be written".to_string()));
            }
            output.write(buffer, priority, flags, socket)
        })
    }

    /// Continues a fragmented write that returned [WriteOutcome::CallAgain]
    pub fn resume_write(&self, paused: PausedWrite) -> TransportResult<WriteOutcome> {
        if paused.buffer().owner() != self.id {
            return Err(not_owned(RejectedBuffer::PausedWrite(paused)));
        }
        self.with_output("write", |output, socket| output.resume(paused, socket))
    }

    /// Returns the number of bytes that remain queued
    pub fn flush(&self) -> TransportResult<usize> {
        self.with_output("flush", |output, socket| Ok(output.flush(socket)?))
    }

    /// Sends a ping, or flushes queued data which keeps the connection alive just as well.
    ///  Returns the number of bytes that remain queued.
    pub fn ping(&self) -> TransportResult<usize> {
        self.with_output("ping", |output, socket| Ok(output.ping(socket)?))
    }

    /// Number of output blocks in use
    pub fn buffer_usage(&self) -> TransportResult<usize> {
        match self.state() {
            ChannelState::Active => Ok(self.write_side.lock().output.as_ref()
                .map(|output| output.buffer_usage())
                .unwrap_or(0)),
            ChannelState::Closed => Ok(0),
            _ => Err(TransportError::failure("socket channel is not in active state for bufferUsage")),
        }
    }

    /// Applies a setting to an active channel. Returns the effective value for buffer counts,
    ///  and 0 otherwise. An invalid value leaves the channel unchanged.
    pub fn ioctl(&self, code: IoctlCode) -> TransportResult<usize> {
        let mut write_side = self.write_side.lock();
        let write_side_ref = &mut *write_side;
        let (output, socket) = match (self.state(), write_side_ref.output.as_mut(), write_side_ref.socket.as_deref()) {
            (ChannelState::Active, Some(output), Some(socket)) => (output, socket),
            _ => return Err(TransportError::failure("socket channel is not in active state for ioctl")),
        };

        debug!("ioctl {:?} on channel {:?}", code, self.id);
        match code {
            IoctlCode::PriorityFlushOrder(flush_order) => {
                output.set_flush_order(&flush_order)?;
                Ok(0)
            }
            IoctlCode::MaxNumBuffers(max) => Ok(output.set_max_buffers(max)),
            IoctlCode::NumGuaranteedBuffers(num) => Ok(output.set_guaranteed_buffers(num)),
            IoctlCode::HighWaterMark(high_water_mark) => {
                output.set_high_water_mark(high_water_mark);
                Ok(0)
            }
            IoctlCode::SystemWriteBuffers(size) => {
                socket.set_send_buffer_size(size)
                    .map_err(|e| TransportError::InvalidArgument(format!("error setting system send buffer size: {}", e)))?;
                Ok(0)
            }
            IoctlCode::SystemReadBuffers(size) => {
                socket.set_recv_buffer_size(size)
                    .map_err(|e| TransportError::InvalidArgument(format!("error setting system receive buffer size: {}", e)))?;
                Ok(0)
            }
            IoctlCode::CompressionThreshold(threshold) => {
                output.set_compression_threshold(threshold)?;
                Ok(0)
            }
        }
    }

    pub fn info(&self) -> TransportResult<ChannelInfo> {
        let write_side = self.write_side.lock();
        let (Some(output), Some(negotiated), ChannelState::Active) = (write_side.output.as_ref(), write_side.negotiated.as_ref(), self.state()) else {
            return Err(TransportError::failure("socket channel is not in active state for info"));
        };

        Ok(ChannelInfo {
            max_fragment_size: output.max_fragment_size(),
            max_output_buffers: output.max_buffers(),
            guaranteed_output_buffers: output.guaranteed_buffers(),
            ping_timeout: negotiated.ping_timeout,
            client_to_server_pings: negotiated.session_flags.contains(SessionFlags::CLIENT_TO_SERVER_PING),
            server_to_client_pings: negotiated.session_flags.contains(SessionFlags::SERVER_TO_CLIENT_PING),
            compression_type: negotiated.compression_type,
            compression_threshold: output.compression_threshold(),
            protocol_type: negotiated.protocol_type,
            major_version: negotiated.major_version,
            minor_version: negotiated.minor_version,
            ripc_version: negotiated.version,
            shared_key: negotiated.shared_key,
            peer_component_version: negotiated.peer_component_version.clone(),
            priority_flush_order: output.flush_order(),
        })
    }

    /// Closes the socket and returns all buffer memory. Buffers the application still holds are
    ///  freed when they are dropped. Closing a closed channel does nothing.
    pub fn close(&self) {
        let previous = self.state.swap(ChannelState::Closed.into(), Ordering::AcqRel);
        if previous == u8::from(ChannelState::Closed) {
            debug!("channel {:?} is closed already", self.id);
            return;
        }

        let mut read_side = self.read_side.lock();
        let mut write_side = self.write_side.lock();

        read_side.framing = None;
        read_side.socket = None;
        if let Some(mut handshake) = write_side.handshake.take() {
            handshake.abort();
        }
        if let Some(mut output) = write_side.output.take() {
            output.close();
        }
        if let Some(socket) = write_side.socket.take() {
            if let Err(e) = socket.shutdown() {
                debug!("error shutting down socket of channel {:?}: {}", self.id, e);
            }
        }
        info!("channel {:?} closed", self.id);
    }
}

use std::sync::Arc;
use bytes::BytesMut;
use tokio::io::Interest;
use tracing::{debug, info, warn};
use crate::compression::CompressionType;
use crate::config::AcceptConfig;
use crate::error::{TransportError, TransportResult};
use crate::handshake::{Established, Handshake, HandshakeIo, HandshakeStatus, InitState, Negotiated, Received};
use crate::handshake::key_exchange::{KeyPair, DEFAULT_G, DEFAULT_P};
use crate::handshake::messages::{ClientKey, ConnectAck, ConnectNak, ConnectReq, KeyInfo, CONNECTION_REFUSED};
use crate::ripc::{RipcVersion, SessionFlags};
use crate::safe_converter::PrecheckedCast;
use crate::socket::ChannelSocket;

/// The server side of the handshake.
///
/// ```ascii
/// ReadHdr [-> WaitClientKey] -> Complete -> Active
/// ```
///
/// A ConnectReq for an unknown version is answered by closing the connection, so the client
///  can retry with an older version. A ConnectReq for a different protocol type is refused with
///  a ConnectNak. Either way, the handshake ends in `Inactive`.
pub struct AcceptorHandshake {
    config: AcceptConfig,
    state: InitState,
    io: Option<HandshakeIo>,
    key_pair: Option<KeyPair>,
    negotiated: Option<Negotiated>,
}

impl AcceptorHandshake {
    pub fn new(socket: Arc<dyn ChannelSocket>, config: AcceptConfig) -> anyhow::Result<AcceptorHandshake> {
        config.validate()?;
        if let Some(size) = config.channel.sys_recv_buffer_size {
            if let Err(e) = socket.set_recv_buffer_size(size) {
                warn!("error setting receive buffer size {}: {}", size, e);
            }
        }

        Ok(AcceptorHandshake {
            config,
            state: InitState::ReadHdr,
            io: Some(HandshakeIo::new(socket)),
            key_pair: None,
            negotiated: None,
        })
    }

    fn io(&mut self) -> TransportResult<&mut HandshakeIo> {
        self.io.as_mut()
            .ok_or_else(|| TransportError::failure("no connection"))
    }

    fn do_step(&mut self) -> TransportResult<HandshakeStatus> {
        match self.state {
            InitState::ReadHdr => self.step_read_hdr(),
            InitState::WaitClientKey => self.step_wait_client_key(),
            InitState::Complete => {
                if !self.io()?.send_pending()? {
                    return Ok(HandshakeStatus::InProgress);
                }
                self.establish()
            }
            other => Err(TransportError::failure(format!("no handshake in progress: {:?}", other))),
        }
    }

    fn step_read_hdr(&mut self) -> TransportResult<HandshakeStatus> {
        let io = self.io()?;
        if let Received::EndOfStream = io.receive()? {
            return Err(TransportError::failure("client closed the connection during the handshake"));
        }
        let Some(frame) = io.take_frame() else {
            return Ok(HandshakeStatus::InProgress);
        };

        let connection_version = ConnectReq::peek_connection_version(&frame)
            .ok_or_else(|| TransportError::failure("ConnectReq is too short"))?;
        if RipcVersion::from_connection_version(connection_version).is_none() {
            debug!("unsupported connection version {:#x}, closing the connection", connection_version);
            return Err(TransportError::failure(format!("unsupported connection version {:#x}", connection_version)));
        }

        let req = ConnectReq::deser(&frame)?;
        debug!("received ConnectReq for {:?} from {} ({})", req.version, req.host_name, req.ip_address);

        if req.version.has_protocol_type() && req.protocol_type != self.config.identity.protocol_type {
            let mut buf = BytesMut::new();
            ConnectNak { text: CONNECTION_REFUSED.to_string() }.ser(&mut buf);
            let io = self.io()?;
            io.out.extend_from_slice(&buf);
            io.send_pending()?;
            return Err(TransportError::failure(format!("protocol type mismatch: client {}, server {}", req.protocol_type, self.config.identity.protocol_type)));
        }

        self.accept(req)
    }

    fn accept(&mut self, req: ConnectReq) -> TransportResult<HandshakeStatus> {
        let ping_timeout = req.ping_timeout.clamp(self.config.min_ping_timeout, self.config.ping_timeout);
        let major_version = req.major_version.min(self.config.identity.major_version);
        let minor_version = req.minor_version.min(self.config.identity.minor_version);
        let session_flags = SessionFlags::CLIENT_TO_SERVER_PING | SessionFlags::SERVER_TO_CLIENT_PING;

        let server_type = self.config.channel.compression_type;
        let (compression_type, compression_level) = if server_type != CompressionType::None
            && (req.compression_bitmap & server_type.bitmap_bit() != 0 || self.config.force_compression)
        {
            (server_type, self.config.channel.compression_level)
        }
        else {
            (CompressionType::None, 0)
        };

        let key_info = if req.version.has_key_exchange() && req.key_exchange && self.config.key_exchange {
            let key_pair = KeyPair::generate(DEFAULT_P, DEFAULT_G);
            let key_info = KeyInfo { p: DEFAULT_P, g: DEFAULT_G, public_key: key_pair.public_key() };
            self.key_pair = Some(key_pair);
            Some(key_info)
        }
        else {
            None
        };

        let ack = ConnectAck {
            version: req.version,
            max_user_msg_size: self.config.max_user_msg_size.prechecked_cast(),
            session_flags,
            ping_timeout,
            major_version,
            minor_version,
            compression_type,
            compression_level,
            key_info,
            component_version: self.config.identity.component_version.clone(),
        };
        let mut buf = BytesMut::new();
        ack.ser(&mut buf);
        let io = self.io()?;
        io.out.extend_from_slice(&buf);
        io.send_pending()?;

        self.negotiated = Some(Negotiated {
            version: req.version,
            max_user_msg_size: self.config.max_user_msg_size,
            ping_timeout,
            session_flags,
            protocol_type: self.config.identity.protocol_type,
            major_version,
            minor_version,
            compression_type,
            compression_level,
            shared_key: None,
            peer_component_version: req.component_version,
        });

        self.state = if self.key_pair.is_some() { InitState::WaitClientKey } else { InitState::Complete };
        debug!("sent ConnectAck, now in state {:?}", self.state);
        Ok(HandshakeStatus::InProgress)
    }

    fn step_wait_client_key(&mut self) -> TransportResult<HandshakeStatus> {
        let io = self.io()?;
        if !io.send_pending()? {
            return Ok(HandshakeStatus::InProgress);
        }
        if let Received::EndOfStream = io.receive()? {
            return Err(TransportError::failure("client closed the connection during the key exchange"));
        }
        let Some(frame) = io.take_frame() else {
            return Ok(HandshakeStatus::InProgress);
        };

        let client_key = ClientKey::deser(&frame)?;
        let shared_key = self.key_pair.as_ref()
            .map(|key_pair| key_pair.shared_key(client_key.public_key));
        if let Some(negotiated) = &mut self.negotiated {
            negotiated.shared_key = shared_key;
        }
        self.establish()
    }

    fn establish(&mut self) -> TransportResult<HandshakeStatus> {
        let negotiated = self.negotiated.take()
            .ok_or_else(|| TransportError::failure("no negotiated parameters"))?;
        let mut io = self.io.take()
            .ok_or_else(|| TransportError::failure("no connection"))?;
        self.state = InitState::Active;
        info!("accepted connection with {:?}, compression {:?}", negotiated.version, negotiated.compression_type);

        Ok(HandshakeStatus::Established(Established {
            negotiated,
            leftover: io.take_leftover(),
            socket: io.socket,
        }))
    }
}

impl Handshake for AcceptorHandshake {
    fn step(&mut self) -> TransportResult<HandshakeStatus> {
        let result = self.do_step();
        if let Err(e) = &result {
            debug!("handshake failed in state {:?}: {}", self.state, e);
            self.abort();
        }
        result
    }

    fn init_state(&self) -> InitState {
        self.state
    }

    fn readiness(&self) -> Option<(Arc<dyn ChannelSocket>, Interest)> {
        self.io.as_ref()
            .map(|io| (io.socket.clone(), io.interest()))
    }

    fn abort(&mut self) {
        if let Some(io) = self.io.take() {
            let _ = io.socket.shutdown();
        }
        if self.state != InitState::Active {
            self.state = InitState::Inactive;
        }
    }
}

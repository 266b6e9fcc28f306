use std::collections::VecDeque;
use std::sync::Arc;
use anyhow::bail;
use bytes::BytesMut;
use tokio::io::Interest;
use tracing::{debug, info, warn};
use crate::compression::CompressionType;
use crate::config::{AcceptConfig, ConnectConfig};
use crate::error::{TransportError, TransportResult};
use crate::handshake::{Established, Handshake, HandshakeIo, HandshakeStatus, InitState, Negotiated, Received};
use crate::handshake::key_exchange::KeyPair;
use crate::handshake::messages::{ClientKey, ConnectAck, ConnectReply, ConnectReq};
use crate::handshake::proxy::{connect_request, ProxyAuthError, ProxyAuthenticator, ProxyResponseAccumulator};
use crate::ripc::{RipcVersion, SessionFlags};
use crate::safe_converter::SafeCast;
use crate::socket::{ChannelSocket, PendingConnect, SocketConnector};

/// The client side of the handshake.
///
/// ```ascii
/// [ProxyConnecting -> ClientWaitProxyAck ->] Connecting -> WaitAck [-> WaitClientKey] -> Active
/// ```
///
/// If the server closes the connection while the connector waits for the ConnectAck, the
///  server does not speak the requested version: the connector moves to `Reconnecting`, opens a
///  new connection and starts over with the next lower version.
pub struct ConnectorHandshake {
    config: ConnectConfig,
    connector: Arc<dyn SocketConnector>,
    authenticator: Box<dyn ProxyAuthenticator>,
    state: InitState,
    version: RipcVersion,
    fallback_versions: VecDeque<RipcVersion>,
    pending_connect: Option<PendingConnect>,
    io: Option<HandshakeIo>,
    proxy_response: ProxyResponseAccumulator,
    proxy_authorization: Option<String>,
    num_ignored_proxy_responses: usize,
    /// negotiated parameters while the ClientKey is being sent
    negotiated: Option<Negotiated>,
}

impl ConnectorHandshake {
    pub fn new(config: ConnectConfig, connector: Arc<dyn SocketConnector>, authenticator: Box<dyn ProxyAuthenticator>) -> anyhow::Result<ConnectorHandshake> {
        config.validate()?;
        let mut fallback_versions: VecDeque<RipcVersion> = config.supported_versions.iter().copied().collect();
        let Some(version) = fallback_versions.pop_front() else {
            bail!("at least one RIPC version must be supported");
        };

        let mut result = ConnectorHandshake {
            config,
            connector,
            authenticator,
            state: InitState::Connecting,
            version,
            fallback_versions,
            pending_connect: None,
            io: None,
            proxy_response: ProxyResponseAccumulator::default(),
            proxy_authorization: None,
            num_ignored_proxy_responses: 0,
            negotiated: None,
        };
        result.start_connect();
        Ok(result)
    }

    /// the version that is currently being requested
    pub fn version(&self) -> RipcVersion {
        self.version
    }

    /// Opens a new connection, either to the server or to the proxy, closing the current one
    fn start_connect(&mut self) {
        if let Some(io) = self.io.take() {
            let _ = io.socket.shutdown();
        }

        let (host, port, state) = match &self.config.proxy {
            Some(proxy) => (proxy.host.as_str(), proxy.port, InitState::ProxyConnecting),
            None => (self.config.host.as_str(), self.config.port, InitState::Connecting),
        };
        debug!("connecting to {}:{} for {:?}", host, port, self.version);
        self.pending_connect = Some(self.connector.connect(host, port));
        self.state = state;
    }

    /// Returns `true` once the connection is established
    fn poll_connect(&mut self) -> TransportResult<bool> {
        let Some(pending) = &mut self.pending_connect else {
            return Ok(self.io.is_some());
        };

        match pending.try_complete() {
            None => Ok(false),
            Some(Err(e)) => {
                self.pending_connect = None;
                Err(TransportError::failure(format!("connecting to {}:{} failed: {}", self.config.host, self.config.port, e)))
            }
            Some(Ok(socket)) => {
                self.pending_connect = None;
                let socket: Arc<dyn ChannelSocket> = Arc::from(socket);
                if let Some(size) = self.config.channel.sys_recv_buffer_size {
                    if let Err(e) = socket.set_recv_buffer_size(size) {
                        warn!("error setting receive buffer size {}: {}", size, e);
                    }
                }
                self.io = Some(HandshakeIo::new(socket));
                Ok(true)
            }
        }
    }

    fn io(&mut self) -> TransportResult<&mut HandshakeIo> {
        self.io.as_mut()
            .ok_or_else(|| TransportError::failure("no connection"))
    }

    fn do_step(&mut self) -> TransportResult<HandshakeStatus> {
        match self.state {
            InitState::ProxyConnecting => self.step_proxy_connecting(),
            InitState::ClientWaitProxyAck => self.step_wait_proxy_ack(),
            InitState::Connecting => self.step_connecting(),
            InitState::WaitAck => self.step_wait_ack(),
            InitState::WaitClientKey => self.step_send_client_key(),
            InitState::Reconnecting => {
                self.start_connect();
                Ok(HandshakeStatus::InProgress)
            }
            other => Err(TransportError::failure(format!("no handshake in progress: {:?}", other))),
        }
    }

    fn step_proxy_connecting(&mut self) -> TransportResult<HandshakeStatus> {
        if !self.poll_connect()? {
            return Ok(HandshakeStatus::InProgress);
        }

        debug!("connected to proxy, requesting tunnel to {}:{}", self.config.host, self.config.port);
        self.proxy_response.clear();
        self.send_proxy_request()?;
        self.state = InitState::ClientWaitProxyAck;
        Ok(HandshakeStatus::InProgress)
    }

    fn send_proxy_request(&mut self) -> TransportResult<()> {
        let request = connect_request(&self.config.host, self.config.port, &self.config.user_agent, self.proxy_authorization.as_deref());
        let io = self.io()?;
        io.out.extend_from_slice(request.as_bytes());
        io.send_pending()?;
        Ok(())
    }

    fn step_wait_proxy_ack(&mut self) -> TransportResult<HandshakeStatus> {
        let io = self.io()?;
        if !io.send_pending()? {
            return Ok(HandshakeStatus::InProgress);
        }
        match io.receive()? {
            Received::WouldBlock => return Ok(HandshakeStatus::InProgress),
            Received::EndOfStream => return Err(TransportError::failure("Proxy has cut the connection.")),
            Received::Data => {}
        }

        let chunk = io.take_leftover();
        let Some(response) = self.proxy_response.push(&chunk) else {
            return Ok(HandshakeStatus::InProgress);
        };

        match self.authenticator.process_response(&response) {
            Ok(auth) if auth.is_authenticated => {
                debug!("proxy tunnel established");
                self.state = InitState::Connecting;
            }
            Ok(auth) => {
                self.proxy_authorization = auth.proxy_authorization;
                if auth.close_connection {
                    debug!("proxy closes the connection, reconnecting for authentication");
                    self.start_connect();
                }
                else {
                    debug!("sending CONNECT request with proxy authorization");
                    self.send_proxy_request()?;
                }
            }
            Err(ProxyAuthError::BadResponseCode(text)) => {
                self.num_ignored_proxy_responses += 1;
                if self.num_ignored_proxy_responses > self.config.max_ignored_proxy_responses {
                    return Err(TransportError::failure(format!("proxy authentication failed: ignored {} responses without a usable response code", self.config.max_ignored_proxy_responses)));
                }
                warn!("ignoring proxy response: {}", text);
            }
            Err(e) => return Err(TransportError::failure(e.to_string())),
        }
        Ok(HandshakeStatus::InProgress)
    }

    fn connect_req(&self) -> ConnectReq {
        let compression_type = self.config.channel.compression_type;
        ConnectReq {
            version: self.version,
            key_exchange: self.config.key_exchange,
            compression_bitmap: if compression_type == CompressionType::None { 0 } else { compression_type.bitmap_bit() },
            ping_timeout: self.config.ping_timeout,
            session_flags: SessionFlags::CLIENT_TO_SERVER_PING | SessionFlags::SERVER_TO_CLIENT_PING,
            protocol_type: self.config.identity.protocol_type,
            major_version: self.config.identity.major_version,
            minor_version: self.config.identity.minor_version,
            host_name: self.config.host_name.clone(),
            ip_address: self.config.ip_address.clone(),
            component_version: self.config.identity.component_version.clone(),
        }
    }

    fn step_connecting(&mut self) -> TransportResult<HandshakeStatus> {
        if !self.poll_connect()? {
            return Ok(HandshakeStatus::InProgress);
        }

        let mut buf = BytesMut::new();
        self.connect_req().ser(&mut buf);
        let io = self.io()?;
        io.out.extend_from_slice(&buf);
        io.send_pending()?;

        debug!("sent ConnectReq for {:?}", self.version);
        self.state = InitState::WaitAck;
        Ok(HandshakeStatus::InProgress)
    }

    fn step_wait_ack(&mut self) -> TransportResult<HandshakeStatus> {
        let io = self.io()?;
        if !io.send_pending()? {
            return Ok(HandshakeStatus::InProgress);
        }
        match io.receive()? {
            Received::EndOfStream => return self.fall_back(),
            Received::WouldBlock | Received::Data => {}
        }

        let Some(frame) = io.take_frame() else {
            return Ok(HandshakeStatus::InProgress);
        };

        match ConnectReply::deser(&frame)? {
            ConnectReply::Nak(nak) => {
                debug!("server refused the connection: {}", nak.text);
                Err(TransportError::failure(nak.text))
            }
            ConnectReply::Ack(ack) => self.on_ack(ack),
        }
    }

    fn fall_back(&mut self) -> TransportResult<HandshakeStatus> {
        match self.fallback_versions.pop_front() {
            Some(version) => {
                debug!("server closed the connection, falling back from {:?} to {:?}", self.version, version);
                self.version = version;
                self.state = InitState::Reconnecting;
                Ok(HandshakeStatus::InProgress)
            }
            None => Err(TransportError::failure("server closed the connection during the handshake, no more protocol versions to try")),
        }
    }

    fn on_ack(&mut self, ack: ConnectAck) -> TransportResult<HandshakeStatus> {
        if ack.version > self.version {
            return Err(TransportError::failure(format!("server acknowledged {:?}, but {:?} was requested", ack.version, self.version)));
        }
        let max_user_msg_size: usize = ack.max_user_msg_size.safe_cast();
        if max_user_msg_size < AcceptConfig::MIN_USER_MSG_SIZE {
            return Err(TransportError::failure(format!("invalid max user message size {} in ConnectAck", max_user_msg_size)));
        }

        let mut negotiated = Negotiated {
            version: ack.version,
            max_user_msg_size,
            ping_timeout: ack.ping_timeout,
            session_flags: ack.session_flags,
            protocol_type: self.config.identity.protocol_type,
            major_version: ack.major_version,
            minor_version: ack.minor_version,
            compression_type: ack.compression_type,
            compression_level: ack.compression_level,
            shared_key: None,
            peer_component_version: ack.component_version,
        };

        match ack.key_info {
            Some(key_info) => {
                if key_info.p < 3 {
                    return Err(TransportError::failure(format!("invalid key exchange modulus {}", key_info.p)));
                }
                let key_pair = KeyPair::generate(key_info.p, key_info.g);
                negotiated.shared_key = Some(key_pair.shared_key(key_info.public_key));

                let mut buf = BytesMut::new();
                ClientKey { public_key: key_pair.public_key() }.ser(&mut buf);
                let io = self.io()?;
                io.out.extend_from_slice(&buf);
                io.send_pending()?;

                self.negotiated = Some(negotiated);
                self.state = InitState::WaitClientKey;
                Ok(HandshakeStatus::InProgress)
            }
            None => self.establish(negotiated),
        }
    }

    fn step_send_client_key(&mut self) -> TransportResult<HandshakeStatus> {
        if !self.io()?.send_pending()? {
            return Ok(HandshakeStatus::InProgress);
        }
        let negotiated = self.negotiated.take()
            .ok_or_else(|| TransportError::failure("key exchange without negotiated parameters"))?;
        self.establish(negotiated)
    }

    fn establish(&mut self, negotiated: Negotiated) -> TransportResult<HandshakeStatus> {
        let mut io = self.io.take()
            .ok_or_else(|| TransportError::failure("no connection"))?;
        self.state = InitState::Active;
        info!("connected to {}:{} with {:?}, compression {:?}", self.config.host, self.config.port, negotiated.version, negotiated.compression_type);

        Ok(HandshakeStatus::Established(Established {
            negotiated,
            leftover: io.take_leftover(),
            socket: io.socket,
        }))
    }
}

impl Handshake for ConnectorHandshake {
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
        if self.pending_connect.is_some() {
            return None;
        }
        self.io.as_ref()
            .map(|io| (io.socket.clone(), io.interest()))
    }

    fn abort(&mut self) {
        self.pending_connect = None;
        if let Some(io) = self.io.take() {
            let _ = io.socket.shutdown();
        }
        if self.state != InitState::Active {
            self.state = InitState::Inactive;
        }
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use crate::config::ProxyConfig;
    use crate::handshake::key_exchange::{DEFAULT_G, DEFAULT_P};
    use crate::handshake::messages::{ConnectNak, KeyInfo, CONNECTION_REFUSED};
    use crate::handshake::proxy::{MockProxyAuthenticator, NoAuthentication, ProxyAuthResponse};
    use crate::socket::MockSocketConnector;
    use crate::test_util::MemorySocket;
    use super::*;

    /// Hands out a fresh in-memory connection per connect, keeping the server ends
    fn connector() -> (Arc<MockSocketConnector>, Arc<Mutex<Vec<MemorySocket>>>) {
        let server_ends = Arc::new(Mutex::new(Vec::new()));
        let cloned = server_ends.clone();

        let mut connector = MockSocketConnector::new();
        connector.expect_connect()
            .returning(move |_, _| {
                let (client, server) = MemorySocket::pair();
                cloned.lock().unwrap().push(server);
                PendingConnect::ready(Ok(client.boxed()))
            });
        (Arc::new(connector), server_ends)
    }

    fn server_end(server_ends: &Arc<Mutex<Vec<MemorySocket>>>) -> MemorySocket {
        server_ends.lock().unwrap().last().unwrap().clone()
    }

    fn ack(version: RipcVersion, key_info: Option<KeyInfo>) -> Vec<u8> {
        let mut buf = BytesMut::new();
        ConnectAck {
            version,
            max_user_msg_size: 6144,
            session_flags: SessionFlags::CLIENT_TO_SERVER_PING,
            ping_timeout: 30,
            major_version: 14,
            minor_version: 0,
            compression_type: CompressionType::None,
            compression_level: 0,
            key_info,
            component_version: "server 1".to_string(),
        }.ser(&mut buf);
        buf.to_vec()
    }

    fn step(handshake: &mut ConnectorHandshake) -> Option<Established> {
        match handshake.step().unwrap() {
            HandshakeStatus::InProgress => None,
            HandshakeStatus::Established(established) => Some(established),
        }
    }

    fn new_handshake(config: ConnectConfig, connector: Arc<MockSocketConnector>) -> ConnectorHandshake {
        ConnectorHandshake::new(config, connector, Box::new(NoAuthentication::new())).unwrap()
    }

    #[test]
    fn test_connect_and_ack() {
        let (connector, server_ends) = connector();
        let mut config = ConnectConfig::new("server", 14002);
        config.identity.protocol_type = 3;
        let mut handshake = new_handshake(config, connector);
        assert_eq!(handshake.init_state(), InitState::Connecting);
        assert!(handshake.readiness().is_none());

        assert!(step(&mut handshake).is_none());
        assert_eq!(handshake.init_state(), InitState::WaitAck);

        let server = server_end(&server_ends);
        let req = ConnectReq::deser(&server.take_received()).unwrap();
        assert_eq!(req.version, RipcVersion::Ripc14);
        assert_eq!(req.protocol_type, 3);

        assert!(step(&mut handshake).is_none());

        let mut data = ack(RipcVersion::Ripc14, None);
        data.extend_from_slice(&[0, 3, 2]);
        server.write_raw(&data);
        let established = step(&mut handshake).unwrap();
        assert_eq!(handshake.init_state(), InitState::Active);

        let negotiated = established.negotiated;
        assert_eq!(negotiated.version, RipcVersion::Ripc14);
        assert_eq!(negotiated.max_user_msg_size, 6144);
        assert_eq!(negotiated.ping_timeout, 30);
        assert_eq!(negotiated.protocol_type, 3);
        assert_eq!(negotiated.session_flags, SessionFlags::CLIENT_TO_SERVER_PING);
        assert_eq!(negotiated.shared_key, None);
        assert_eq!(negotiated.peer_component_version, "server 1");
        assert_eq!(established.leftover, vec![0, 3, 2]);
    }

    #[test]
    fn test_ack_in_pieces() {
        let (connector, server_ends) = connector();
        let mut handshake = new_handshake(ConnectConfig::new("server", 14002), connector);
        step(&mut handshake);
        let server = server_end(&server_ends);

        let data = ack(RipcVersion::Ripc14, None);
        server.write_raw(&data[..5]);
        assert!(step(&mut handshake).is_none());
        server.write_raw(&data[5..]);
        assert!(step(&mut handshake).is_some());
    }

    #[test]
    fn test_fall_back_to_older_version() {
        let (connector, server_ends) = connector();
        let mut handshake = new_handshake(ConnectConfig::new("server", 14002), connector);
        step(&mut handshake);

        server_end(&server_ends).close();
        assert!(step(&mut handshake).is_none());
        assert_eq!(handshake.init_state(), InitState::Reconnecting);
        assert_eq!(handshake.version(), RipcVersion::Ripc13);

        assert!(step(&mut handshake).is_none());
        assert_eq!(handshake.init_state(), InitState::Connecting);
        assert!(step(&mut handshake).is_none());
        assert_eq!(handshake.init_state(), InitState::WaitAck);

        assert_eq!(server_ends.lock().unwrap().len(), 2);
        let server = server_end(&server_ends);
        let req = ConnectReq::deser(&server.take_received()).unwrap();
        assert_eq!(req.version, RipcVersion::Ripc13);

        server.write_raw(&ack(RipcVersion::Ripc13, None));
        let established = step(&mut handshake).unwrap();
        assert_eq!(established.negotiated.version, RipcVersion::Ripc13);
    }

    #[test]
    fn test_versions_exhausted() {
        let (connector, server_ends) = connector();
        let mut config = ConnectConfig::new("server", 14002);
        config.supported_versions = vec![RipcVersion::Ripc12, RipcVersion::Ripc11];
        let mut handshake = new_handshake(config, connector);

        for _ in 0..2 {
            while handshake.init_state() != InitState::WaitAck {
                step(&mut handshake);
            }
            server_end(&server_ends).close();
            let _ = handshake.step();
        }

        assert_eq!(handshake.init_state(), InitState::Inactive);
        assert_eq!(server_ends.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_versions_exhausted_error() {
        let (connector, server_ends) = connector();
        let mut config = ConnectConfig::new("server", 14002);
        config.supported_versions = vec![RipcVersion::Ripc11];
        let mut handshake = new_handshake(config, connector);
        step(&mut handshake);

        server_end(&server_ends).close();
        let result = handshake.step();
        assert!(matches!(result, Err(TransportError::Failure(_))));
        assert_eq!(handshake.init_state(), InitState::Inactive);
    }

    #[test]
    fn test_nak() {
        let (connector, server_ends) = connector();
        let mut handshake = new_handshake(ConnectConfig::new("server", 14002), connector);
        step(&mut handshake);

        let mut buf = BytesMut::new();
        ConnectNak { text: CONNECTION_REFUSED.to_string() }.ser(&mut buf);
        server_end(&server_ends).write_raw(&buf);

        match handshake.step() {
            Err(e) => assert_eq!(e.text(), CONNECTION_REFUSED),
            Ok(_) => panic!("expected a failure"),
        }
        assert_eq!(handshake.init_state(), InitState::Inactive);
        assert!(server_end(&server_ends).is_closed());
    }

    #[test]
    fn test_connect_failure() {
        let mut connector = MockSocketConnector::new();
        connector.expect_connect()
            .returning(|_, _| PendingConnect::ready(Err(std::io::ErrorKind::ConnectionRefused.into())));
        let mut handshake = new_handshake(ConnectConfig::new("server", 14002), Arc::new(connector));

        assert!(matches!(handshake.step(), Err(TransportError::Failure(_))));
        assert_eq!(handshake.init_state(), InitState::Inactive);
    }

    #[test]
    fn test_partial_send_of_connect_req() {
        let (client, server) = MemorySocket::pair();
        client.set_max_per_send(10);
        let mut connector = MockSocketConnector::new();
        connector.expect_connect()
            .returning(move |_, _| PendingConnect::ready(Ok(client.boxed())));
        let mut handshake = new_handshake(ConnectConfig::new("server", 14002), Arc::new(connector));

        step(&mut handshake);
        assert_eq!(server.num_received(), 10);
        assert_eq!(handshake.readiness().unwrap().1, Interest::WRITABLE);

        for _ in 0..10 {
            step(&mut handshake);
        }
        assert!(ConnectReq::deser(&server.take_received()).is_ok());
        assert_eq!(handshake.readiness().unwrap().1, Interest::READABLE);
    }

    #[test]
    fn test_key_exchange() {
        let (connector, server_ends) = connector();
        let mut config = ConnectConfig::new("server", 14002);
        config.key_exchange = true;
        let mut handshake = new_handshake(config, connector);
        step(&mut handshake);

        let server = server_end(&server_ends);
        assert!(ConnectReq::deser(&server.take_received()).unwrap().key_exchange);

        let server_key = KeyPair::generate(DEFAULT_P, DEFAULT_G);
        server.write_raw(&ack(RipcVersion::Ripc14, Some(KeyInfo { p: DEFAULT_P, g: DEFAULT_G, public_key: server_key.public_key() })));

        assert!(step(&mut handshake).is_none());
        assert_eq!(handshake.init_state(), InitState::WaitClientKey);
        let established = step(&mut handshake).unwrap();

        let client_key = ClientKey::deser(&server.take_received()).unwrap();
        assert_eq!(established.negotiated.shared_key, Some(server_key.shared_key(client_key.public_key)));
    }

    fn proxy_config() -> ConnectConfig {
        let mut config = ConnectConfig::new("server", 14002);
        config.proxy = Some(ProxyConfig { host: "proxy".to_string(), port: 8080 });
        config.user_agent = "test".to_string();
        config
    }

    #[test]
    fn test_proxy_tunnel() {
        let (client, server) = MemorySocket::pair();
        let mut connector = MockSocketConnector::new();
        connector.expect_connect()
            .withf(|host, port| host == "proxy" && *port == 8080)
            .times(1)
            .returning(move |_, _| PendingConnect::ready(Ok(client.boxed())));
        let mut handshake = new_handshake(proxy_config(), Arc::new(connector));
        assert_eq!(handshake.init_state(), InitState::ProxyConnecting);

        step(&mut handshake);
        assert_eq!(handshake.init_state(), InitState::ClientWaitProxyAck);
        let request = String::from_utf8(server.take_received()).unwrap();
        assert!(request.starts_with("CONNECT server:14002 HTTP/1.1\r\n"));

        server.write_raw(b"HTTP/1.1 200 Connection established\r\n");
        step(&mut handshake);
        assert_eq!(handshake.init_state(), InitState::ClientWaitProxyAck);
        server.write_raw(b"\r\n");
        step(&mut handshake);
        assert_eq!(handshake.init_state(), InitState::Connecting);

        step(&mut handshake);
        assert_eq!(handshake.init_state(), InitState::WaitAck);
        assert!(ConnectReq::deser(&server.take_received()).is_ok());
    }

    fn proxy_handshake(authenticator: MockProxyAuthenticator, config: ConnectConfig) -> (ConnectorHandshake, Arc<Mutex<Vec<MemorySocket>>>) {
        let (connector, server_ends) = connector();
        let handshake = ConnectorHandshake::new(config, connector, Box::new(authenticator)).unwrap();
        (handshake, server_ends)
    }

    #[test]
    fn test_proxy_authorization_resent() {
        let mut num_calls = 0;
        let mut authenticator = MockProxyAuthenticator::new();
        authenticator.expect_process_response()
            .times(2)
            .returning(move |_| {
                num_calls += 1;
                Ok(ProxyAuthResponse {
                    is_authenticated: num_calls > 1,
                    proxy_authorization: Some("Proxy-Authorization: Basic abc\r\n".to_string()),
                    close_connection: false,
                })
            });
        let (mut handshake, server_ends) = proxy_handshake(authenticator, proxy_config());

        step(&mut handshake);
        let server = server_end(&server_ends);
        assert!(!String::from_utf8(server.take_received()).unwrap().contains("Proxy-Authorization"));

        server.write_raw(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n");
        step(&mut handshake);
        assert_eq!(handshake.init_state(), InitState::ClientWaitProxyAck);
        assert!(String::from_utf8(server.take_received()).unwrap().contains("Proxy-Authorization: Basic abc\r\n"));

        server.write_raw(b"HTTP/1.1 200 OK\r\n\r\n");
        step(&mut handshake);
        assert_eq!(handshake.init_state(), InitState::Connecting);
        assert_eq!(server_ends.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_proxy_reconnect_on_close() {
        let mut authenticator = MockProxyAuthenticator::new();
        authenticator.expect_process_response()
            .times(1)
            .returning(|_| Ok(ProxyAuthResponse {
                is_authenticated: false,
                proxy_authorization: Some("Proxy-Authorization: Basic abc\r\n".to_string()),
                close_connection: true,
            }));
        let (mut handshake, server_ends) = proxy_handshake(authenticator, proxy_config());

        step(&mut handshake);
        let first = server_end(&server_ends);
        first.write_raw(b"HTTP/1.1 407 Proxy Authentication Required\r\nConnection: close\r\n\r\n");
        step(&mut handshake);
        assert_eq!(handshake.init_state(), InitState::ProxyConnecting);
        assert!(first.is_closed());

        step(&mut handshake);
        assert_eq!(server_ends.lock().unwrap().len(), 2);
        assert!(String::from_utf8(server_end(&server_ends).take_received()).unwrap().contains("Proxy-Authorization: Basic abc\r\n"));
    }

    #[test]
    fn test_proxy_ignored_responses_are_bounded() {
        let mut authenticator = MockProxyAuthenticator::new();
        authenticator.expect_process_response()
            .times(3)
            .returning(|_| Err(ProxyAuthError::BadResponseCode("<html>".to_string())));
        let mut config = proxy_config();
        config.max_ignored_proxy_responses = 2;
        let (mut handshake, server_ends) = proxy_handshake(authenticator, config);

        step(&mut handshake);
        let server = server_end(&server_ends);
        for _ in 0..2 {
            server.write_raw(b"<html>\r\n\r\n");
            step(&mut handshake);
            assert_eq!(handshake.init_state(), InitState::ClientWaitProxyAck);
        }
        server.write_raw(b"<html>\r\n\r\n");
        assert!(handshake.step().is_err());
    }

    #[test]
    fn test_proxy_fatal_response() {
        let mut authenticator = MockProxyAuthenticator::new();
        authenticator.expect_process_response()
            .returning(|_| Err(ProxyAuthError::Fatal("403 Forbidden".to_string())));
        let (mut handshake, server_ends) = proxy_handshake(authenticator, proxy_config());

        step(&mut handshake);
        server_end(&server_ends).write_raw(b"HTTP/1.1 403 Forbidden\r\n\r\n");
        match handshake.step() {
            Err(e) => assert_eq!(e.text(), "proxy authentication failed: 403 Forbidden"),
            Ok(_) => panic!("expected a failure"),
        }
    }

    #[test]
    fn test_proxy_cut_connection() {
        let (connector, server_ends) = connector();
        let mut handshake = new_handshake(proxy_config(), connector);
        step(&mut handshake);

        server_end(&server_ends).close();
        match handshake.step() {
            Err(e) => assert_eq!(e.text(), "Proxy has cut the connection."),
            Ok(_) => panic!("expected a failure"),
        }
    }
}

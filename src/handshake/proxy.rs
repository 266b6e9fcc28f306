use std::mem;
#[cfg(test)] use mockall::automock;
use tracing::trace;

pub const END_OF_RESPONSE: &str = "\r\n\r\n";

/// What the authenticator made of a proxy's response to a CONNECT request
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ProxyAuthResponse {
    pub is_authenticated: bool,
    /// header lines (each terminated by "\r\n") to add to the next CONNECT request
    pub proxy_authorization: Option<String>,
    /// the proxy closes the connection, so the next CONNECT request needs a new one
    pub close_connection: bool,
}

#[derive(thiserror::Error, Debug)]
pub enum ProxyAuthError {
    /// The response has no usable status code, e.g. because it is an HTML page intended for a
    ///  human. Such responses are ignored up to a limit.
    #[error("no response code in proxy response: {0}")]
    BadResponseCode(String),
    #[error("proxy authentication failed: {0}")]
    Fatal(String),
}

/// Negotiates authentication with an HTTP proxy. It is consulted with every complete response
///  to a CONNECT request.
#[cfg_attr(test, automock)]
pub trait ProxyAuthenticator: Send {
    fn process_response(&mut self, response: &str) -> Result<ProxyAuthResponse, ProxyAuthError>;
}

/// For proxies that require no authentication: accepts a 200 response, and fails on anything
///  else
pub struct NoAuthentication {}

impl NoAuthentication {
    pub fn new() -> NoAuthentication {
        NoAuthentication {}
    }
}

impl ProxyAuthenticator for NoAuthentication {
    fn process_response(&mut self, response: &str) -> Result<ProxyAuthResponse, ProxyAuthError> {
        let status_line = response.lines().next().unwrap_or_default();
        let status_code = status_line.split_whitespace()
            .nth(1)
            .and_then(|code| code.parse::<u16>().ok());

        match status_code {
            Some(200) => Ok(ProxyAuthResponse {
                is_authenticated: true,
                ..Default::default()
            }),
            Some(407) => Err(ProxyAuthError::Fatal("the proxy requires authentication, but no credentials are configured".to_string())),
            Some(_) => Err(ProxyAuthError::Fatal(status_line.to_string())),
            None => Err(ProxyAuthError::BadResponseCode(status_line.to_string())),
        }
    }
}

pub fn connect_request(host: &str, port: u16, user_agent: &str, proxy_authorization: Option<&str>) -> String {
    let mut result = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\n\
         User-Agent: {user_agent}\r\n\
         Proxy-Connection: Keep-Alive\r\n\
         Content-Length: 0\r\n\
         Host: {host}:{port}\r\n\
         Pragma: no-cache\r\n");
    if let Some(authorization) = proxy_authorization {
        result.push_str(authorization);
    }
    result.push_str("\r\n");
    result
}

/// Collects a proxy response that may arrive in several chunks
#[derive(Default)]
pub struct ProxyResponseAccumulator {
    text: String,
}

impl ProxyResponseAccumulator {
    /// Returns the complete response once the end of its header was received
    pub fn push(&mut self, chunk: &[u8]) -> Option<String> {
        self.text.push_str(&String::from_utf8_lossy(chunk));
        if self.text.contains(END_OF_RESPONSE) {
            Some(mem::take(&mut self.text))
        }
        else {
            trace!("incomplete proxy response: {} bytes so far", self.text.len());
            None
        }
    }

    pub fn clear(&mut self) {
        self.text.clear();
    }
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_connect_request() {
        assert_eq!(connect_request("srv", 14002, "ua/1", None),
            "CONNECT srv:14002 HTTP/1.1\r\nUser-Agent: ua/1\r\nProxy-Connection: Keep-Alive\r\nContent-Length: 0\r\nHost: srv:14002\r\nPragma: no-cache\r\n\r\n");
    }

    #[test]
    fn test_connect_request_with_authorization() {
        let request = connect_request("srv", 1, "ua", Some("Proxy-Authorization: Basic abc\r\n"));
        assert!(request.ends_with("Pragma: no-cache\r\nProxy-Authorization: Basic abc\r\n\r\n"));
    }

    #[test]
    fn test_accumulator() {
        let mut accumulator = ProxyResponseAccumulator::default();
        assert_eq!(accumulator.push(b"HTTP/1.1 200 Connection established\r"), None);
        assert_eq!(accumulator.push(b"\n\r"), None);
        assert_eq!(accumulator.push(b"\n"), Some("HTTP/1.1 200 Connection established\r\n\r\n".to_string()));
        assert_eq!(accumulator.push(b"x"), None);

        accumulator.clear();
        assert_eq!(accumulator.push(b"\r\n\r\n"), Some("\r\n\r\n".to_string()));
    }

    #[rstest]
    #[case::ok("HTTP/1.1 200 Connection established\r\n\r\n", Some(true))]
    #[case::auth_required("HTTP/1.1 407 Proxy Authentication Required\r\n\r\n", None)]
    #[case::forbidden("HTTP/1.0 403 Forbidden\r\n\r\n", None)]
    fn test_no_authentication(#[case] response: &str, #[case] expected: Option<bool>) {
        let result = NoAuthentication::new().process_response(response);
        match expected {
            Some(authenticated) => assert_eq!(result.unwrap().is_authenticated, authenticated),
            None => assert!(matches!(result, Err(ProxyAuthError::Fatal(_)))),
        }
    }

    #[test]
    fn test_no_authentication_garbage() {
        let result = NoAuthentication::new().process_response("<html>oops</html>\r\n\r\n");
        assert!(matches!(result, Err(ProxyAuthError::BadResponseCode(_))));
    }
}

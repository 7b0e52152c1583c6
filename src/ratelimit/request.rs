//! Inbound request abstraction.

use std::net::SocketAddr;

/// The parts of an already-parsed HTTP request the limiter looks at.
pub trait InboundRequest: Sync {
    /// Value of the named header, if present and valid UTF-8.
    fn header(&self, name: &str) -> Option<&str>;

    fn method(&self) -> &str;

    fn path(&self) -> &str;

    /// Raw remote socket address, usually `host:port`.
    fn remote_addr(&self) -> Option<String>;
}

/// Raw remote address attached to a request by the server, kept verbatim.
///
/// Takes precedence over a [`SocketAddr`] extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAddr(pub String);

impl<B: Sync> InboundRequest for http::Request<B> {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers().get(name).and_then(|v| v.to_str().ok())
    }

    fn method(&self) -> &str {
        http::Request::method(self).as_str()
    }

    fn path(&self) -> &str {
        self.uri().path()
    }

    fn remote_addr(&self) -> Option<String> {
        let extensions = self.extensions();
        if let Some(RemoteAddr(raw)) = extensions.get::<RemoteAddr>() {
            return Some(raw.clone());
        }
        extensions.get::<SocketAddr>().map(ToString::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_request_parts() {
        let request = http::Request::builder()
            .method("POST")
            .uri("https://example.com/api/items?page=2")
            .header("X-Real-IP", "203.0.113.9")
            .body(())
            .unwrap();

        assert_eq!(InboundRequest::method(&request), "POST");
        assert_eq!(InboundRequest::path(&request), "/api/items");
        assert_eq!(request.header("x-real-ip"), Some("203.0.113.9"));
        assert_eq!(request.header("cf-connecting-ip"), None);
        assert_eq!(request.remote_addr(), None);
    }

    #[test]
    fn test_remote_addr_from_socket_addr() {
        let mut request = http::Request::new(());
        let addr: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        request.extensions_mut().insert(addr);

        assert_eq!(request.remote_addr().as_deref(), Some("[2001:db8::1]:443"));
    }

    #[test]
    fn test_raw_remote_addr_wins() {
        let mut request = http::Request::new(());
        let addr: SocketAddr = "10.0.0.1:80".parse().unwrap();
        request.extensions_mut().insert(addr);
        request
            .extensions_mut()
            .insert(RemoteAddr("unix-socket".to_string()));

        assert_eq!(request.remote_addr().as_deref(), Some("unix-socket"));
    }
}

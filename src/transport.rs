//! Socket establishment.
//!
//! [`Connector`] is the seam between the shard runner and the network: the
//! runner only needs a stream of messages and a sink for them.

use crate::config::ConnectionConfig;
use crate::error::Error;
use futures_util::{Sink, Stream};
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpSocket;
use tokio::time::Duration;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{client_async_tls_with_config, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

/// Opens gateway sockets.
pub trait Connector: Send + Sync + 'static {
    type Socket: Stream<Item = Result<Message, tungstenite::Error>>
        + Sink<Message, Error = tungstenite::Error>
        + Send
        + Unpin
        + 'static;

    fn connect(&self, url: &Url) -> impl Future<Output = Result<Self::Socket, Error>> + Send;
}

/// Append the protocol query parameters to a discovered endpoint.
pub fn gateway_url(endpoint: &str, config: &ConnectionConfig) -> Result<Url, Error> {
    let mut url = Url::parse(endpoint)
        .map_err(|e| Error::ConnectionFailed(format!("Invalid gateway URL '{}': {}", endpoint, e)))?;

    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("v", &config.api_version.to_string())
            .append_pair("encoding", config.encoding.resolve().query_value());
        if let Some(compress) = config.compression.query_value() {
            query.append_pair("compress", compress);
        }
    }

    Ok(url)
}

pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// TCP + optional TLS + WebSocket handshake via tokio-tungstenite
#[derive(Debug, Clone, Default)]
pub struct TungsteniteConnector {
    /// Local address to bind outgoing connections to
    pub source_ip: Option<std::net::IpAddr>,
}

impl Connector for TungsteniteConnector {
    type Socket = WsStream;

    async fn connect(&self, url: &Url) -> Result<WsStream, Error> {
        let host = url
            .host_str()
            .ok_or_else(|| Error::ConnectionFailed("No host in URL".to_string()))?;

        let is_tls = url.scheme() == "wss";
        let port = url.port().unwrap_or(if is_tls { 443 } else { 80 });

        let request = url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::ConnectionFailed(format!("Invalid WebSocket request: {}", e)))?;

        let tcp_stream = connect_direct(host, port, self.source_ip).await?;
        set_tcp_options(&tcp_stream);

        let connector = if is_tls {
            let tls = native_tls::TlsConnector::new()
                .map_err(|e| Error::ConnectionFailed(format!("TLS error: {}", e)))?;
            Some(tokio_tungstenite::Connector::NativeTls(tls))
        } else {
            None
        };

        let (ws_stream, response) =
            client_async_tls_with_config(request, tcp_stream, None, connector)
                .await
                .map_err(Error::WebSocket)?;
        debug!("WebSocket handshake with {} complete ({})", host, response.status());

        Ok(ws_stream)
    }
}

async fn connect_direct(
    host: &str,
    port: u16,
    source_ip: Option<std::net::IpAddr>,
) -> Result<tokio::net::TcpStream, Error> {
    let dest_addr: SocketAddr = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| Error::ConnectionFailed(format!("DNS lookup failed: {}", e)))?
        .next()
        .ok_or_else(|| Error::ConnectionFailed(format!("No addresses found for {}", host)))?;

    let socket = if dest_addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|e| Error::ConnectionFailed(format!("Failed to create socket: {}", e)))?;

    if let Some(ip) = source_ip {
        socket
            .bind(SocketAddr::new(ip, 0))
            .map_err(|e| Error::ConnectionFailed(format!("Failed to bind to {}: {}", ip, e)))?;
    }

    socket
        .connect(dest_addr)
        .await
        .map_err(|e| Error::ConnectionFailed(format!("TCP connect to {} failed: {}", dest_addr, e)))
}

fn set_tcp_options(stream: &tokio::net::TcpStream) {
    let sock = socket2::SockRef::from(stream);
    let _ = sock.set_nodelay(true);

    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));
    let _ = sock.set_tcp_keepalive(&keepalive);
}

use crate::config::{DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_HANDSHAKE_TIMEOUT_SECS, ProxyCredentials};
use crate::error::TunnelError;
use crate::registry::TunnelSpec;
use base64::{Engine as _, engine::general_purpose};
use bytes::{Bytes, BytesMut};
use http::StatusCode;
use log::{debug, trace};
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Duration, timeout};

const READ_CHUNK: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectorOptions {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub max_header_size: usize,
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            max_header_size: 16 * 1024,
        }
    }
}

/// Progress of one CONNECT negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    Dialing,
    SentConnect,
    AwaitingStatusLine,
    Established,
    Failed,
}

impl fmt::Display for ConnectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectState::Dialing => "dialing",
            ConnectState::SentConnect => "sent-connect",
            ConnectState::AwaitingStatusLine => "awaiting-status-line",
            ConnectState::Established => "established",
            ConnectState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// The parsed head of the proxy's reply, plus any tunnel bytes that arrived with it.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: u16,
    pub reason: String,
    pub early_data: Bytes,
}

/// A proxy socket that has become a raw pipe to the target.
#[derive(Debug)]
pub struct EstablishedTunnel {
    pub stream: TcpStream,
    pub status: u16,
    pub reason: String,
    /// Target bytes received after the response headers; forwarded before anything else.
    pub early_data: Bytes,
}

/// `Basic <base64(user:pass)>`, the value of `Proxy-Authorization`.
pub fn basic_authorization(credentials: &ProxyCredentials) -> String {
    let raw = format!("{}:{}", credentials.username(), credentials.password());
    format!("Basic {}", general_purpose::STANDARD.encode(raw.as_bytes()))
}

pub fn render_connect_request(spec: &TunnelSpec) -> String {
    let target = spec.target_authority();
    let mut request = format!(
        "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nUser-Agent: {}\r\n",
        spec.user_agent
    );
    if let Some(credentials) = &spec.credentials {
        request.push_str("Proxy-Authorization: ");
        request.push_str(&basic_authorization(credentials));
        request.push_str("\r\n");
    }
    request.push_str("\r\n");
    request
}

/// Parses `HTTP/1.x SP 3DIGIT [SP reason]`.
pub fn parse_status_line(line: &str) -> Result<(u16, String), TunnelError> {
    let malformed = || TunnelError::rejected(None, format!("malformed status line '{}'", line.trim_end()));

    let line = line.trim_end_matches(['\r', '\n']);
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    let code = parts.next().unwrap_or_default();
    let reason = parts.next().unwrap_or_default().trim();

    if !version.starts_with("HTTP/") || code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    let status = code
        .parse::<u16>()
        .ok()
        .and_then(|c| StatusCode::from_u16(c).ok())
        .ok_or_else(malformed)?;

    let reason = if reason.is_empty() {
        status.canonical_reason().unwrap_or_default().to_string()
    } else {
        reason.to_string()
    };
    Ok((status.as_u16(), reason))
}

/// Returns `(end of header block, start of tunnel bytes)`.
fn find_header_end(buf: &[u8]) -> Option<(usize, usize)> {
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| (i, i + 4));
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|i| (i, i + 2));
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

/// Reads the proxy's status line and headers up to the blank line. Bytes that
/// follow the blank line are kept as `early_data`.
pub async fn read_response<S>(stream: &mut S, max_header_size: usize) -> Result<ProxyResponse, TunnelError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    let (head_end, body_start) = loop {
        if let Some(found) = find_header_end(&buf) {
            break found;
        }
        if buf.len() > max_header_size {
            return Err(TunnelError::rejected(
                None,
                format!("response headers exceed {} bytes", max_header_size),
            ));
        }

        buf.reserve(READ_CHUNK);
        let n = stream.read_buf(&mut buf).await.map_err(TunnelError::Handshake)?;
        if n == 0 {
            return Err(TunnelError::rejected(
                None,
                "proxy closed the connection before completing its response",
            ));
        }
    };

    if head_end > max_header_size {
        return Err(TunnelError::rejected(
            None,
            format!("response headers exceed {} bytes", max_header_size),
        ));
    }

    let head = String::from_utf8_lossy(&buf[..head_end]);
    let status_line = head.lines().next().unwrap_or_default();
    let (status, reason) = parse_status_line(status_line)?;
    for header in head.lines().skip(1) {
        trace!("proxy response header: {}", header.trim_end());
    }

    let early_data = buf.split_off(body_start).freeze();
    Ok(ProxyResponse {
        status,
        reason,
        early_data,
    })
}

/// Sends the CONNECT request and waits, bounded by `handshake_timeout`, for a 2xx reply.
pub async fn handshake<S>(
    stream: &mut S,
    request: &[u8],
    options: &ConnectorOptions,
) -> Result<ProxyResponse, TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let exchange = async {
        stream.write_all(request).await.map_err(TunnelError::Handshake)?;
        stream.flush().await.map_err(TunnelError::Handshake)?;
        trace!("CONNECT request written, awaiting status line");
        read_response(stream, options.max_header_size).await
    };

    let response = timeout(options.handshake_timeout, exchange)
        .await
        .map_err(|_| {
            TunnelError::rejected(
                None,
                format!("no response within {:?}", options.handshake_timeout),
            )
        })??;

    if !(200..=299).contains(&response.status) {
        return Err(TunnelError::rejected(Some(response.status), response.reason));
    }
    Ok(response)
}

/// Opens CONNECT tunnels for one tunnel spec.
#[derive(Clone)]
pub struct Connector {
    spec: Arc<TunnelSpec>,
    options: ConnectorOptions,
    // Rendered once; every session sends the same bytes
    request: Bytes,
}

impl Connector {
    pub fn new(spec: Arc<TunnelSpec>, options: ConnectorOptions) -> Self {
        let request = Bytes::from(render_connect_request(&spec));
        Self {
            spec,
            options,
            request,
        }
    }

    pub fn spec(&self) -> &TunnelSpec {
        &self.spec
    }

    fn advance(&self, state: &mut ConnectState, next: ConnectState) {
        trace!(
            "CONNECT {} via {}: {} -> {}",
            self.spec.target_authority(),
            self.spec.proxy,
            state,
            next
        );
        *state = next;
    }

    pub async fn dial(&self) -> Result<EstablishedTunnel, TunnelError> {
        let mut state = ConnectState::Dialing;
        let result = self.negotiate(&mut state).await;
        if let Err(e) = &result {
            let failed_in = state;
            self.advance(&mut state, ConnectState::Failed);
            debug!(
                "CONNECT {} via {} failed while {}: {}",
                self.spec.target_authority(),
                self.spec.proxy,
                failed_in,
                e
            );
        }
        result
    }

    async fn negotiate(&self, state: &mut ConnectState) -> Result<EstablishedTunnel, TunnelError> {
        let proxy = &self.spec.proxy;
        let unreachable = |source| TunnelError::ProxyUnreachable {
            proxy: proxy.authority(),
            source,
        };

        let mut stream = timeout(
            self.options.connect_timeout,
            TcpStream::connect((proxy.host.as_str(), proxy.port)),
        )
        .await
        .map_err(|_| unreachable(std::io::Error::from(std::io::ErrorKind::TimedOut)))?
        .map_err(unreachable)?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on connection to proxy {}: {}", proxy, e);
        }

        self.advance(state, ConnectState::SentConnect);
        // The write and the status-line wait share one timeout inside `handshake`
        self.advance(state, ConnectState::AwaitingStatusLine);
        let response = handshake(&mut stream, &self.request, &self.options).await?;

        self.advance(state, ConnectState::Established);
        debug!(
            "Proxy {} established tunnel to {}: {} {} ({} early bytes)",
            proxy,
            self.spec.target_authority(),
            response.status,
            response.reason,
            response.early_data.len()
        );

        Ok(EstablishedTunnel {
            stream,
            status: response.status,
            reason: response.reason,
            early_data: response.early_data,
        })
    }
}

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::config::ProbeTarget;
use crate::descriptor::LocalEndpoint;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatTypeResult {
    /// Classification as reported by the prober, e.g. "Full Cone".
    pub nat_type: String,
    pub public_address: Option<SocketAddr>,
}

/// NAT classification through a running local endpoint.
#[async_trait]
pub trait NatDiscovery: Send + Sync {
    async fn discover(
        &self,
        endpoint: &LocalEndpoint,
        cancel: &CancellationToken,
    ) -> io::Result<NatTypeResult>;
}

/// Checks that the local endpoint can open outbound connections.
#[async_trait]
pub trait ConnectProbe: Send + Sync {
    /// Returns the bound port the endpoint reported, if any.
    async fn probe(&self, endpoint: &LocalEndpoint, cancel: &CancellationToken)
        -> io::Result<Option<u16>>;
}

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Probe that asks the endpoint for a SOCKS5 CONNECT to a fixed target.
pub struct Socks5ConnectProbe {
    target: ProbeTarget,
}

impl Socks5ConnectProbe {
    pub fn new(target: ProbeTarget) -> Self {
        Self { target }
    }

    async fn connect(&self, endpoint: &LocalEndpoint) -> io::Result<Option<u16>> {
        let host = self.target.host.as_bytes();
        let host_len = field_len("target host", host)?;
        let auth_request = match &endpoint.auth {
            Some(creds) => {
                let user = creds.username.as_bytes();
                let pass = creds.password.as_bytes();
                let mut request = vec![0x01, field_len("username", user)?];
                request.extend_from_slice(user);
                request.push(field_len("password", pass)?);
                request.extend_from_slice(pass);
                Some(request)
            }
            None => None,
        };

        let mut stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;

        let greeting: &[u8] = if auth_request.is_some() {
            &[SOCKS_VERSION, 2, METHOD_NO_AUTH, METHOD_USER_PASS]
        } else {
            &[SOCKS_VERSION, 1, METHOD_NO_AUTH]
        };
        stream.write_all(greeting).await?;

        let mut choice = [0u8; 2];
        stream.read_exact(&mut choice).await?;
        if choice[0] != SOCKS_VERSION {
            return Err(protocol_error("not a SOCKS5 server"));
        }
        match (choice[1], &auth_request) {
            (METHOD_NO_AUTH, _) => {}
            (METHOD_USER_PASS, Some(request)) => {
                stream.write_all(request).await?;

                let mut status = [0u8; 2];
                stream.read_exact(&mut status).await?;
                if status[1] != 0x00 {
                    return Err(protocol_error("authentication rejected"));
                }
            }
            _ => return Err(protocol_error("no acceptable authentication method")),
        }

        let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN, host_len];
        request.extend_from_slice(host);
        request.extend_from_slice(&self.target.port.to_be_bytes());
        stream.write_all(&request).await?;

        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await?;
        if head[1] != 0x00 {
            return Err(protocol_error(&format!("CONNECT refused with code {}", head[1])));
        }

        let addr_len = match head[3] {
            ATYP_IPV4 => 4,
            ATYP_IPV6 => 16,
            ATYP_DOMAIN => stream.read_u8().await? as usize,
            other => return Err(protocol_error(&format!("unknown address type {other}"))),
        };
        let mut addr = vec![0u8; addr_len];
        stream.read_exact(&mut addr).await?;
        let bound_port = stream.read_u16().await?;

        Ok((bound_port != 0).then_some(bound_port))
    }
}

/// SOCKS5 length-prefixed fields carry at most 255 bytes.
fn field_len(field: &str, bytes: &[u8]) -> io::Result<u8> {
    u8::try_from(bytes.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{field} is {} bytes, SOCKS5 allows at most 255", bytes.len()),
        )
    })
}

fn protocol_error(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_string())
}

#[async_trait]
impl ConnectProbe for Socks5ConnectProbe {
    async fn probe(
        &self,
        endpoint: &LocalEndpoint,
        cancel: &CancellationToken,
    ) -> io::Result<Option<u16>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(io::Error::new(io::ErrorKind::Interrupted, "probe cancelled")),
            result = self.connect(endpoint) => result,
        }
    }
}

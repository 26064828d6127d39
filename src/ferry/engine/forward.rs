use std::time::Duration;

use anyhow::Context;
use thiserror::Error;
use tokio::{net::TcpStream, time};

use crate::ferry::net;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelRequestError {
    #[cfg(test)]
    #[error("invalid direct-tcpip request: insufficient data for host length")]
    ShortHostLength,
    #[cfg(test)]
    #[error("invalid direct-tcpip request: insufficient data for host and port")]
    ShortHostAndPort,
    #[error("invalid direct-tcpip request: port {0} out of range")]
    InvalidPort(u32),
    #[error("invalid direct-tcpip request: empty host")]
    EmptyHost,
}

/// Target of a `direct-tcpip` channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenRequest {
    pub host: String,
    pub port: u16,
}

impl ChannelOpenRequest {
    /// Validates fields the transport already decoded.
    pub fn from_parts(host: &str, port: u32) -> Result<Self, ChannelRequestError> {
        if host.is_empty() {
            return Err(ChannelRequestError::EmptyHost);
        }
        let port = u16::try_from(port).map_err(|_| ChannelRequestError::InvalidPort(port))?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    pub fn target(&self) -> String {
        net::join_host_port(&self.host, self.port)
    }
}

/// Byte-level form of the payload. russh decodes the live `CHANNEL_OPEN`
/// itself (a malformed one ends the whole SSH session there), so this codec
/// only pins the layout down for tests.
#[cfg(test)]
impl ChannelOpenRequest {
    /// Decodes `uint32 host_len | host | uint32 port` (big-endian).
    ///
    /// Anything after the port (the originator address and port) is ignored.
    pub fn parse(payload: &[u8]) -> Result<Self, ChannelRequestError> {
        let Some((len, rest)) = payload.split_first_chunk::<4>() else {
            return Err(ChannelRequestError::ShortHostLength);
        };
        let host_len = u32::from_be_bytes(*len) as usize;
        if rest.len() < host_len.saturating_add(4) {
            return Err(ChannelRequestError::ShortHostAndPort);
        }
        let (host, rest) = rest.split_at(host_len);
        let Some((port, _)) = rest.split_first_chunk::<4>() else {
            return Err(ChannelRequestError::ShortHostAndPort);
        };
        Self::from_parts(&String::from_utf8_lossy(host), u32::from_be_bytes(*port))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.host.len());
        out.extend_from_slice(&(self.host.len() as u32).to_be_bytes());
        out.extend_from_slice(self.host.as_bytes());
        out.extend_from_slice(&u32::from(self.port).to_be_bytes());
        out
    }
}

pub async fn dial_target(req: &ChannelOpenRequest, timeout: Duration) -> anyhow::Result<TcpStream> {
    let addr = req.target();
    let conn = if timeout > Duration::from_millis(0) {
        time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .with_context(|| format!("dial timeout {addr}"))?
            .with_context(|| format!("dial {addr}"))?
    } else {
        TcpStream::connect(&addr)
            .await
            .with_context(|| format!("dial {addr}"))?
    };
    let _ = conn.set_nodelay(true);
    Ok(conn)
}

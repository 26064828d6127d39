use std::{io, time::Duration};

use thiserror::Error;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt},
    time,
};

pub const DEFAULT_MAX_HEADER_BYTES: usize = 16 * 1024;
pub const DEFAULT_HEADER_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Sent verbatim once the upgrade is accepted. Tunnel clients match on these
/// exact bytes, including the fixed accept key.
pub const SWITCHING_PROTOCOLS: &[u8] = b"HTTP/1.1 101 Switching Protocols\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\
Sec-WebSocket-Version: 13\r\n\r\n";

pub const HEADER_TOO_LARGE: &[u8] = b"HTTP/1.1 431 Request Header Fields Too Large\r\n\r\n";

const TERMINATOR: &[u8] = b"\r\n\r\n";

#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("header block exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("header read timed out")]
    Timeout,
    #[error("connection closed before end of headers")]
    Closed,
    #[error("header read failed: {0}")]
    Io(#[from] io::Error),
}

/// A complete request header block, up to and including the blank line.
#[derive(Debug, Clone)]
pub struct HeaderBlock {
    lines: Vec<String>,
    len: usize,
}

impl HeaderBlock {
    pub fn parse(raw: &[u8]) -> Self {
        let text = String::from_utf8_lossy(raw);
        let lines = text
            .split('\n')
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        Self {
            lines,
            len: raw.len(),
        }
    }

    pub fn request_line(&self) -> &str {
        self.lines.first().map(String::as_str).unwrap_or_default()
    }

    /// Case-insensitive header lookup; returns the trimmed value of the first match.
    pub fn value(&self, name: &str) -> Option<&str> {
        self.lines.iter().skip(1).find_map(|line| {
            let (k, v) = line.split_once(':')?;
            k.trim().eq_ignore_ascii_case(name).then(|| v.trim())
        })
    }

    /// Size of the raw block including the terminator.
    pub fn byte_len(&self) -> usize {
        self.len
    }
}

/// Reads line by line until CRLFCRLF.
///
/// Never consumes more than `max_bytes + 1` bytes of header text, so an
/// endless line cannot grow the buffer past the limit. Bytes that arrived
/// after the terminator stay in `rd`'s buffer.
pub async fn read_header_block<R>(rd: &mut R, max_bytes: usize) -> Result<HeaderBlock, HeaderError>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw: Vec<u8> = Vec::with_capacity(1024.min(max_bytes + 1));
    loop {
        let budget = (max_bytes + 1).saturating_sub(raw.len()) as u64;
        let n = (&mut *rd).take(budget).read_until(b'\n', &mut raw).await?;

        if raw.len() > max_bytes {
            return Err(HeaderError::TooLarge { limit: max_bytes });
        }
        if n == 0 {
            return Err(HeaderError::Closed);
        }
        if raw.ends_with(TERMINATOR) {
            return Ok(HeaderBlock::parse(&raw));
        }
    }
}

/// [`read_header_block`] bounded by `timeout` (zero disables the bound).
pub async fn read_header_block_timeout<R>(
    rd: &mut R,
    max_bytes: usize,
    timeout: Duration,
) -> Result<HeaderBlock, HeaderError>
where
    R: AsyncBufRead + Unpin,
{
    if timeout.is_zero() {
        return read_header_block(rd, max_bytes).await;
    }
    time::timeout(timeout, read_header_block(rd, max_bytes))
        .await
        .map_err(|_| HeaderError::Timeout)?
}

/// Which `Upgrade` values open the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpgradePolicy {
    /// Any non-empty value.
    #[default]
    AnyNonEmpty,
    /// Only `websocket` (case-insensitive).
    WebSocketOnly,
}

impl UpgradePolicy {
    pub fn accepts(self, upgrade: Option<&str>) -> bool {
        let Some(v) = upgrade.map(str::trim).filter(|v| !v.is_empty()) else {
            return false;
        };
        match self {
            UpgradePolicy::AnyNonEmpty => true,
            UpgradePolicy::WebSocketOnly => v.eq_ignore_ascii_case("websocket"),
        }
    }
}

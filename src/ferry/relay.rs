use std::{io, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::watch,
    time,
};

use crate::ferry::buffer::BufferPool;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Level-triggered close flag shared by the two legs of a relay (and, for
/// sessions, by the registry).
///
/// Once closed it stays closed; every waiter observes it, including ones that
/// start waiting afterwards.
#[derive(Debug, Clone)]
pub struct CloseSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl CloseSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Returns true for the call that actually flipped the flag.
    pub fn close(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// A new signal that also closes when `self` does. Closing the child
    /// leaves the parent untouched.
    pub fn child(&self) -> CloseSignal {
        let child = CloseSignal::new();
        if self.is_closed() {
            child.close();
            return child;
        }
        let parent = self.clone();
        let linked = child.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = parent.closed() => {
                    linked.close();
                }
                _ = linked.closed() => {}
            }
        });
        child
    }
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// EOF and "peer went away" conditions end a copy normally.
pub fn is_benign(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes copied from the first stream into the second.
    pub forward: u64,
    /// Bytes copied from the second stream into the first.
    pub backward: u64,
}

/// Names used in log lines for the two ends of a relay.
#[derive(Debug, Clone, Copy)]
pub struct Ends {
    pub a: &'static str,
    pub b: &'static str,
}

/// Copies `a` <-> `b` until either direction ends, then tears both down.
///
/// Each direction runs in its own task with its own pooled buffer. When a
/// direction finishes it shuts down its destination and trips `close`, which
/// unblocks the opposite direction even if it is parked on a read.
pub async fn relay<A, B>(
    pool: &BufferPool,
    a: A,
    b: B,
    close: CloseSignal,
    sid: &str,
    ends: Ends,
) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (a_rd, a_wr) = tokio::io::split(a);
    let (b_rd, b_wr) = tokio::io::split(b);
    let sid: Arc<str> = Arc::from(sid);

    let forward = tokio::spawn(copy_leg(
        pool.clone(),
        a_rd,
        b_wr,
        close.clone(),
        sid.clone(),
        (ends.a, ends.b),
    ));
    let backward = tokio::spawn(copy_leg(
        pool.clone(),
        b_rd,
        a_wr,
        close.clone(),
        sid.clone(),
        (ends.b, ends.a),
    ));

    let (forward, backward) = tokio::join!(forward, backward);
    close.close();

    let mut stats = RelayStats::default();
    match forward {
        Ok(n) => stats.forward = n,
        Err(err) => tracing::warn!(sid=%sid, err=%err, "relay: copy task failed"),
    }
    match backward {
        Ok(n) => stats.backward = n,
        Err(err) => tracing::warn!(sid=%sid, err=%err, "relay: copy task failed"),
    }
    stats
}

async fn copy_leg<R, W>(
    pool: BufferPool,
    mut src: R,
    mut dst: W,
    close: CloseSignal,
    sid: Arc<str>,
    (from, to): (&'static str, &'static str),
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = pool.acquire();
    let mut total = 0u64;

    let res: io::Result<()> = async {
        loop {
            buf.clear();
            let n = tokio::select! {
                r = src.read_buf(&mut *buf) => r?,
                _ = close.closed() => return Ok(()),
            };
            if n == 0 {
                return Ok(());
            }
            tokio::select! {
                r = dst.write_all(&buf[..n]) => r?,
                _ = close.closed() => return Ok(()),
            }
            total += n as u64;
        }
    }
    .await;

    drop(buf);

    match res {
        Ok(()) => {}
        Err(err) if is_benign(&err) => {
            tracing::debug!(sid=%sid, from, to, err=%err, "relay: peer closed");
        }
        Err(err) => {
            tracing::warn!(sid=%sid, from, to, err=%err, "relay: copy failed");
        }
    }

    let _ = time::timeout(SHUTDOWN_GRACE, dst.shutdown()).await;
    close.close();
    total
}

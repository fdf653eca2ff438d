//! TCP transport: dials peers and pumps framed messages between the socket
//! and the link channels.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cfnode_messages::{read_frame, write_frame, Message};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::signal::{signal_pair, Signal, Trigger};
use crate::transport::{ChannelDriver, Dialer, PeerLink, DEFAULT_LINK_CAPACITY};
use crate::NetworkError;

/// Timeout for the initial TCP connection attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Dials peers over plain TCP using the length-prefixed frame codec.
#[derive(Clone, Debug)]
pub struct TcpDialer {
    connect_timeout: Duration,
    capacity: usize,
}

impl TcpDialer {
    pub fn new(connect_timeout: Duration, capacity: usize) -> Self {
        Self {
            connect_timeout,
            capacity,
        }
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new(CONNECT_TIMEOUT, DEFAULT_LINK_CAPACITY)
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: SocketAddr) -> Result<PeerLink, NetworkError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetworkError::DialTimeout(addr))?
            .map_err(|e| NetworkError::ConnectionFailed(format!("TCP connect to {addr} failed: {e}")))?;
        let _ = stream.set_nodelay(true);
        Ok(spawn_stream_link(stream, addr, false, self.capacity))
    }
}

/// Wrap an established stream into a [`PeerLink`], spawning its reader and
/// writer tasks. Either task ending closes the link.
pub fn spawn_stream_link(
    stream: TcpStream,
    addr: SocketAddr,
    inbound: bool,
    capacity: usize,
) -> PeerLink {
    let (read_half, write_half) = stream.into_split();
    let (out_tx, out_rx) = mpsc::channel(capacity);
    let (in_tx, in_rx) = mpsc::channel(capacity);
    let (close, closed) = signal_pair();

    tokio::spawn(write_loop(write_half, out_rx, close.clone(), closed.clone(), addr));
    tokio::spawn(read_loop(read_half, in_tx, close.clone(), closed, addr));

    PeerLink {
        addr,
        inbound,
        driver: Arc::new(ChannelDriver::new(out_tx, close)),
        incoming: in_rx,
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outgoing: mpsc::Receiver<Message>,
    close: Trigger,
    closed: Signal,
    addr: SocketAddr,
) {
    loop {
        tokio::select! {
            biased;
            _ = closed.fired() => break,
            msg = outgoing.recv() => {
                let Some(msg) = msg else { break };
                if let Err(e) = write_frame(&mut writer, &msg).await {
                    tracing::debug!(addr = %addr, error = %e, "peer write failed");
                    break;
                }
            }
        }
    }
    close.fire();
    let _ = writer.shutdown().await;
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    incoming: mpsc::Sender<Message>,
    close: Trigger,
    closed: Signal,
    addr: SocketAddr,
) {
    loop {
        tokio::select! {
            biased;
            _ = closed.fired() => break,
            frame = read_frame(&mut reader) => match frame {
                Ok((msg, _)) => {
                    if incoming.send(msg).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(addr = %addr, error = %e, "peer read ended");
                    break;
                }
            }
        }
    }
    close.fire();
}

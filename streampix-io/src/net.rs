//! TCP stream client for the SPIDR readout.
//!
//! The readout module is the server; we connect as a client and consume its
//! raw byte stream. Reconnection with a short backoff is the default so the
//! decoder can be started before the readout.

use crate::{Error, Result};
use log::{debug, info, warn};
use std::io::Read;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Receive buffer size. At tens of MB/s a modest buffer keeps latency low;
/// the ingest queue absorbs bursts.
const RECV_BUFFER_SIZE: usize = 8192;

/// Delay between reconnect attempts.
const RECONNECT_BACKOFF: Duration = Duration::from_millis(100);

/// Socket read timeout, so the stop flag is noticed promptly.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Client settings.
#[derive(Debug, Clone)]
pub struct TcpClientConfig {
    pub host: String,
    pub port: u16,
    /// Exit the receive loop when the peer closes instead of reconnecting.
    pub exit_on_disconnect: bool,
}

impl Default for TcpClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 8085,
            exit_on_disconnect: false,
        }
    }
}

/// TCP client delivering word-aligned byte buffers to a callback.
///
/// Buffers handed to the callback are always a multiple of 8 bytes; the
/// trailing partial word of a read is carried into the next delivery.
pub struct TcpStreamClient {
    addr: SocketAddr,
    config: TcpClientConfig,
    stop: Arc<AtomicBool>,
}

impl TcpStreamClient {
    /// Resolves the configured address. Fails fast on a bad host or port so
    /// initialization errors surface before any data is consumed.
    pub fn new(config: TcpClientConfig, stop: Arc<AtomicBool>) -> Result<Self> {
        let target = format!("{}:{}", config.host, config.port);
        let addr = target
            .to_socket_addrs()
            .map_err(|_| Error::InvalidAddress(target.clone()))?
            .next()
            .ok_or_else(|| Error::InvalidAddress(target))?;
        Ok(Self { addr, config, stop })
    }

    /// Bytes still carried by the alignment buffer when the loop exited.
    /// These never formed a whole word and are dropped.
    pub fn run(&self, mut on_data: impl FnMut(&[u8])) -> u64 {
        let mut recv_buf = [0u8; RECV_BUFFER_SIZE];
        // Carry for the 1..7 trailing bytes of a read that split a word.
        let mut carry: Vec<u8> = Vec::with_capacity(8);
        let mut delivery: Vec<u8> = Vec::with_capacity(RECV_BUFFER_SIZE + 8);

        while !self.stop.load(Ordering::Relaxed) {
            let stream = match self.connect() {
                Ok(stream) => stream,
                Err(e) => {
                    debug!("connect to {} failed: {e}", self.addr);
                    std::thread::sleep(RECONNECT_BACKOFF);
                    continue;
                }
            };
            info!("connected to {}", self.addr);
            carry.clear();

            let disconnected = self.receive_loop(stream, &mut recv_buf, &mut carry, &mut delivery, &mut on_data);

            if disconnected && self.config.exit_on_disconnect {
                info!("peer closed, exiting on disconnect");
                break;
            }
        }
        carry.len() as u64
    }

    fn connect(&self) -> std::io::Result<TcpStream> {
        let stream = TcpStream::connect_timeout(&self.addr, Duration::from_secs(2))?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        Ok(stream)
    }

    /// Reads until stop or disconnect. Returns true if the peer closed the
    /// connection.
    fn receive_loop(
        &self,
        mut stream: TcpStream,
        recv_buf: &mut [u8],
        carry: &mut Vec<u8>,
        delivery: &mut Vec<u8>,
        on_data: &mut impl FnMut(&[u8]),
    ) -> bool {
        while !self.stop.load(Ordering::Relaxed) {
            let received = match stream.read(recv_buf) {
                Ok(0) => {
                    info!("peer closed connection");
                    return true;
                }
                Ok(n) => n,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::Interrupted =>
                {
                    continue;
                }
                Err(e) => {
                    warn!("recv error: {e}, reconnecting");
                    return false;
                }
            };

            delivery.clear();
            delivery.extend_from_slice(carry);
            delivery.extend_from_slice(&recv_buf[..received]);
            carry.clear();

            let aligned = delivery.len() - delivery.len() % 8;
            if aligned < delivery.len() {
                carry.extend_from_slice(&delivery[aligned..]);
            }
            if aligned > 0 {
                on_data(&delivery[..aligned]);
            }
        }
        false
    }
}

//! Forwarded sessions through an already-open connection.
//!
//! libssh2 sessions need a real socket, so a second session is carried
//! over a loopback TCP pair: one end goes to the new session, the other is
//! pumped through a `direct-tcpip` channel on the base connection.

use super::connection::Connection;
use super::is_would_block;
use crate::error::{AppError, AppResult};
use ssh2::Channel;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const PUMP_BUFFER_BYTES: usize = 32 * 1024;
const IDLE_SLEEP: Duration = Duration::from_millis(2);

/// Background pump between a loopback socket and a `direct-tcpip` channel.
pub struct Tunnel {
    target: String,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Tunnel {
    /// Open a channel from `base` to `host:port` and return the local
    /// stream that speaks to it.
    pub fn open(base: Arc<Connection>, host: &str, port: u16) -> AppResult<(TcpStream, Tunnel)> {
        if !base.is_open() {
            return Err(AppError::Connection(format!(
                "Base connection {} is closed",
                base.name()
            )));
        }

        let channel = base
            .with_session(|session| session.channel_direct_tcpip(host, port, None))
            .map_err(|e| {
                AppError::Connection(format!(
                    "Failed to open tunnel to {}:{} through {}: {}",
                    host,
                    port,
                    base.name(),
                    e
                ))
            })?;

        let listener = TcpListener::bind("127.0.0.1:0")?;
        let client = TcpStream::connect(listener.local_addr()?)?;
        let (socket, _) = listener.accept()?;
        socket.set_nonblocking(true)?;
        socket.set_nodelay(true)?;
        client.set_nodelay(true)?;

        let target = format!("{}:{}", host, port);
        let stop = Arc::new(AtomicBool::new(false));
        let pump_stop = stop.clone();
        let pump_target = target.clone();
        let handle = thread::Builder::new()
            .name(format!("tunnel-{}", target))
            .spawn(move || pump(base, channel, socket, pump_stop, pump_target))?;

        tracing::info!("Tunnel to {} opened", target);
        Ok((
            client,
            Tunnel {
                target,
                stop,
                handle: Some(handle),
            },
        ))
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("Tunnel pump for {} panicked", self.target);
            }
        }
    }
}

enum Flow {
    Open { progressed: bool },
    Closed,
}

fn pump(
    base: Arc<Connection>,
    mut channel: Channel,
    mut socket: TcpStream,
    stop: Arc<AtomicBool>,
    target: String,
) {
    let mut buf = vec![0u8; PUMP_BUFFER_BYTES];
    let mut to_remote: Vec<u8> = Vec::new();
    let mut to_local: Vec<u8> = Vec::new();
    let mut local_open = true;

    while !stop.load(Ordering::SeqCst) {
        let mut progressed = false;

        if local_open {
            match socket.read(&mut buf) {
                Ok(0) => local_open = false,
                Ok(n) => {
                    to_remote.extend_from_slice(&buf[..n]);
                    progressed = true;
                }
                Err(ref e) if is_would_block(e) => {}
                Err(e) => {
                    tracing::debug!("Tunnel {} local read failed: {}", target, e);
                    break;
                }
            }
        }

        let flow = base.with_session(|session| {
            session.set_blocking(false);
            let flow = pump_channel(&mut channel, &mut to_remote, &mut to_local, &mut buf);
            session.set_blocking(true);
            flow
        });
        match flow {
            Ok(Flow::Open { progressed: p }) => progressed |= p,
            Ok(Flow::Closed) => break,
            Err(e) => {
                tracing::debug!("Tunnel {} channel failed: {}", target, e);
                break;
            }
        }

        while !to_local.is_empty() {
            match socket.write(&to_local) {
                Ok(0) => break,
                Ok(n) => {
                    to_local.drain(..n);
                    progressed = true;
                }
                Err(ref e) if is_would_block(e) => break,
                Err(e) => {
                    tracing::debug!("Tunnel {} local write failed: {}", target, e);
                    return close(&base, channel, &target);
                }
            }
        }

        if !local_open && to_remote.is_empty() {
            break;
        }
        if !progressed {
            thread::sleep(IDLE_SLEEP);
        }
    }

    close(&base, channel, &target);
}

fn pump_channel(
    channel: &mut Channel,
    to_remote: &mut Vec<u8>,
    to_local: &mut Vec<u8>,
    buf: &mut [u8],
) -> io::Result<Flow> {
    let mut progressed = false;

    while !to_remote.is_empty() {
        match channel.write(to_remote) {
            Ok(0) => break,
            Ok(n) => {
                to_remote.drain(..n);
                progressed = true;
            }
            Err(ref e) if is_would_block(e) => break,
            Err(e) => return Err(e),
        }
    }

    loop {
        match channel.read(buf) {
            Ok(0) => {
                if channel.eof() {
                    return Ok(Flow::Closed);
                }
                break;
            }
            Ok(n) => {
                to_local.extend_from_slice(&buf[..n]);
                progressed = true;
            }
            Err(ref e) if is_would_block(e) => break,
            Err(e) => return Err(e),
        }
    }

    Ok(Flow::Open { progressed })
}

fn close(base: &Connection, mut channel: Channel, target: &str) {
    if base.is_open() {
        if let Err(e) = base.with_session(|_| channel.close()) {
            tracing::debug!("Tunnel {} channel close failed: {}", target, e);
        }
    }
    tracing::info!("Tunnel to {} closed", target);
}

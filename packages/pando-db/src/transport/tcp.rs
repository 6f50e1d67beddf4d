//! TCP transport.
//!
//! Frame format (both directions):
//! ```text
//! [len: u32 big-endian][mode: u8][payload: len - 1 bytes]
//! ```
//! `mode` is `PUSH` (no reply), `REQUEST` (peer answers with one `REPLY`
//! frame on the same connection) or `REPLY`.
//!
//! Each bound address gets an accept thread and one thread per inbound
//! connection. Outbound pushes reuse one cached connection per
//! destination, which keeps them FIFO; requests open a fresh connection.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};

use super::{Envelope, Transport};
use crate::address::Address;
use crate::error::{PandoError, Result};

const MODE_PUSH: u8 = 0;
const MODE_REQUEST: u8 = 1;
const MODE_REPLY: u8 = 2;

const MAX_FRAME: usize = 256 * 1024 * 1024;
const ACCEPT_POLL: Duration = Duration::from_millis(50);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Framing
// ============================================================================

fn read_frame<R: Read>(stream: &mut R) -> io::Result<Option<(u8, Vec<u8>)>> {
    // Read 4-byte length prefix (big-endian)
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Bad frame length: {} bytes", len),
        ));
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    let mode = buf.remove(0);
    Ok(Some((mode, buf)))
}

fn write_frame<W: Write>(stream: &mut W, mode: u8, payload: &[u8]) -> io::Result<()> {
    let len = u32::try_from(payload.len() + 1)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(&[mode])?;
    stream.write_all(payload)?;
    stream.flush()
}

// ============================================================================
// Inbound connections
// ============================================================================

fn handle_connection(mut stream: TcpStream, inbox: Sender<Envelope>, addr: Address) {
    loop {
        let (mode, payload) = match read_frame(&mut stream) {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(%addr, error = %e, "connection read error");
                break;
            }
        };

        match mode {
            MODE_PUSH => {
                if inbox.send(Envelope::push(payload)).is_err() {
                    break;
                }
            }
            MODE_REQUEST => {
                let (env, reply) = Envelope::request(payload);
                if inbox.send(env).is_err() {
                    break;
                }
                let Ok(bytes) = reply.recv() else { break };
                if let Err(e) = write_frame(&mut stream, MODE_REPLY, &bytes) {
                    tracing::debug!(%addr, error = %e, "reply write error");
                    break;
                }
            }
            other => {
                tracing::warn!(%addr, mode = other, "unexpected frame mode, closing connection");
                break;
            }
        }
    }
}

fn accept_loop(listener: TcpListener, inbox: Sender<Envelope>, addr: Address, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(e) = stream.set_nonblocking(false) {
                    tracing::warn!(%addr, error = %e, "cannot configure connection");
                    continue;
                }
                let _ = stream.set_nodelay(true);
                let inbox = inbox.clone();
                thread::spawn(move || handle_connection(stream, inbox, addr));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                tracing::warn!(%addr, error = %e, "accept error");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

// ============================================================================
// TcpTransport
// ============================================================================

#[derive(Default)]
pub struct TcpTransport {
    links: Mutex<HashMap<Address, TcpStream>>,
    listeners: Mutex<HashMap<Address, Arc<AtomicBool>>>,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn connect(to: Address) -> Result<TcpStream> {
        let stream = TcpStream::connect_timeout(&to.socket_addr(), CONNECT_TIMEOUT)
            .map_err(|e| PandoError::Unreachable { addr: to, reason: e.to_string() })?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    fn unreachable(to: Address, e: io::Error) -> PandoError {
        PandoError::Unreachable { addr: to, reason: e.to_string() }
    }
}

impl Transport for TcpTransport {
    fn bind(&self, addr: Address) -> Result<Receiver<Envelope>> {
        let listener = TcpListener::bind(addr.socket_addr())?;
        listener.set_nonblocking(true)?;

        let (tx, rx) = unbounded();
        let stop = Arc::new(AtomicBool::new(false));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(addr, Arc::clone(&stop));

        thread::Builder::new()
            .name(format!("pando-accept-{}", addr))
            .spawn(move || accept_loop(listener, tx, addr, stop))?;

        tracing::debug!(%addr, port = addr.port(), "listening");
        Ok(rx)
    }

    fn unbind(&self, addr: Address) {
        if let Some(stop) = self.listeners.lock().unwrap_or_else(PoisonError::into_inner).remove(&addr) {
            stop.store(true, Ordering::Relaxed);
        }
    }

    fn push(&self, to: Address, payload: Vec<u8>) -> Result<()> {
        let mut links = self.links.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(stream) = links.get_mut(&to) {
            if write_frame(stream, MODE_PUSH, &payload).is_ok() {
                return Ok(());
            }
            // Stale connection; reconnect once below.
            links.remove(&to);
        }

        let mut stream = Self::connect(to)?;
        write_frame(&mut stream, MODE_PUSH, &payload).map_err(|e| Self::unreachable(to, e))?;
        links.insert(to, stream);
        Ok(())
    }

    fn request(&self, to: Address, payload: Vec<u8>, timeout: Duration) -> Result<Vec<u8>> {
        let mut stream = Self::connect(to)?;
        stream.set_read_timeout(Some(timeout))?;
        write_frame(&mut stream, MODE_REQUEST, &payload).map_err(|e| Self::unreachable(to, e))?;

        match read_frame(&mut stream) {
            Ok(Some((MODE_REPLY, bytes))) => Ok(bytes),
            Ok(Some((mode, _))) => Err(PandoError::Unreachable {
                addr: to,
                reason: format!("unexpected frame mode {}", mode),
            }),
            Ok(None) => Err(PandoError::Unreachable { addr: to, reason: "closed before reply".to_string() }),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Err(PandoError::Timeout(to))
            }
            Err(e) => Err(Self::unreachable(to, e)),
        }
    }
}

//! Transport listeners (§6, component A): accept client connections on
//! whichever endpoints were configured and hand each one off, as a plain
//! bidirectional byte stream, to a connection worker (§4.2).
//!
//! A chain doesn't care which transport a byte stream arrived on, so
//! every concrete stream type is boxed behind [`BoxedStream`] the moment
//! it's accepted; everything above this module only ever sees `Read +
//! Write + Send`.

use std::env;
use std::fs;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use log::{info, warn};
use readwrite::ReadWrite;
use vsock::{VsockListener, VsockStream};

/// Anything a connection worker can read from and write to, regardless
/// of which transport produced it.
pub trait ReadWriteStream: Read + Write + Send {
    /// Half-shut the write direction, unblocking any in-flight read on
    /// the peer and any in-flight write of ours (§5 watchdog). Best
    /// effort: transports without a meaningful half-close (stdio) just
    /// no-op.
    fn shutdown_write(&self) -> io::Result<()>;

    /// The underlying fd, for the watchdog to shut down from a thread
    /// that doesn't otherwise own this stream. `None` for transports
    /// with no single fd to shut down (stdio).
    fn raw_fd(&self) -> Option<RawFd> {
        None
    }
}

/// Shut down the write half of a raw socket fd. Used by the §5 watchdog,
/// which only ever has the fd, not the stream object itself (that's
/// owned by the blocked connection thread it's trying to unstick).
pub fn shutdown_write_fd(fd: RawFd) -> io::Result<()> {
    use nix::sys::socket::{shutdown, Shutdown};
    shutdown(fd, Shutdown::Write).map_err(io::Error::from)
}

macro_rules! impl_socket_shutdown {
    ($t:ty) => {
        impl ReadWriteStream for $t {
            fn shutdown_write(&self) -> io::Result<()> {
                shutdown_write_fd(self.as_raw_fd())
            }

            fn raw_fd(&self) -> Option<RawFd> {
                Some(self.as_raw_fd())
            }
        }
    };
}

impl_socket_shutdown!(TcpStream);
impl_socket_shutdown!(UnixStream);
impl_socket_shutdown!(VsockStream);

impl<R: Read + Send, W: Write + Send> ReadWriteStream for ReadWrite<R, W> {
    fn shutdown_write(&self) -> io::Result<()> {
        // A stdio pair has no socket-level half-close; the watchdog's
        // timeout is best-effort here and relies on the dead-connection
        // check on the next I/O instead.
        Ok(())
    }
}

/// A connected client stream plus a human-readable description of where
/// it came from, used in log messages and the one-shot CLI error paths.
pub struct Accepted {
    pub stream: Box<dyn ReadWriteStream>,
    pub peer: String,
}

/// One endpoint to listen on, as configured on the command line.
#[derive(Debug, Clone)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
    Vsock { cid: u32, port: u32 },
    /// The socket is already connected on stdin/stdout (e.g. launched by
    /// inetd-style supervision); serves exactly one connection.
    Stdin,
    /// Sockets handed to us pre-bound by systemd-style socket
    /// activation, found via `LISTEN_FDS`/`LISTEN_PID`.
    Activated,
}

impl Endpoint {
    /// The percent-encoded NBD URI for this endpoint (§6). `None` for
    /// the transports that don't have one (stdin, activation).
    pub fn uri(&self, export: &str, tls: bool) -> Option<String> {
        let scheme_suffix = if tls { "s" } else { "" };
        let export = percent_encode(export);
        match self {
            Endpoint::Tcp { host, port } => {
                Some(format!("nbd{scheme_suffix}://{host}:{port}/{export}"))
            }
            Endpoint::Unix(path) => Some(format!(
                "nbd{scheme_suffix}+unix://?socket={}",
                percent_encode(&path.to_string_lossy())
            )),
            Endpoint::Vsock { cid, port } => {
                Some(format!("nbd{scheme_suffix}+vsock://{cid}:{port}/{export}"))
            }
            Endpoint::Stdin | Endpoint::Activated => None,
        }
    }
}

fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// A bound (but not yet accepting-in-a-loop) listener for one endpoint.
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
    Vsock(VsockListener),
    /// Stdin is a single pre-connected stream, not something you accept
    /// on repeatedly.
    Stdin,
    Activated(Vec<RawFd>),
}

impl Listener {
    pub fn bind(endpoint: &Endpoint) -> io::Result<Self> {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let addr = (host.as_str(), *port)
                    .to_socket_addrs()?
                    .next()
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no such host"))?;
                Ok(Listener::Tcp(TcpListener::bind(addr)?))
            }
            Endpoint::Unix(path) => {
                if path.exists() {
                    let _ = fs::remove_file(path);
                }
                Ok(Listener::Unix(UnixListener::bind(path)?))
            }
            Endpoint::Vsock { cid, port } => {
                let addr = vsock::VsockAddr::new(*cid, *port);
                Ok(Listener::Vsock(
                    VsockListener::bind(&addr).map_err(io::Error::from)?,
                ))
            }
            Endpoint::Stdin => Ok(Listener::Stdin),
            Endpoint::Activated => Ok(Listener::Activated(activated_fds()?)),
        }
    }

    /// Accept one connection, blocking until a client arrives. For
    /// [`Listener::Stdin`], the first call returns the pre-connected
    /// stdio pair and every subsequent call returns an error (there's
    /// only ever one).
    pub fn accept(&self) -> io::Result<Accepted> {
        match self {
            Listener::Tcp(l) => {
                let (stream, addr) = l.accept()?;
                stream.set_nodelay(true)?;
                Ok(Accepted {
                    stream: Box::new(stream),
                    peer: addr.to_string(),
                })
            }
            Listener::Unix(l) => {
                let (stream, _addr) = l.accept()?;
                Ok(Accepted {
                    stream: Box::new(stream),
                    peer: "unix socket".to_string(),
                })
            }
            Listener::Vsock(l) => {
                let (stream, addr) = l.accept().map_err(io::Error::from)?;
                Ok(Accepted {
                    stream: Box::new(stream),
                    peer: format!("{addr:?}"),
                })
            }
            Listener::Stdin => Ok(Accepted {
                stream: Box::new(ReadWrite::new(io::stdin(), io::stdout())),
                peer: "stdin".to_string(),
            }),
            Listener::Activated(fds) => {
                // Only the first fd is used as a single-socket listener
                // here; multiple activated sockets would each need their
                // own accept loop, same as any other transport.
                let fd = *fds
                    .first()
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no activated fds"))?;
                let listener = unsafe { TcpListener::from_raw_fd(fd) };
                let (stream, addr) = listener.accept()?;
                // Don't let the temporary `TcpListener` close the
                // inherited fd when it's dropped; it's owned by the
                // process, not by us.
                std::mem::forget(listener);
                Ok(Accepted {
                    stream: Box::new(stream),
                    peer: addr.to_string(),
                })
            }
        }
    }
}

/// Parse the systemd socket-activation protocol: `LISTEN_PID` must match
/// our pid, `LISTEN_FDS` gives a count of consecutive fds starting at 3.
fn activated_fds() -> io::Result<Vec<RawFd>> {
    let pid: u32 = env::var("LISTEN_PID")
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "LISTEN_PID not set"))?;
    if pid != std::process::id() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "LISTEN_PID does not match this process",
        ));
    }
    let count: i32 = env::var("LISTEN_FDS")
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "LISTEN_FDS not set"))?;
    Ok((0..count).map(|i| 3 + i).collect())
}

/// Bind every configured endpoint and return the bound listeners
/// alongside the endpoint each one was bound from (for URI emission).
pub fn bind_all(endpoints: &[Endpoint]) -> io::Result<Vec<(Endpoint, Listener)>> {
    let mut out = Vec::with_capacity(endpoints.len());
    for endpoint in endpoints {
        let listener = Listener::bind(endpoint)?;
        out.push((endpoint.clone(), listener));
    }
    Ok(out)
}

/// Run `accept` in a loop on `listener`, calling `on_connection` for
/// each accepted stream on a fresh thread. Returns only on a listener
/// error (e.g. the socket was closed during shutdown).
pub fn accept_loop<F>(listener: Listener, on_connection: F)
where
    F: Fn(Box<dyn ReadWriteStream>, String) + Send + Sync + 'static,
{
    let on_connection = std::sync::Arc::new(on_connection);
    match listener {
        Listener::Stdin => {
            // Exactly one connection; run it on this thread rather than
            // spawning, since there's nothing left to accept afterward.
            match listener_accept_once(&Listener::Stdin) {
                Ok(accepted) => on_connection(accepted.stream, accepted.peer),
                Err(err) => warn!("stdin transport failed: {err}"),
            }
        }
        listener => loop {
            match listener.accept() {
                Ok(accepted) => {
                    info!("accepted connection from {}", accepted.peer);
                    let on_connection = std::sync::Arc::clone(&on_connection);
                    std::thread::spawn(move || on_connection(accepted.stream, accepted.peer));
                }
                Err(err) => {
                    warn!("transport accept failed: {err}");
                    break;
                }
            }
        },
    }
}

fn listener_accept_once(listener: &Listener) -> io::Result<Accepted> {
    listener.accept()
}

/// A transport endpoint description used only for tests exercising
/// [`Endpoint::uri`] without binding a real socket.
#[cfg(test)]
pub fn tcp_endpoint(host: &str, port: u16) -> Endpoint {
    Endpoint::Tcp {
        host: host.to_string(),
        port,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_uri_has_no_tls_suffix_without_tls() {
        let ep = tcp_endpoint("example.com", 10809);
        assert_eq!(
            ep.uri("disk", false).unwrap(),
            "nbd://example.com:10809/disk"
        );
    }

    #[test]
    fn tcp_uri_gets_s_suffix_with_tls() {
        let ep = tcp_endpoint("example.com", 10809);
        assert_eq!(
            ep.uri("disk", true).unwrap(),
            "nbds://example.com:10809/disk"
        );
    }

    #[test]
    fn unix_uri_percent_encodes_the_socket_path() {
        let ep = Endpoint::Unix(PathBuf::from("/tmp/my socket"));
        assert_eq!(
            ep.uri("", false).unwrap(),
            "nbd+unix://?socket=%2Ftmp%2Fmy%20socket"
        );
    }

    #[test]
    fn stdin_and_activated_endpoints_have_no_uri() {
        assert!(Endpoint::Stdin.uri("x", false).is_none());
        assert!(Endpoint::Activated.uri("x", false).is_none());
    }
}

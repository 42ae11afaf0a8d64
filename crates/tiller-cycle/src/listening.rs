//! Listening endpoint table
//!
//! Endpoints bound by the previous generation on the same address are
//! transferred, not rebound, so a reload never produces a bind conflict
//! or an accept gap. Socket ownership moves from the previous to the new
//! cycle exactly once, at commit.

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, RawFd};
use tiller_core::{Error, Result};

/// A listening socket handed to this process by the previous binary
/// during an upgrade.
#[derive(Debug)]
pub struct InheritedListener {
    /// Address the socket is bound to
    pub addr: SocketAddr,
    /// The inherited socket
    pub listener: TcpListener,
}

/// One listening endpoint owned by a cycle.
pub struct Listening {
    addr: SocketAddr,
    backlog: i32,
    inherited: bool,
    socket: Mutex<Option<TcpListener>>,
}

impl std::fmt::Debug for Listening {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listening")
            .field("addr", &self.addr)
            .field("inherited", &self.inherited)
            .field("open", &self.socket.lock().is_some())
            .finish()
    }
}

impl Listening {
    pub(crate) fn new(
        addr: SocketAddr,
        backlog: i32,
        inherited: bool,
        socket: TcpListener,
    ) -> Self {
        Self {
            addr,
            backlog,
            inherited,
            socket: Mutex::new(Some(socket)),
        }
    }

    /// Bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Configured backlog.
    pub fn backlog(&self) -> i32 {
        self.backlog
    }

    /// Whether the socket was taken over from the previous generation
    /// rather than freshly bound.
    pub fn is_inherited(&self) -> bool {
        self.inherited
    }

    /// Whether this endpoint still holds its socket.
    pub fn is_open(&self) -> bool {
        self.socket.lock().is_some()
    }

    /// Transfer the socket out of this endpoint.
    ///
    /// Used when a successor cycle takes over the address, and by the
    /// event subsystem when it assumes ownership of the accept loop. Once
    /// transferred, this cycle must not close the socket; the slot is
    /// empty from now on.
    pub fn take_socket(&self) -> Option<TcpListener> {
        self.socket.lock().take()
    }

    /// Put a socket back after a failed transfer, so a rolled-back
    /// successor leaves this cycle exactly as it found it.
    pub(crate) fn restore_socket(&self, socket: TcpListener) {
        *self.socket.lock() = Some(socket);
    }

    /// Duplicate the underlying socket without transferring ownership.
    pub fn try_clone_socket(&self) -> Result<Option<TcpListener>> {
        match self.socket.lock().as_ref() {
            Some(listener) => Ok(Some(listener.try_clone()?)),
            None => Ok(None),
        }
    }

    /// Raw descriptor, for the upgrade inheritance list.
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.socket.lock().as_ref().map(|l| l.as_raw_fd())
    }
}

/// Bind a fresh listening socket.
pub(crate) fn bind_listener(addr: SocketAddr, backlog: i32) -> Result<TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };

    let bind = |e| Error::Bind {
        addr: addr.to_string(),
        source: e,
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(bind)?;
    socket.set_reuse_address(true).map_err(bind)?;
    socket.bind(&addr.into()).map_err(bind)?;
    socket.listen(backlog).map_err(bind)?;

    tracing::debug!(%addr, backlog, "listening socket bound");
    Ok(socket.into())
}

//! Sockets reserved by a session, at most one per role.

use std::time::Duration;

use crate::socket::Socket;

/// Reserved primary and secondary sockets.
///
/// Cloning shares the same sockets, bumping their reference counts.
#[derive(Debug, Clone, Default)]
pub(crate) struct SocketBinding {
    master: Option<Socket>,
    slave: Option<Socket>,
}

impl SocketBinding {
    /// Returns a reserved socket usable for the request, if any.
    ///
    /// The primary is always usable. The secondary only when secondary reads
    /// are allowed.
    pub(crate) fn usable(&self, allow_secondary: bool) -> Option<Socket> {
        if let Some(master) = &self.master {
            return Some(master.clone());
        }
        match &self.slave {
            Some(slave) if allow_secondary => Some(slave.clone()),
            _ => None,
        }
    }

    /// Reserves `socket` in the slot matching its server role.
    pub(crate) fn reserve(&mut self, socket: Socket) {
        let slot = if socket.server().master {
            &mut self.master
        } else {
            &mut self.slave
        };
        if let Some(previous) = slot.replace(socket) {
            tracing::warn!(addr = %previous.addr(), "replaced reserved socket");
        }
    }

    pub(crate) fn has_master(&self) -> bool {
        self.master.is_some()
    }

    pub(crate) fn has_slave(&self) -> bool {
        self.slave.is_some()
    }

    pub(crate) fn release_all(&mut self) {
        self.master = None;
        self.slave = None;
    }

    pub(crate) fn release_slave(&mut self) {
        self.slave = None;
    }

    /// Returns every reserved socket.
    pub(crate) fn sockets(&self) -> Vec<Socket> {
        self.master.iter().chain(self.slave.iter()).cloned().collect()
    }

    pub(crate) fn master_addr(&self) -> Option<String> {
        self.master.as_ref().map(Socket::addr)
    }

    pub(crate) fn slave_addr(&self) -> Option<String> {
        self.slave.as_ref().map(Socket::addr)
    }

    pub(crate) fn set_timeout(&self, timeout: Duration) {
        for socket in self.master.iter().chain(self.slave.iter()) {
            socket.set_timeout(timeout);
        }
    }
}

// Command server - accepts TCP sessions and hands each one to the dispatcher

use std::io::{self, ErrorKind};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::dispatcher::{Dispatcher, SessionEnd};
use crate::protocol::Reply;
use crate::slots::BootSlots;

/// Concurrent sessions served before new peers get `BUSY`.
pub const DEFAULT_MAX_SESSIONS: usize = 4;

/// Stack of a session thread. Holds the line buffer and one OTA chunk.
#[cfg(target_os = "espidf")]
pub const SESSION_STACK_SIZE: usize = 8 * 1024;

/// Host threads also unwind through the simulated restart, which needs far
/// more stack than the device ever uses.
#[cfg(not(target_os = "espidf"))]
pub const SESSION_STACK_SIZE: usize = 64 * 1024;

const LISTENER_STACK_SIZE: usize = 4 * 1024;

pub struct CommandServer<S: BootSlots + 'static> {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher<S>>,
    max_sessions: usize,
    session_stack_size: usize,
    active: Arc<AtomicUsize>,
}

impl<S: BootSlots + 'static> CommandServer<S> {
    pub fn bind(
        addr: impl ToSocketAddrs,
        dispatcher: Arc<Dispatcher<S>>,
        max_sessions: usize,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(false)?;
        Ok(Self {
            listener,
            dispatcher,
            max_sessions,
            session_stack_size: SESSION_STACK_SIZE,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn with_session_stack_size(mut self, bytes: usize) -> Self {
        self.session_stack_size = bytes;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Number of sessions currently being served.
    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Run the accept loop on its own thread.
    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("tcp_srv".to_string())
            .stack_size(LISTENER_STACK_SIZE)
            .spawn(move || self.run())
    }

    pub fn run(self) {
        match self.local_addr() {
            Ok(addr) => log::info!("Command server listening on {addr}"),
            Err(_) => log::info!("Command server listening"),
        }

        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => self.admit(stream, addr),
                Err(e) => {
                    if e.kind() != ErrorKind::WouldBlock {
                        log::error!("Accept error: {e:?}");
                    }
                    thread::sleep(Duration::from_millis(100));
                }
            }
        }
    }

    fn admit(&self, mut stream: TcpStream, addr: SocketAddr) {
        let Some(slot) = SessionSlot::claim(&self.active, self.max_sessions) else {
            log::warn!("{addr}: session limit ({}) reached, refusing", self.max_sessions);
            let _ = Reply::Busy.write_to(&mut stream);
            let _ = stream.shutdown(Shutdown::Both);
            return;
        };

        log::info!("{addr}: connected ({} active)", self.active_sessions());
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("{addr}: set_nodelay failed: {e}");
        }

        let dispatcher = Arc::clone(&self.dispatcher);
        let spawned = thread::Builder::new()
            .name("cli".to_string())
            .stack_size(self.session_stack_size)
            .spawn(move || {
                let _slot = slot;
                session(&dispatcher, stream, addr);
            });

        if let Err(e) = spawned {
            log::error!("{addr}: could not start session: {e}");
        }
    }
}

fn session<S: BootSlots>(dispatcher: &Dispatcher<S>, mut stream: TcpStream, addr: SocketAddr) {
    let peer = addr.to_string();
    match dispatcher.serve(&mut stream, &peer) {
        Ok(SessionEnd::PeerClosed) => log::info!("{peer}: disconnected"),
        Ok(SessionEnd::UpdateFailed(e)) => log::warn!("{peer}: closing after failed update ({})", e.code()),
        Err(e) => log::warn!("{peer}: session error: {e}"),
    }
    let _ = stream.shutdown(Shutdown::Both);
}

/// Counted session; releases its place when dropped.
struct SessionSlot(Arc<AtomicUsize>);

impl SessionSlot {
    fn claim(active: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| Self(Arc::clone(active)))
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

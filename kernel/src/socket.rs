//! Local stream sockets built on pipes.
//!
//! A socket is UNBOUND at birth, may become the LISTENER of a port, and
//! a Connect/Accept rendezvous turns an unbound client plus a fresh
//! server-side socket into a PEER pair joined by two pipes, one per
//! direction.
//!
//! The port map holds a weak handle per port; strong ownership of a
//! listener lives in its FCB stream and in every in-flight Accept or
//! Connect, so a listener stays alive exactly while someone can still
//! touch it. A connection request is shared between the connecting
//! client and the listener queue; its result is carried by the
//! `admitted` flag alone, and listener close cancels whatever is still
//! queued.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use spin::Mutex;

use minnow_api::{Fid, Port, ShutdownMode, SysError, SysResult, MAX_PORT, NOPORT};

use crate::file::{self, Stream};
use crate::pipe::{self, PipeRef};
use crate::sched::{self, Cond, KernelLock, WaitClass};

pub(crate) type SocketRef = Arc<Mutex<SocketCb>>;

/// Socket control block.
pub(crate) struct SocketCb {
    port: Port,
    kind: SocketKind,
}

enum SocketKind {
    Unbound,
    Listener(ListenerCb),
    Peer(PeerCb),
}

struct ListenerCb {
    queue: VecDeque<Arc<ConnRequest>>,
    req_available: Cond,
}

struct PeerCb {
    peer: Weak<Mutex<SocketCb>>,
    read_pipe: Option<PipeRef>,
    write_pipe: Option<PipeRef>,
}

/// One in-flight connection attempt, owned by the connecting client and
/// borrowed by the listener queue.
struct ConnRequest {
    admitted: AtomicBool,
    cancelled: AtomicBool,
    peer: SocketRef,
    connected_cv: Cond,
}

struct PortMap {
    ports: Vec<Option<Weak<Mutex<SocketCb>>>>,
}

static PORT_MAP: Mutex<PortMap> = Mutex::new(PortMap { ports: Vec::new() });

impl PortMap {
    fn reset(&mut self) {
        self.ports.clear();
        self.ports.resize_with(MAX_PORT as usize + 1, || None);
    }

    fn lookup(&self, port: Port) -> Option<SocketRef> {
        self.ports.get(port as usize)?.as_ref()?.upgrade()
    }

    fn bind(&mut self, port: Port, sock: &SocketRef) {
        self.ports[port as usize] = Some(Arc::downgrade(sock));
    }

    fn clear(&mut self, port: Port) {
        if let Some(slot) = self.ports.get_mut(port as usize) {
            *slot = None;
        }
    }
}

/// True while `port` is still bound to exactly this listener.
fn same_listener(port: Port, sock: &SocketRef) -> bool {
    PORT_MAP
        .lock()
        .lookup(port)
        .is_some_and(|cur| Arc::ptr_eq(&cur, sock))
}

struct SocketStream {
    sock: SocketRef,
}

impl Stream for SocketStream {
    fn read(&self, k: &mut KernelLock, buf: &mut [u8]) -> SysResult<usize> {
        let pipe = {
            let s = self.sock.lock();
            match &s.kind {
                SocketKind::Peer(p) => {
                    p.read_pipe.clone().ok_or(SysError::BadFileDescriptor)?
                }
                _ => return Err(SysError::NotSupported),
            }
        };
        pipe::pipe_read(&pipe, k, buf)
    }

    fn write(&self, k: &mut KernelLock, buf: &[u8]) -> SysResult<usize> {
        let pipe = {
            let s = self.sock.lock();
            match &s.kind {
                SocketKind::Peer(p) => {
                    p.write_pipe.clone().ok_or(SysError::BadFileDescriptor)?
                }
                _ => return Err(SysError::NotSupported),
            }
        };
        pipe::pipe_write(&pipe, k, buf)
    }

    fn close(&self) -> SysResult<()> {
        socket_close(&self.sock)
    }

    fn as_socket(&self) -> Option<SocketRef> {
        Some(self.sock.clone())
    }
}

enum Teardown {
    Peer {
        write_pipe: Option<PipeRef>,
        read_pipe: Option<PipeRef>,
        peer_gone: bool,
    },
    Listener {
        requests: VecDeque<Arc<ConnRequest>>,
        req_available: Cond,
        port: Port,
    },
    Nothing,
}

fn socket_close(sock: &SocketRef) -> SysResult<()> {
    let teardown = {
        let mut s = sock.lock();
        let port = s.port;
        match &mut s.kind {
            SocketKind::Peer(p) => Teardown::Peer {
                write_pipe: p.write_pipe.take(),
                read_pipe: p.read_pipe.take(),
                peer_gone: p.peer.upgrade().is_none(),
            },
            SocketKind::Listener(l) => Teardown::Listener {
                requests: std::mem::take(&mut l.queue),
                req_available: l.req_available.clone(),
                port,
            },
            SocketKind::Unbound => Teardown::Nothing,
        }
    };
    match teardown {
        Teardown::Peer {
            write_pipe,
            read_pipe,
            peer_gone,
        } => {
            if peer_gone {
                log::trace!("closing a peer socket whose counterpart is already gone");
            }
            if let Some(wp) = write_pipe {
                let _ = pipe::close_writer(&wp);
            }
            if let Some(rp) = read_pipe {
                let _ = pipe::close_reader(&rp);
            }
        }
        Teardown::Listener {
            requests,
            req_available,
            port,
        } => {
            // Whoever is still queued loses: wake them unadmitted.
            for req in requests {
                req.cancelled.store(true, Ordering::SeqCst);
                req.connected_cv.broadcast();
            }
            // Accepters re-check the port map and bail out.
            req_available.broadcast();
            PORT_MAP.lock().clear(port);
        }
        Teardown::Nothing => {}
    }
    Ok(())
}

fn lookup_socket(fid: Fid) -> SysResult<SocketRef> {
    file::stream_of(fid)?
        .as_socket()
        .ok_or(SysError::NotSupported)
}

/// Create an unbound socket carrying `port` (0 = no port). Returns its
/// fid.
pub fn socket(port: Port) -> SysResult<Fid> {
    let mut k = sched::lock();
    do_socket(&mut k, port).map(|(fid, _)| fid)
}

fn do_socket(_k: &mut KernelLock, port: Port) -> SysResult<(Fid, SocketRef)> {
    if !(0..=MAX_PORT).contains(&port) {
        return Err(SysError::InvalidArgument);
    }
    let sock: SocketRef = Arc::new(Mutex::new(SocketCb {
        port,
        kind: SocketKind::Unbound,
    }));
    let stream: Arc<dyn Stream> = Arc::new(SocketStream { sock: sock.clone() });
    let fids = file::reserve(&[stream])?;
    Ok((fids[0], sock))
}

/// Turn an unbound, port-carrying socket into the listener of its port.
pub fn listen(fid: Fid) -> SysResult<()> {
    let _k = sched::lock();
    let sock = lookup_socket(fid)?;
    let mut s = sock.lock();
    if s.port == NOPORT {
        return Err(SysError::InvalidArgument);
    }
    if !matches!(s.kind, SocketKind::Unbound) {
        return Err(SysError::InvalidArgument);
    }
    let mut pm = PORT_MAP.lock();
    if pm.lookup(s.port).is_some() {
        return Err(SysError::ResourceBusy);
    }
    s.kind = SocketKind::Listener(ListenerCb {
        queue: VecDeque::new(),
        req_available: Cond::new(),
    });
    pm.bind(s.port, &sock);
    log::debug!("port {} is now listening", s.port);
    Ok(())
}

/// Wait for a connection request on a listener and build the peer pair.
/// Returns the fid of the server-side peer socket.
pub fn accept(lfid: Fid) -> SysResult<Fid> {
    let mut k = sched::lock();
    do_accept(&mut k, lfid)
}

fn do_accept(k: &mut KernelLock, lfid: Fid) -> SysResult<Fid> {
    let lsock = lookup_socket(lfid)?;
    let (port, req_available) = {
        let s = lsock.lock();
        match &s.kind {
            SocketKind::Listener(l) => (s.port, l.req_available.clone()),
            _ => return Err(SysError::NotSupported),
        }
    };

    // The local `lsock` handle keeps the listener alive for the whole
    // call, exactly like the in-flight reference of the classic
    // refcount discipline.
    let request = loop {
        if !same_listener(port, &lsock) {
            return Err(SysError::NotFound);
        }
        {
            let mut s = lsock.lock();
            match &mut s.kind {
                SocketKind::Listener(l) => {
                    if let Some(req) = l.queue.pop_front() {
                        break req;
                    }
                }
                _ => return Err(SysError::NotSupported),
            }
        }
        req_available.wait(k, WaitClass::Io);
    };

    // Server-side peer socket, bound to the same port.
    let (server_fid, server_sock) = match do_socket(k, port) {
        Ok(pair) => pair,
        Err(err) => {
            // Leave the request unadmitted so the client sees failure.
            request.connected_cv.signal();
            return Err(err);
        }
    };

    // Two pipes, one per direction: p1 carries server → client bytes,
    // p2 carries client → server bytes.
    let p1 = pipe::new_pipe();
    let p2 = pipe::new_pipe();
    {
        let mut srv = server_sock.lock();
        srv.kind = SocketKind::Peer(PeerCb {
            peer: Arc::downgrade(&request.peer),
            read_pipe: Some(p2.clone()),
            write_pipe: Some(p1.clone()),
        });
    }
    {
        let mut cli = request.peer.lock();
        cli.kind = SocketKind::Peer(PeerCb {
            peer: Arc::downgrade(&server_sock),
            read_pipe: Some(p1),
            write_pipe: Some(p2),
        });
    }

    request.admitted.store(true, Ordering::SeqCst);
    request.connected_cv.signal();
    log::debug!("port {} accepted a connection", port);
    Ok(server_fid)
}

/// Connect an unbound socket to the listener of `port`, waiting at most
/// `timeout` for admission.
pub fn connect(fid: Fid, port: Port, timeout: Duration) -> SysResult<()> {
    let mut k = sched::lock();
    do_connect(&mut k, fid, port, timeout)
}

fn do_connect(k: &mut KernelLock, fid: Fid, port: Port, timeout: Duration) -> SysResult<()> {
    let sock = lookup_socket(fid)?;
    if !matches!(sock.lock().kind, SocketKind::Unbound) {
        return Err(SysError::InvalidArgument);
    }
    if !(1..=MAX_PORT).contains(&port) {
        return Err(SysError::InvalidArgument);
    }
    let listener = PORT_MAP.lock().lookup(port).ok_or(SysError::NotFound)?;

    let request = Arc::new(ConnRequest {
        admitted: AtomicBool::new(false),
        cancelled: AtomicBool::new(false),
        peer: sock,
        connected_cv: Cond::new(),
    });
    {
        let mut l = listener.lock();
        match &mut l.kind {
            SocketKind::Listener(lb) => {
                lb.queue.push_back(request.clone());
                lb.req_available.signal();
            }
            _ => return Err(SysError::NotFound),
        }
    }

    // The `listener` handle pins the listener while we sleep (the
    // connect side of the in-flight reference discipline).
    let deadline = Instant::now() + timeout;
    while !request.admitted.load(Ordering::SeqCst) && !request.cancelled.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        request
            .connected_cv
            .timedwait(k, WaitClass::Io, deadline - now);
    }

    // A timed-out request may still sit on the queue; unlink it so the
    // server cannot admit a caller that is gone.
    {
        let mut l = listener.lock();
        if let SocketKind::Listener(lb) = &mut l.kind {
            if let Some(pos) = lb.queue.iter().position(|r| Arc::ptr_eq(r, &request)) {
                lb.queue.remove(pos);
            }
        }
    }

    if request.admitted.load(Ordering::SeqCst) {
        Ok(())
    } else {
        Err(SysError::ConnectionRefused)
    }
}

/// Shut down one or both directions of a peer socket.
pub fn shut_down(fid: Fid, how: ShutdownMode) -> SysResult<()> {
    let _k = sched::lock();
    let sock = lookup_socket(fid)?;
    let mut s = sock.lock();
    let peer = match &mut s.kind {
        SocketKind::Peer(p) => p,
        _ => return Err(SysError::NotSupported),
    };
    let (read_pipe, write_pipe) = match how {
        ShutdownMode::Read => (peer.read_pipe.take(), None),
        ShutdownMode::Write => (None, peer.write_pipe.take()),
        ShutdownMode::Both => (peer.read_pipe.take(), peer.write_pipe.take()),
    };
    drop(s);
    if let Some(rp) = read_pipe {
        let _ = pipe::close_reader(&rp);
    }
    if let Some(wp) = write_pipe {
        let _ = pipe::close_writer(&wp);
    }
    Ok(())
}

pub(crate) fn reset() {
    PORT_MAP.lock().reset();
}

//! TCP front end.
//!
//! Each connection gets a thread that reads requests in order and waits for
//! each response before reading the next. Requests from every connection go
//! through one bounded queue to a single engine thread that owns the
//! [`Database`], so commands run one at a time in arrival order.

use std::io::{self, BufReader, BufWriter, Write};
use std::net::{Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use ahash::AHashMap;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::collections::CollectionError;
use crate::database::Database;
use crate::protocol::{ProtocolError, ProtocolResult, Request, Response, read_frame, write_message};

/// Requests waiting for the engine before senders block
pub const ENGINE_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Database error: {0}")]
    Database(#[from] CollectionError),

    #[error("The {0} thread panicked")]
    ThreadPanicked(&'static str),
}

pub type ServerResult<T> = Result<T, ServerError>;

enum EngineMessage {
    Job {
        request: Request,
        reply: Sender<Response>,
    },
    Shutdown,
}

type Connections = Arc<Mutex<AHashMap<u64, TcpStream>>>;

/// A running server. Dropping the handle leaves the server running; call
/// [`ServerHandle::shutdown`] to stop it and flush the database.
pub struct ServerHandle {
    local_addr: SocketAddr,
    stopping: Arc<AtomicBool>,
    connections: Connections,
    jobs: SyncSender<EngineMessage>,
    accept_thread: JoinHandle<Vec<JoinHandle<()>>>,
    engine_thread: JoinHandle<Database>,
}

/// Bind `addr` and start serving `database`
pub fn start<A: ToSocketAddrs>(addr: A, database: Database) -> ServerResult<ServerHandle> {
    let listener = TcpListener::bind(addr)?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, "listening");

    let (jobs, queue) = mpsc::sync_channel(ENGINE_QUEUE_DEPTH);
    let engine_thread = thread::Builder::new()
        .name("pagedb-engine".into())
        .spawn(move || run_engine(database, queue))?;

    let stopping = Arc::new(AtomicBool::new(false));
    let connections: Connections = Arc::new(Mutex::new(AHashMap::new()));
    let accept_thread = {
        let stopping = Arc::clone(&stopping);
        let connections = Arc::clone(&connections);
        let jobs = jobs.clone();
        thread::Builder::new()
            .name("pagedb-accept".into())
            .spawn(move || accept_loop(listener, jobs, stopping, connections))?
    };

    Ok(ServerHandle {
        local_addr,
        stopping,
        connections,
        jobs,
        accept_thread,
        engine_thread,
    })
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, close every connection, let the engine finish queued
    /// commands, then flush and close the database
    pub fn shutdown(self) -> ServerResult<()> {
        info!(local_addr = %self.local_addr, "stopping server");
        self.stopping.store(true, Ordering::SeqCst);
        // Wake the accept loop so it sees the flag
        let _ = TcpStream::connect(wake_addr(self.local_addr));
        let workers = self
            .accept_thread
            .join()
            .map_err(|_| ServerError::ThreadPanicked("accept"))?;

        if let Ok(connections) = self.connections.lock() {
            for stream in connections.values() {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
        for worker in workers {
            if worker.join().is_err() {
                warn!("connection thread panicked");
            }
        }

        // The engine may already be gone if it panicked; join reports that.
        let _ = self.jobs.send(EngineMessage::Shutdown);
        let mut database = self
            .engine_thread
            .join()
            .map_err(|_| ServerError::ThreadPanicked("engine"))?;
        database.shutdown()?;
        info!("server stopped");
        Ok(())
    }
}

/// An unspecified listen address cannot be connected to on every platform
fn wake_addr(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(v4) if v4.ip().is_unspecified() => {
            SocketAddr::from((Ipv4Addr::LOCALHOST, v4.port()))
        }
        SocketAddr::V6(v6) if v6.ip().is_unspecified() => {
            SocketAddr::from((Ipv6Addr::LOCALHOST, v6.port()))
        }
        other => other,
    }
}

fn run_engine(mut database: Database, queue: Receiver<EngineMessage>) -> Database {
    while let Ok(message) = queue.recv() {
        match message {
            EngineMessage::Job { request, reply } => {
                let response = database.execute(request);
                // The connection may have gone away in the meantime
                let _ = reply.send(response);
            }
            EngineMessage::Shutdown => break,
        }
    }
    debug!("engine stopped");
    database
}

fn accept_loop(
    listener: TcpListener,
    jobs: SyncSender<EngineMessage>,
    stopping: Arc<AtomicBool>,
    connections: Connections,
) -> Vec<JoinHandle<()>> {
    let mut next_id = 0u64;
    let mut workers: Vec<JoinHandle<()>> = Vec::new();

    for stream in listener.incoming() {
        if stopping.load(Ordering::SeqCst) {
            break;
        }
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "failed to accept connection");
                continue;
            }
        };
        workers.retain(|worker| !worker.is_finished());

        let id = next_id;
        next_id += 1;
        match stream.try_clone() {
            Ok(tracked) => {
                if let Ok(mut connections) = connections.lock() {
                    connections.insert(id, tracked);
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to track connection");
                continue;
            }
        }

        let jobs = jobs.clone();
        let connections = Arc::clone(&connections);
        let spawned = thread::Builder::new()
            .name(format!("pagedb-conn-{id}"))
            .spawn(move || {
                let peer = stream.peer_addr().ok();
                debug!(?peer, "connection opened");
                match serve_connection(stream, jobs) {
                    Ok(()) => debug!(?peer, "connection closed"),
                    Err(e) => warn!(?peer, error = %e, "connection failed"),
                }
                if let Ok(mut connections) = connections.lock() {
                    connections.remove(&id);
                }
            });
        match spawned {
            Ok(worker) => workers.push(worker),
            Err(e) => error!(error = %e, "failed to spawn connection thread"),
        }
    }
    workers
}

fn serve_connection(stream: TcpStream, jobs: SyncSender<EngineMessage>) -> ProtocolResult<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);
    let (reply, responses) = mpsc::channel();

    loop {
        let frame = match read_frame(&mut reader) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            // A socket closed by shutdown reads as a reset on some platforms
            Err(ProtocolError::Io(e)) if e.kind() == io::ErrorKind::ConnectionReset => return Ok(()),
            Err(e) => return Err(e),
        };

        let response = match serde_json::from_slice::<Request>(&frame) {
            Ok(request) => {
                let job = EngineMessage::Job {
                    request,
                    reply: reply.clone(),
                };
                if jobs.send(job).is_err() {
                    return Ok(());
                }
                match responses.recv() {
                    Ok(response) => response,
                    Err(_) => return Ok(()),
                }
            }
            Err(e) => {
                warn!(error = %e, "malformed request");
                Response::Error(format!("MalformedRequest: {e}"))
            }
        };

        write_message(&mut writer, &response)?;
        writer.flush()?;
    }
}

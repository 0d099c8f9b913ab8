//! `recv`: network collector.
//!
//! A long-lived listener accepts recorder connections and writes every
//! inbound session to `<dest>/<name>` exactly as a local recording would have
//! laid it out. Each connection is handled by a pool worker and writes its
//! own task stream files; the only state shared between connections is the
//! per-directory registry writer.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use workerpool::thunk::{Thunk, ThunkWorker};
use workerpool::Pool;

use super::protocol::{read_message, validate_name, Message};
use crate::error::TraceError;
use crate::session::registry::normalize_line;
use crate::session::writer::{kernel_stream_path, stream_path};
use crate::session::{RegistryWriter, SessionInfo};
use crate::trace::constants::NET_READ_TIMEOUT;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Registry writers shared by every connection, one per session directory.
#[derive(Debug, Default)]
pub struct RegistryTable {
    writers: Mutex<HashMap<PathBuf, Arc<RegistryWriter>>>,
}

impl RegistryTable {
    pub fn writer_for(&self, dir: &Path) -> Result<Arc<RegistryWriter>> {
        let mut writers = self
            .writers
            .lock()
            .map_err(|_| anyhow::anyhow!("registry table lock poisoned"))?;
        if let Some(writer) = writers.get(dir) {
            return Ok(Arc::clone(writer));
        }
        let writer = Arc::new(RegistryWriter::open(dir)?);
        writers.insert(dir.to_path_buf(), Arc::clone(&writer));
        Ok(writer)
    }
}

fn protocol_error(peer: &str, message: &str) -> anyhow::Error {
    TraceError::protocol(peer, message).into()
}

struct OpenSession {
    dir: PathBuf,
    registry: Arc<RegistryWriter>,
    registry_lines: usize,
    streams: HashMap<(u32, bool), File>,
}

impl OpenSession {
    fn open(dir: PathBuf, info: &SessionInfo, registries: &RegistryTable) -> Result<Self> {
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create session directory {}", dir.display()))?;
        if SessionInfo::load(&dir).is_ok() {
            // Another host is recording into the same session.
            debug!("session {} already exists, keeping its info", dir.display());
        } else {
            info.store(&dir)?;
        }
        let registry = registries.writer_for(&dir)?;
        Ok(Self {
            dir,
            registry,
            registry_lines: 0,
            streams: HashMap::new(),
        })
    }

    fn write_chunk(&mut self, task_id: u32, kernel: bool, data: &str) -> Result<()> {
        if !self.streams.contains_key(&(task_id, kernel)) {
            let path = if kernel {
                kernel_stream_path(&self.dir, task_id)
            } else {
                stream_path(&self.dir, task_id)
            };
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("failed to open stream {}", path.display()))?;
            self.streams.insert((task_id, kernel), file);
        }
        if let Some(file) = self.streams.get_mut(&(task_id, kernel)) {
            file.write_all(data.as_bytes())?;
        }
        Ok(())
    }

    fn close(mut self) -> Result<PathBuf> {
        for file in self.streams.values_mut() {
            file.flush()?;
        }
        Ok(self.dir)
    }
}

/// One recorder connection, possibly carrying several sessions in a row.
pub struct Connection<R: Read> {
    reader: R,
    peer: String,
    dest: PathBuf,
    registries: Arc<RegistryTable>,
    open: Vec<OpenSession>,
}

impl<R: Read> Connection<R> {
    pub fn new(reader: R, peer: &str, dest: &Path, registries: Arc<RegistryTable>) -> Self {
        Self {
            reader,
            peer: peer.to_string(),
            dest: dest.to_path_buf(),
            registries,
            open: Vec::new(),
        }
    }

    /// Flag every session still open on this connection as incomplete and
    /// return the outermost one.
    fn abandon(&mut self) -> Option<PathBuf> {
        let mut root = None;
        while let Some(session) = self.open.pop() {
            if let Err(err) = SessionInfo::mark_incomplete(&session.dir) {
                warn!("failed to flag {} incomplete: {:#}", session.dir.display(), err);
            }
            warn!(
                "{}: session {} cut short, marked incomplete",
                self.peer,
                session.dir.display()
            );
            root = session.close().ok();
        }
        root
    }

    /// Receive one session. Returns the directory it was written to, or
    /// `None` when the peer closed the connection between sessions.
    ///
    /// If the peer disappears mid-session the partial session is kept,
    /// flagged incomplete, and returned.
    pub fn receive_session(&mut self) -> Result<Option<PathBuf>> {
        loop {
            let message = match read_message(&mut self.reader, &self.peer) {
                Ok(Some(message)) => message,
                Ok(None) => return Ok(self.abandon()),
                Err(err) => {
                    self.abandon();
                    return Err(err.into());
                }
            };

            match self.handle(message) {
                Ok(Some(dir)) => return Ok(Some(dir)),
                Ok(None) => {}
                Err(err) => {
                    self.abandon();
                    return Err(err);
                }
            }
        }
    }

    fn handle(&mut self, message: Message) -> Result<Option<PathBuf>> {
        match message {
            Message::SessionStart { name, info } => {
                if !self.open.is_empty() {
                    return Err(protocol_error(&self.peer, "session_start inside an open session"));
                }
                validate_name(&name, &self.peer)?;
                let dir = self.dest.join(&name);
                info!("{}: receiving session {}", self.peer, dir.display());
                self.open
                    .push(OpenSession::open(dir, &info, &self.registries)?);
            }
            Message::ChildSessionStart { name, info } => {
                validate_name(&name, &self.peer)?;
                let Some(parent) = self.open.last() else {
                    return Err(protocol_error(&self.peer, "child_session_start outside a session"));
                };
                let parent_dir = parent.dir.clone();
                let mut parent_info = SessionInfo::load(&parent_dir)?;
                parent_info.add_child_session(&name);
                parent_info.store(&parent_dir)?;

                let dir = parent_dir.join(&name);
                debug!("{}: nested session {}", self.peer, dir.display());
                self.open
                    .push(OpenSession::open(dir, &info, &self.registries)?);
            }
            Message::Registry { record } => {
                let Some(session) = self.open.last_mut() else {
                    return Err(protocol_error(&self.peer, "registry record outside a session"));
                };
                let lineno = session.registry_lines;
                session.registry_lines += 1;
                match normalize_line(&record, lineno) {
                    Ok(Some(line)) => session.registry.append_line(&line)?,
                    Ok(None) => {}
                    Err(err) => warn!("{}: {}", self.peer, err),
                }
            }
            Message::TaskChunk {
                task_id,
                kernel,
                data,
            } => {
                let Some(session) = self.open.last_mut() else {
                    return Err(protocol_error(&self.peer, "task chunk outside a session"));
                };
                session.write_chunk(task_id, kernel, &data)?;
            }
            Message::ChildSessionEnd => {
                if self.open.len() < 2 {
                    return Err(protocol_error(&self.peer, "child_session_end without a child session"));
                }
                if let Some(child) = self.open.pop() {
                    child.close()?;
                }
            }
            Message::SessionEnd => {
                if self.open.len() != 1 {
                    return Err(protocol_error(&self.peer, "session_end with unbalanced child sessions"));
                }
                if let Some(session) = self.open.pop() {
                    let dir = session.close()?;
                    info!("{}: session {} complete", self.peer, dir.display());
                    return Ok(Some(dir));
                }
            }
        }
        Ok(None)
    }
}

/// What one connection delivered.
#[derive(Debug, Default)]
pub struct ConnectionReport {
    pub peer: String,
    pub sessions: Vec<PathBuf>,
    pub error: Option<String>,
}

fn serve_connection(
    stream: TcpStream,
    peer: String,
    dest: PathBuf,
    registries: Arc<RegistryTable>,
) -> ConnectionReport {
    let mut report = ConnectionReport {
        peer: peer.clone(),
        ..Default::default()
    };
    if let Err(err) = stream
        .set_nonblocking(false)
        .and_then(|_| stream.set_read_timeout(Some(NET_READ_TIMEOUT)))
    {
        report.error = Some(err.to_string());
        return report;
    }

    let mut conn = Connection::new(stream, &peer, &dest, registries);
    loop {
        match conn.receive_session() {
            Ok(Some(dir)) => report.sessions.push(dir),
            Ok(None) => break,
            Err(err) => {
                warn!("{:#}", err);
                report.error = Some(format!("{err:#}"));
                break;
            }
        }
    }
    report
}

pub struct Receiver {
    dest: PathBuf,
    listener: TcpListener,
    registries: Arc<RegistryTable>,
    stop: Arc<AtomicBool>,
    workers: usize,
}

impl Receiver {
    pub fn bind<A: ToSocketAddrs>(addr: A, dest: &Path) -> Result<Self> {
        fs::create_dir_all(dest)
            .with_context(|| format!("failed to create {}", dest.display()))?;
        let listener = TcpListener::bind(addr).context("failed to bind receiver socket")?;
        listener.set_nonblocking(true)?;
        let workers = thread::available_parallelism().map_or(4, |n| n.get());
        Ok(Self {
            dest: dest.to_path_buf(),
            listener,
            registries: Arc::new(RegistryTable::default()),
            stop: Arc::new(AtomicBool::new(false)),
            workers,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Flag that makes [`Receiver::serve`] return once set.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Accept connections until the stop flag is raised. Returns every
    /// session directory received, in completion order.
    pub fn serve(&self) -> Result<Vec<PathBuf>> {
        let pool = Pool::<ThunkWorker<ConnectionReport>>::new(self.workers);
        let (tx, rx) = channel();
        let mut sessions = Vec::new();
        let mut collect = |report: ConnectionReport| {
            debug!(
                "{}: connection done, {} session(s){}",
                report.peer,
                report.sessions.len(),
                report
                    .error
                    .as_ref()
                    .map_or_else(String::new, |e| format!(", error: {e}"))
            );
            sessions.extend(report.sessions);
        };

        info!("listening on {}", self.local_addr()?);
        while !self.stop.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    let peer = addr.to_string();
                    debug!("accepted connection from {}", peer);
                    let dest = self.dest.clone();
                    let registries = Arc::clone(&self.registries);
                    pool.execute_to(
                        tx.clone(),
                        Thunk::of(move || serve_connection(stream, peer, dest, registries)),
                    );
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(err) => warn!("accept failed: {}", err),
            }
            while let Ok(report) = rx.try_recv() {
                collect(report);
            }
        }

        info!("stopping receiver, waiting for open connections");
        pool.join();
        while let Ok(report) = rx.try_recv() {
            collect(report);
        }
        Ok(sessions)
    }
}

//! Per-connection client handlers
//!
//! A handler thread pops accepted sockets off the connection queue and runs
//! each connection through the session state machine: welcome banner, auth
//! loop, then the command loop. The handler owns the socket and the
//! session's mutable state; file work is delegated to the workers through
//! the task queue, and the handler blocks on the session's response slot
//! until the result comes back, which is what keeps responses in issue
//! order within one session.

use std::io;
use std::net::TcpStream;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::auth::{self, AuthError};
use crate::channel::ClientChannel;
use crate::request::{parse, Command, Task, TaskKind};
use crate::server::ServerState;
use crate::session::Session;

const WELCOME: &[u8] = b"Welcome to the Stash file server\n\
Commands:\n\
SIGNUP <user> <pass>\n\
LOGIN <user> <pass>\n";

const MENU: &[u8] = b"Commands:\n\
UPLOAD <filename> <size>\n\
DOWNLOAD <filename>\n\
DELETE <filename>\n\
LIST\n\
QUIT\n";

/// Pool body: serve connections until the queue reports shutdown-and-empty.
pub(crate) fn client_loop(state: &ServerState) {
    while let Some(stream) = state.conn_queue.pop() {
        // Connections still queued when the drain starts are not served.
        if !state.running.load(Ordering::Acquire) {
            continue;
        }
        if let Err(err) = handle_connection(state, stream) {
            debug!("connection ended with error: {}", err);
        }
    }
    debug!("client handler exiting");
}

fn handle_connection(state: &ServerState, stream: TcpStream) -> io::Result<()> {
    let peer = stream.peer_addr();
    let manager_handle = stream.try_clone()?;
    let session = match state.sessions.create(manager_handle) {
        Some(session) => session,
        None => {
            let mut chan = ClientChannel::new(stream);
            let _ = chan.send(b"ERROR: server busy\n");
            return Ok(());
        }
    };
    let id = session.id();
    match peer {
        Ok(addr) => info!("session {} connected from {}", id, addr),
        Err(_) => info!("session {} connected", id),
    }

    let mut chan = ClientChannel::new(stream);
    let result = serve(state, &session, &mut chan);

    state.sessions.mark_inactive(id);
    info!(
        "session {} closing after {}s, {} ops",
        id,
        session.age_secs(),
        session.operations()
    );
    state.sessions.destroy(id);
    result
}

fn serve(
    state: &ServerState,
    session: &Arc<Session>,
    chan: &mut ClientChannel,
) -> io::Result<()> {
    chan.send(WELCOME)?;
    match auth_loop(state, session, chan)? {
        Some(username) => {
            chan.send(MENU)?;
            command_loop(state, session, chan, &username)
        }
        // Disconnected or quit before authenticating.
        None => Ok(()),
    }
}

/// Read lines until the client authenticates. `Ok(None)` means the
/// connection is done (disconnect or QUIT); errors are send failures.
fn auth_loop(
    state: &ServerState,
    session: &Arc<Session>,
    chan: &mut ClientChannel,
) -> io::Result<Option<String>> {
    loop {
        let line = match read_command_line(chan)? {
            Some(line) => line,
            None => return Ok(None),
        };
        let command = match parse(&line) {
            Ok(command) => command,
            Err(err) => {
                chan.send(format!("ERROR: {}\n", err).as_bytes())?;
                continue;
            }
        };
        match command {
            Command::Signup { username, password } => {
                match auth::signup(&state.store, &username, &password) {
                    Ok(()) => {
                        session.set_authenticated(&username);
                        chan.send(b"SIGNUP OK\n")?;
                        return Ok(Some(username));
                    }
                    Err(AuthError::UserExists) => {
                        chan.send(b"SIGNUP ERROR: User already exists\n")?;
                    }
                    Err(err) => {
                        warn!("signup for '{}' failed: {}", username, err);
                        chan.send(b"SIGNUP ERROR: Server error\n")?;
                    }
                }
            }
            Command::Login { username, password } => {
                match auth::login(&state.store, &username, &password) {
                    Ok(()) => {
                        session.set_authenticated(&username);
                        chan.send(b"LOGIN OK\n")?;
                        return Ok(Some(username));
                    }
                    Err(AuthError::UserNotFound) => {
                        chan.send(b"LOGIN ERROR: User not found\n")?;
                    }
                    Err(AuthError::InvalidPassword) => {
                        chan.send(b"LOGIN ERROR: Invalid password\n")?;
                    }
                    Err(err) => {
                        warn!("login for '{}' failed: {}", username, err);
                        chan.send(b"LOGIN ERROR: Server error\n")?;
                    }
                }
            }
            Command::Quit => {
                chan.send(b"Goodbye!\n")?;
                return Ok(None);
            }
            _ => {
                chan.send(b"ERROR: Please sign up or log in first\n")?;
            }
        }
    }
}

fn command_loop(
    state: &ServerState,
    session: &Arc<Session>,
    chan: &mut ClientChannel,
    username: &str,
) -> io::Result<()> {
    loop {
        let line = match read_command_line(chan)? {
            Some(line) => line,
            None => return Ok(()),
        };
        let command = match parse(&line) {
            Ok(command) => command,
            Err(err) => {
                chan.send(format!("ERROR: {}\n", err).as_bytes())?;
                continue;
            }
        };

        let task = match command {
            Command::Quit => {
                chan.send(b"Goodbye!\n")?;
                return Ok(());
            }
            Command::Signup { .. } | Command::Login { .. } => {
                chan.send(b"ERROR: Already logged in\n")?;
                continue;
            }
            Command::List => file_task(session, username, TaskKind::List, String::new(), 0, None),
            Command::Download { filename } => {
                file_task(session, username, TaskKind::Download, filename, 0, None)
            }
            Command::Delete { filename } => {
                file_task(session, username, TaskKind::Delete, filename, 0, None)
            }
            Command::Upload { filename, size } => {
                match receive_upload(state, session, chan, username, filename, size)? {
                    Some(task) => task,
                    None => continue,
                }
            }
        };

        session.slot().reset();
        if state.task_queue.push(task).is_err() {
            let _ = chan.send(b"ERROR: Server shutting down\n");
            return Ok(());
        }

        let response = session.slot().wait();
        if !session.is_active() {
            // Torn down while the worker was computing; drop the result.
            return Ok(());
        }
        if let Some(data) = &response.data {
            if let Err(err) = chan.send(data) {
                debug!("send failed on session {}: {}", session.id(), err);
                state.sessions.mark_inactive(session.id());
                return Ok(());
            }
        }
        if let Err(err) = chan.send(response.message.as_bytes()) {
            debug!("send failed on session {}: {}", session.id(), err);
            state.sessions.mark_inactive(session.id());
            return Ok(());
        }
    }
}

/// Quota pre-check, payload allocation and payload receive for one UPLOAD.
///
/// The quota is checked before a single payload byte is read; the header
/// carries the size, so an over-quota upload is refused without consuming
/// the transfer. Returns `Ok(None)` when an error reply was sent and the
/// command loop should continue.
fn receive_upload(
    state: &ServerState,
    session: &Arc<Session>,
    chan: &mut ClientChannel,
    username: &str,
    filename: String,
    size: u64,
) -> io::Result<Option<Task>> {
    match state.store.check_quota(username, size) {
        Ok(true) => {}
        Ok(false) => {
            chan.send(b"UPLOAD ERROR: Quota exceeded\n")?;
            return Ok(None);
        }
        Err(err) => {
            warn!("quota check for '{}' failed: {}", username, err);
            chan.send(b"UPLOAD ERROR: Server error\n")?;
            return Ok(None);
        }
    }

    let size_bytes = match usize::try_from(size) {
        Ok(size_bytes) => size_bytes,
        Err(_) => {
            chan.send(b"UPLOAD ERROR: memory allocation failed\n")?;
            return Ok(None);
        }
    };
    let mut payload = Vec::new();
    if payload.try_reserve_exact(size_bytes).is_err() {
        chan.send(b"UPLOAD ERROR: memory allocation failed\n")?;
        return Ok(None);
    }

    let received = chan.read_payload(size_bytes, &mut payload)?;
    if received < size_bytes {
        debug!(
            "upload of '{}' incomplete: got {} of {} bytes",
            filename, received, size_bytes
        );
        // The stream is dead past this point; best-effort reply, then close.
        let _ = chan.send(b"UPLOAD ERROR: Incomplete upload data\n");
        state.sessions.mark_inactive(session.id());
        return Ok(None);
    }

    Ok(Some(file_task(
        session,
        username,
        TaskKind::Upload,
        filename,
        size,
        Some(payload),
    )))
}

fn file_task(
    session: &Arc<Session>,
    username: &str,
    kind: TaskKind,
    filename: String,
    size: u64,
    payload: Option<Vec<u8>>,
) -> Task {
    Task {
        kind,
        session_id: session.id(),
        username: username.to_owned(),
        filename,
        size,
        payload,
    }
}

/// One protocol line, with framing violations (over-long or non-UTF-8
/// lines) answered before the connection is dropped.
fn read_command_line(chan: &mut ClientChannel) -> io::Result<Option<String>> {
    match chan.read_line() {
        Ok(line) => Ok(line),
        Err(err) if err.kind() == io::ErrorKind::InvalidData => {
            let _ = chan.send(format!("ERROR: {}\n", err).as_bytes());
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

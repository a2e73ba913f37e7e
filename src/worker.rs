//! Worker pool
//!
//! Workers pop tasks from the task queue, serialise conflicting operations
//! through the per-file lock registry, touch the filesystem and the metadata
//! store, and publish the result into the owning session's response slot.
//! A worker never blocks on a client handler, and a worker that finds its
//! session gone simply drops the result (any owned buffer is freed with it).

use std::fs;
use std::io;
use std::path::Path;

use log::{debug, warn};

use crate::reply::{Response, ResponseStatus};
use crate::request::{Task, TaskKind};
use crate::server::ServerState;

/// Pool body: drain tasks until the queue reports shutdown-and-empty.
pub(crate) fn worker_loop(state: &ServerState) {
    while let Some(mut task) = state.task_queue.pop() {
        debug!(
            "processing {} '{}' for '{}' (session {})",
            task.kind, task.filename, task.username, task.session_id
        );
        let response = execute(state, &mut task);
        publish(state, task.session_id, response);
    }
    debug!("worker exiting");
}

/// Run one task against the filesystem and the metadata store.
fn execute(state: &ServerState, task: &mut Task) -> Response {
    let user_dir = state.config.storage_root.join(&task.username);
    if let Err(err) = fs::create_dir_all(&user_dir) {
        warn!("cannot create user directory for '{}': {}", task.username, err);
        return map_io_error(task.kind, &err);
    }

    if task.kind == TaskKind::List {
        return list_dir(&user_dir);
    }

    // Exclusive per-file section for everything that names a file.
    let lock = match state.locks.acquire(&task.username, &task.filename) {
        Ok(lock) => lock,
        Err(_) => {
            return Response::error(
                ResponseStatus::Error,
                format!("{} ERROR: Could not acquire file lock\n", task.kind),
            );
        }
    };
    let _excl = lock.lock();

    let path = user_dir.join(&task.filename);
    match task.kind {
        TaskKind::Upload => upload(state, task, &path),
        TaskKind::Download => download(&path),
        TaskKind::Delete => delete(state, task, &path),
        TaskKind::List => unreachable!("handled above"),
    }
}

fn upload(state: &ServerState, task: &mut Task, path: &Path) -> Response {
    let payload = task.payload.take().unwrap_or_default();
    if let Err(err) = fs::write(path, &payload) {
        // Do not leave a truncated file behind.
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(rm) if rm.kind() == io::ErrorKind::NotFound => {}
            Err(rm) => warn!("cannot remove partial file {}: {}", path.display(), rm),
        }
        return map_io_error(TaskKind::Upload, &err);
    }

    if let Err(err) = state
        .store
        .upsert_file(&task.username, &task.filename, payload.len() as u64)
    {
        // The filesystem write already succeeded; the operation reports OK.
        warn!(
            "metadata update failed after upload of '{}/{}': {}",
            task.username, task.filename, err
        );
    }
    Response::ok("UPLOAD OK\n")
}

fn download(path: &Path) -> Response {
    match fs::read(path) {
        Ok(bytes) => {
            debug!("read {} bytes from {}", bytes.len(), path.display());
            // The leading newline is the delimiter the client scans for.
            Response::with_data("\nDOWNLOAD OK\n", bytes)
        }
        Err(err) => map_io_error(TaskKind::Download, &err),
    }
}

fn delete(state: &ServerState, task: &Task, path: &Path) -> Response {
    match fs::remove_file(path) {
        Ok(()) => {
            if let Err(err) = state.store.remove_file(&task.username, &task.filename) {
                warn!(
                    "metadata update failed after delete of '{}/{}': {}",
                    task.username, task.filename, err
                );
            }
            Response::ok("DELETE OK\n")
        }
        Err(err) => map_io_error(TaskKind::Delete, &err),
    }
}

fn list_dir(user_dir: &Path) -> Response {
    let entries = match fs::read_dir(user_dir) {
        Ok(entries) => entries,
        Err(err) => return map_io_error(TaskKind::List, &err),
    };
    let mut body = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => return map_io_error(TaskKind::List, &err),
        };
        let name = entry.file_name();
        let name = name.to_string_lossy();
        // Metadata sidecars from older deployments are not user files.
        if name == "metadata.txt" {
            continue;
        }
        body.extend_from_slice(name.as_bytes());
        body.push(b'\n');
    }
    Response::with_data("LIST END\n", body)
}

/// Translate an OS error into a protocol status plus message line.
fn map_io_error(kind: TaskKind, err: &io::Error) -> Response {
    match err.raw_os_error() {
        Some(libc::ENOENT) => Response::error(
            ResponseStatus::FileNotFound,
            format!("{} ERROR: File not found\n", kind),
        ),
        Some(libc::EACCES) | Some(libc::EPERM) => Response::error(
            ResponseStatus::PermissionDenied,
            format!("{} ERROR: Permission denied\n", kind),
        ),
        Some(libc::ENOSPC) => Response::error(
            ResponseStatus::Error,
            format!("{} ERROR: No space left on device\n", kind),
        ),
        Some(libc::ENAMETOOLONG) => Response::error(
            ResponseStatus::Error,
            format!("{} ERROR: Filename too long\n", kind),
        ),
        _ => Response::error(ResponseStatus::Error, format!("{} ERROR: {}\n", kind, err)),
    }
}

/// Hand the result to the session, unless the client has gone away in the
/// meantime; the dropped response frees any owned buffer.
fn publish(state: &ServerState, session_id: u64, response: Response) {
    match state.sessions.get(session_id) {
        Some(session) => {
            session.slot().set(response);
            session.record_operation();
        }
        None => {
            debug!(
                "session {} inactive or gone, dropping response",
                session_id
            );
        }
    }
}

//! Client sessions and the session table
//!
//! A session is the server-side state for one TCP connection: authentication
//! status, bookkeeping counters and the response slot a worker publishes
//! into. Sessions live in a fixed-capacity open-addressed table so a worker
//! can re-look a session up by id when its task completes; a record whose
//! connection has gone away stays in the table, marked inactive, until the
//! owning handler destroys it. A late worker therefore sees one of three
//! well-defined outcomes: present-and-active, present-but-inactive, or
//! absent.

use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::reply::ResponseSlot;

/// Default capacity of the session table.
pub const MAX_SESSIONS: usize = 256;

/// Per-session bookkeeping guarded by the session mutex.
#[derive(Debug)]
struct SessionState {
    username: String,
    authenticated: bool,
    created_at: SystemTime,
    authenticated_at: Option<SystemTime>,
    last_activity: SystemTime,
    operations: u64,
}

/// State for one client connection.
///
/// The handler thread exclusively owns the connection socket; the copy held
/// here exists so the manager can unblock a handler stuck in `recv` during
/// shutdown or teardown. Workers touch a session only through
/// [`SessionManager::get`] and the response slot.
pub struct Session {
    id: u64,
    active: AtomicBool,
    slot: ResponseSlot,
    stream: Mutex<Option<TcpStream>>,
    state: Mutex<SessionState>,
}

impl Session {
    fn new(id: u64, stream: TcpStream) -> Self {
        let now = SystemTime::now();
        Session {
            id,
            active: AtomicBool::new(true),
            slot: ResponseSlot::new(),
            stream: Mutex::new(Some(stream)),
            state: Mutex::new(SessionState {
                username: String::new(),
                authenticated: false,
                created_at: now,
                authenticated_at: None,
                last_activity: now,
                operations: 0,
            }),
        }
    }

    /// Session identifier, non-zero.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Lock-free read of the active flag; workers check this before
    /// publishing a result.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// The response rendezvous for this session.
    pub fn slot(&self) -> &ResponseSlot {
        &self.slot
    }

    /// Stamp the session with its authenticated user.
    pub fn set_authenticated(&self, username: &str) {
        let mut state = self.state.lock();
        state.username = username.to_owned();
        state.authenticated = true;
        let now = SystemTime::now();
        state.authenticated_at = Some(now);
        state.last_activity = now;
        info!("session {} authenticated as '{}'", self.id, username);
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.lock().authenticated
    }

    /// Authenticated username; empty before login.
    pub fn username(&self) -> String {
        self.state.lock().username.clone()
    }

    /// Bump the operation counter and the activity timestamp. Called by the
    /// worker after publishing a result.
    pub fn record_operation(&self) {
        let mut state = self.state.lock();
        state.operations += 1;
        state.last_activity = SystemTime::now();
    }

    /// Operations completed on this session.
    pub fn operations(&self) -> u64 {
        self.state.lock().operations
    }

    /// Seconds the session has existed, for log lines.
    pub fn age_secs(&self) -> u64 {
        let created = self.state.lock().created_at;
        created.elapsed().map(|d| d.as_secs()).unwrap_or(0)
    }

    /// Flip the active flag; returns true if the session was active before.
    fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }

    /// Shut down the read half of the connection so a handler blocked in
    /// `recv` observes end-of-stream. The write half stays open: an
    /// in-flight response is still delivered.
    fn interrupt_read(&self) {
        if let Some(stream) = self.stream.lock().as_ref() {
            let _ = stream.shutdown(Shutdown::Read);
        }
    }

    fn close_socket(&self) {
        if let Some(stream) = self.stream.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Counters exported for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub total_created: u64,
    pub active: u64,
    pub peak: u64,
}

struct ManagerInner {
    table: Vec<Option<Arc<Session>>>,
    next_id: u64,
    total_created: u64,
    active_count: u64,
    peak_active: u64,
}

/// Fixed-capacity table mapping session id to session record.
///
/// Structural changes go through the manager mutex; per-record counters are
/// guarded by the record's own mutex. Slots are found by linear probing from
/// `id % capacity`; lookups stop at the first empty slot.
pub struct SessionManager {
    capacity: usize,
    inner: Mutex<ManagerInner>,
}

impl SessionManager {
    /// Create a table with room for `capacity` concurrent sessions.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "session table capacity must be non-zero");
        SessionManager {
            capacity,
            inner: Mutex::new(ManagerInner {
                table: vec![None; capacity],
                // id 0 is reserved as "no session"
                next_id: 1,
                total_created: 0,
                active_count: 0,
                peak_active: 0,
            }),
        }
    }

    /// Register a new connection. `stream` is a cloned handle of the
    /// handler's socket, kept so the manager can unblock or close it.
    ///
    /// Returns `None` when the table is full.
    pub fn create(&self, stream: TcpStream) -> Option<Arc<Session>> {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;

        let mut index = (id % self.capacity as u64) as usize;
        let mut probed = 0;
        while inner.table[index].is_some() {
            index = (index + 1) % self.capacity;
            probed += 1;
            if probed >= self.capacity {
                warn!("session table full ({} slots)", self.capacity);
                return None;
            }
        }

        let session = Arc::new(Session::new(id, stream));
        inner.table[index] = Some(Arc::clone(&session));
        inner.total_created += 1;
        inner.active_count += 1;
        if inner.active_count > inner.peak_active {
            inner.peak_active = inner.active_count;
        }
        debug!(
            "session {} created (slot {}, active {}/{} peak)",
            id, index, inner.active_count, inner.peak_active
        );
        Some(session)
    }

    fn find(inner: &ManagerInner, capacity: usize, id: u64) -> Option<(usize, Arc<Session>)> {
        let mut index = (id % capacity as u64) as usize;
        for _ in 0..capacity {
            match &inner.table[index] {
                None => return None,
                Some(session) if session.id == id => {
                    return Some((index, Arc::clone(session)));
                }
                Some(_) => index = (index + 1) % capacity,
            }
        }
        None
    }

    /// Look up an *active* session. Inactive or absent ids return `None`, so
    /// a worker completing after disconnect simply drops its result.
    pub fn get(&self, id: u64) -> Option<Arc<Session>> {
        if id == 0 {
            return None;
        }
        let inner = self.inner.lock();
        match Self::find(&inner, self.capacity, id) {
            Some((_, session)) if session.is_active() => Some(session),
            _ => None,
        }
    }

    /// Flip a session inactive while leaving its record in the table, so
    /// late workers observe "inactive, drop".
    pub fn mark_inactive(&self, id: u64) {
        let mut inner = self.inner.lock();
        if let Some((_, session)) = Self::find(&inner, self.capacity, id) {
            if session.deactivate() {
                inner.active_count -= 1;
                debug!("session {} marked inactive", id);
            }
        }
    }

    /// Remove a session: mark inactive, release any unclaimed response,
    /// close the socket and empty the slot.
    pub fn destroy(&self, id: u64) {
        let mut inner = self.inner.lock();
        if let Some((index, session)) = Self::find(&inner, self.capacity, id) {
            if session.deactivate() {
                inner.active_count -= 1;
            }
            session.slot.reset();
            session.close_socket();
            inner.table[index] = None;
            debug!(
                "session {} destroyed after {} ops (active {})",
                id,
                session.operations(),
                inner.active_count
            );
        }
    }

    /// Unblock every connected handler by shutting down the read half of
    /// each active session's socket. Used by the graceful-shutdown drain;
    /// in-flight responses still go out before the handlers exit.
    pub fn interrupt_all(&self) {
        let inner = self.inner.lock();
        for slot in inner.table.iter().flatten() {
            if slot.is_active() {
                slot.interrupt_read();
            }
        }
    }

    /// Snapshot of the table counters.
    pub fn stats(&self) -> SessionStats {
        let inner = self.inner.lock();
        SessionStats {
            total_created: inner.total_created,
            active: inner.active_count,
            peak: inner.peak_active,
        }
    }
}

//! Multi-user network file-storage server
//!
//! Clients authenticate over a long-lived TCP connection, then upload,
//! download, delete and list files in a per-user namespace backed by the
//! local filesystem and an embedded SQLite metadata store. The server is a
//! two-stage staged pipeline over OS threads: an accept loop feeds a bounded
//! connection queue, a pool of client handlers owns the sessions and feeds a
//! bounded task queue, and a pool of workers executes the file operations
//! under per-file locks, handing results back through each session's
//! response slot.

#![warn(rust_2018_idioms)]

pub use crate::auth::hash_password;
pub use crate::auth::login;
pub use crate::auth::signup;
pub use crate::auth::AuthError;
pub use crate::channel::ClientChannel;
pub use crate::channel::MAX_LINE_LEN;
pub use crate::locks::FileLock;
pub use crate::locks::FileLockRegistry;
pub use crate::locks::RegistryFull;
pub use crate::locks::MAX_FILE_LOCKS;
pub use crate::queue::BoundedQueue;
pub use crate::queue::PushError;
pub use crate::reply::Response;
pub use crate::reply::ResponseSlot;
pub use crate::reply::ResponseStatus;
pub use crate::request::parse;
pub use crate::request::validate_filename;
pub use crate::request::validate_username;
pub use crate::request::Command;
pub use crate::request::ParseError;
pub use crate::request::Task;
pub use crate::request::TaskKind;
pub use crate::request::MAX_FILENAME_LEN;
pub use crate::request::MAX_USERNAME_LEN;
pub use crate::server::Server;
pub use crate::server::ServerConfig;
pub use crate::server::ShutdownHandle;
pub use crate::server::DEFAULT_CLIENT_THREADS;
pub use crate::server::DEFAULT_CONN_QUEUE_CAPACITY;
pub use crate::server::DEFAULT_PORT;
pub use crate::server::DEFAULT_TASK_QUEUE_CAPACITY;
pub use crate::server::DEFAULT_WORKER_THREADS;
pub use crate::session::Session;
pub use crate::session::SessionManager;
pub use crate::session::SessionStats;
pub use crate::session::MAX_SESSIONS;
pub use crate::store::MetaStore;
pub use crate::store::Quota;
pub use crate::store::StoreError;
pub use crate::store::DEFAULT_QUOTA_LIMIT;

pub mod auth;
pub mod channel;
mod handler;
pub mod locks;
pub mod queue;
pub mod reply;
pub mod request;
mod server;
pub mod session;
pub mod store;
mod worker;

//! Command parsing and in-flight tasks
//!
//! Commands are single ASCII lines. Parsing happens in the client handler;
//! the result is either a [`Command`] or a [`ParseError`] whose display text
//! is exactly what the client sees after `ERROR: `. File operations are
//! re-packaged as a [`Task`] and moved through the task queue to a worker,
//! carrying a snapshot of the authenticated username and, for uploads, the
//! payload buffer.

use std::fmt;

use thiserror::Error;

/// Upper bound on filename length.
pub const MAX_FILENAME_LEN: usize = 255;
/// Upper bound on username length.
pub const MAX_USERNAME_LEN: usize = 63;

/// One parsed protocol command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Signup { username: String, password: String },
    Login { username: String, password: String },
    Upload { filename: String, size: u64 },
    Download { filename: String },
    Delete { filename: String },
    List,
    Quit,
}

/// Why a line failed to parse. The display text is sent to the client.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Empty command")]
    Empty,
    #[error("Unknown command '{0}'")]
    Unknown(String),
    #[error("Usage: {0}")]
    Usage(&'static str),
    #[error("Invalid size")]
    InvalidSize,
    #[error("Invalid filename")]
    InvalidFilename,
    #[error("Invalid username")]
    InvalidUsername,
}

/// Reject anything that could escape the user's directory or break the
/// line protocol: path separators, NUL, the dot entries, over-long names.
pub fn validate_filename(name: &str) -> Result<(), ParseError> {
    if name.is_empty() || name.len() > MAX_FILENAME_LEN {
        return Err(ParseError::InvalidFilename);
    }
    if name == "." || name == ".." {
        return Err(ParseError::InvalidFilename);
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(ParseError::InvalidFilename);
    }
    Ok(())
}

/// Usernames double as directory names, so the same path-safety rules apply
/// with the shorter length bound.
pub fn validate_username(name: &str) -> Result<(), ParseError> {
    if name.is_empty() || name.len() > MAX_USERNAME_LEN {
        return Err(ParseError::InvalidUsername);
    }
    if name == "." || name == ".." {
        return Err(ParseError::InvalidUsername);
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(ParseError::InvalidUsername);
    }
    Ok(())
}

/// Parse one command line (line terminator already stripped).
pub fn parse(line: &str) -> Result<Command, ParseError> {
    let mut words = line.split_whitespace();
    let verb = words.next().ok_or(ParseError::Empty)?;
    let command = match verb {
        "SIGNUP" | "LOGIN" => {
            let username = words
                .next()
                .ok_or(ParseError::Usage("SIGNUP|LOGIN <user> <password>"))?;
            let password = words
                .next()
                .ok_or(ParseError::Usage("SIGNUP|LOGIN <user> <password>"))?;
            validate_username(username)?;
            if verb == "SIGNUP" {
                Command::Signup {
                    username: username.to_owned(),
                    password: password.to_owned(),
                }
            } else {
                Command::Login {
                    username: username.to_owned(),
                    password: password.to_owned(),
                }
            }
        }
        "UPLOAD" => {
            let filename = words
                .next()
                .ok_or(ParseError::Usage("UPLOAD <filename> <size>"))?;
            let size = words
                .next()
                .ok_or(ParseError::Usage("UPLOAD <filename> <size>"))?;
            validate_filename(filename)?;
            let size = size.parse::<u64>().map_err(|_| ParseError::InvalidSize)?;
            Command::Upload {
                filename: filename.to_owned(),
                size,
            }
        }
        "DOWNLOAD" => {
            let filename = words
                .next()
                .ok_or(ParseError::Usage("DOWNLOAD <filename>"))?;
            validate_filename(filename)?;
            Command::Download {
                filename: filename.to_owned(),
            }
        }
        "DELETE" => {
            let filename = words.next().ok_or(ParseError::Usage("DELETE <filename>"))?;
            validate_filename(filename)?;
            Command::Delete {
                filename: filename.to_owned(),
            }
        }
        "LIST" => Command::List,
        "QUIT" => Command::Quit,
        other => return Err(ParseError::Unknown(other.to_owned())),
    };
    Ok(command)
}

/// What a worker should do with a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Upload,
    Download,
    Delete,
    List,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskKind::Upload => "UPLOAD",
            TaskKind::Download => "DOWNLOAD",
            TaskKind::Delete => "DELETE",
            TaskKind::List => "LIST",
        };
        f.write_str(name)
    }
}

/// A request in flight from a client handler to a worker.
///
/// Created by the handler, moved into the task queue, consumed by exactly
/// one worker. The session is referenced by id only; the worker re-looks it
/// up on completion.
#[derive(Debug)]
pub struct Task {
    pub kind: TaskKind,
    pub session_id: u64,
    /// Snapshot of the authenticated user at enqueue time.
    pub username: String,
    /// Empty for LIST.
    pub filename: String,
    /// Declared payload size for uploads.
    pub size: u64,
    /// Owned upload payload.
    pub payload: Option<Vec<u8>>,
}

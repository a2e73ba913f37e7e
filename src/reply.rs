//! Worker-to-handler response rendezvous
//!
//! Each session owns one [`ResponseSlot`]. The client handler resets the
//! slot, queues a task and blocks in [`ResponseSlot::wait`]; the worker that
//! picks the task up publishes its result with [`ResponseSlot::set`] exactly
//! once per task cycle. The worker never blocks on the handler: the slot is
//! the only synchronisation point between the two.

use log::warn;
use parking_lot::{Condvar, Mutex};

/// Outcome category of a completed task, refined by the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    /// Operation completed.
    Success,
    /// Generic failure; the message carries the reason.
    Error,
    /// The named file does not exist for this user.
    FileNotFound,
    /// The upload would exceed the user's quota.
    QuotaExceeded,
    /// The filesystem refused the operation.
    PermissionDenied,
}

/// A completed task result.
///
/// `data` is the owned bulk payload (file bytes for a download, the listing
/// body for LIST); the handler writes it to the socket before `message`.
#[derive(Debug)]
pub struct Response {
    pub status: ResponseStatus,
    pub message: String,
    pub data: Option<Vec<u8>>,
}

impl Response {
    /// A successful response carrying only a status line.
    pub fn ok(message: impl Into<String>) -> Self {
        Response {
            status: ResponseStatus::Success,
            message: message.into(),
            data: None,
        }
    }

    /// A successful response carrying a bulk payload followed by a status
    /// line.
    pub fn with_data(message: impl Into<String>, data: Vec<u8>) -> Self {
        Response {
            status: ResponseStatus::Success,
            message: message.into(),
            data: Some(data),
        }
    }

    /// A failed response of the given status.
    pub fn error(status: ResponseStatus, message: impl Into<String>) -> Self {
        Response {
            status,
            message: message.into(),
            data: None,
        }
    }
}

/// Fill-once slot with a completion event.
///
/// Single producer (the worker holding the task), single consumer (the
/// handler owning the session). `wait` takes the value out, so ownership of
/// any data buffer passes to the handler; a value that is never claimed is
/// dropped by `reset` or when the slot itself is dropped.
#[derive(Default)]
pub struct ResponseSlot {
    value: Mutex<Option<Response>>,
    ready: Condvar,
}

impl ResponseSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a result and wake the waiting handler.
    ///
    /// A second publish within one task cycle violates the rendezvous
    /// contract; the late value is dropped.
    pub fn set(&self, response: Response) {
        let mut value = self.value.lock();
        if value.is_some() {
            warn!("response slot already filled, dropping late result");
            return;
        }
        *value = Some(response);
        self.ready.notify_one();
    }

    /// Block until a result is published, then take it.
    pub fn wait(&self) -> Response {
        let mut value = self.value.lock();
        while value.is_none() {
            self.ready.wait(&mut value);
        }
        value.take().expect("slot signalled without a value")
    }

    /// Discard any stale result. The handler calls this before queueing the
    /// next task.
    pub fn reset(&self) {
        self.value.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn rendezvous_across_threads() {
        let slot = Arc::new(ResponseSlot::new());
        let producer = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                slot.set(Response::with_data("DOWNLOAD OK\n", vec![1, 2, 3]));
            })
        };
        let resp = slot.wait();
        producer.join().unwrap();
        assert_eq!(resp.status, ResponseStatus::Success);
        assert_eq!(resp.data.as_deref(), Some(&[1, 2, 3][..]));
    }

    #[test]
    fn second_set_is_dropped() {
        let slot = ResponseSlot::new();
        slot.set(Response::ok("first\n"));
        slot.set(Response::ok("second\n"));
        assert_eq!(slot.wait().message, "first\n");
    }

    #[test]
    fn reset_clears_stale_value() {
        let slot = ResponseSlot::new();
        slot.set(Response::ok("stale\n"));
        slot.reset();
        slot.set(Response::ok("fresh\n"));
        assert_eq!(slot.wait().message, "fresh\n");
    }

    #[test]
    fn wait_consumes_the_value() {
        let slot = ResponseSlot::new();
        slot.set(Response::ok("one\n"));
        let _ = slot.wait();
        // The slot is empty again; a new cycle can publish.
        slot.set(Response::ok("two\n"));
        assert_eq!(slot.wait().message, "two\n");
    }
}

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Barrier};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use stash::{MetaStore, Server, ServerConfig, ShutdownHandle};
use tempfile::TempDir;

struct TestServer {
    port: u16,
    shutdown: ShutdownHandle,
    thread: JoinHandle<std::io::Result<()>>,
    root: TempDir,
}

impl TestServer {
    fn start() -> TestServer {
        let root = TempDir::new().unwrap();
        let config = ServerConfig {
            port: 0,
            storage_root: root.path().join("storage"),
            ..ServerConfig::default()
        };
        let server = Server::bind(config).unwrap();
        let port = server.local_addr().unwrap().port();
        let shutdown = server.shutdown_handle();
        let thread = thread::spawn(move || server.run());
        TestServer {
            port,
            shutdown,
            thread,
            root,
        }
    }

    fn connect(&self) -> Client {
        let stream = TcpStream::connect(("127.0.0.1", self.port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        Client {
            reader: BufReader::new(stream),
        }
    }

    /// Second connection to the metadata database (WAL mode allows it).
    fn store(&self) -> MetaStore {
        MetaStore::open(&self.root.path().join("storage/stash.db")).unwrap()
    }

    fn stop(self) {
        self.shutdown.shutdown();
        self.thread.join().unwrap().unwrap();
    }
}

struct Client {
    reader: BufReader<TcpStream>,
}

impl Client {
    fn send(&mut self, bytes: &[u8]) {
        self.reader.get_mut().write_all(bytes).unwrap();
    }

    fn read_line(&mut self) -> String {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).unwrap();
        assert!(n > 0, "unexpected end of stream");
        line
    }

    /// Skip banner/menu lines until the expected line shows up.
    fn expect_line(&mut self, want: &str) {
        loop {
            let line = self.read_line();
            if line.trim_end() == want {
                return;
            }
        }
    }

    fn read_exact(&mut self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf).unwrap();
        buf
    }

    /// Collect raw bytes until the download terminator, returning the
    /// payload that preceded it.
    fn read_download(&mut self) -> Vec<u8> {
        const MARKER: &[u8] = b"\nDOWNLOAD OK\n";
        let mut collected = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            self.reader.read_exact(&mut byte).unwrap();
            collected.push(byte[0]);
            if collected.ends_with(MARKER) {
                collected.truncate(collected.len() - MARKER.len());
                return collected;
            }
        }
    }

    fn signup(&mut self, user: &str, pass: &str) {
        self.send(format!("SIGNUP {} {}\n", user, pass).as_bytes());
        self.expect_line("SIGNUP OK");
    }

    fn login(&mut self, user: &str, pass: &str) {
        self.send(format!("LOGIN {} {}\n", user, pass).as_bytes());
        self.expect_line("LOGIN OK");
    }

    fn upload(&mut self, filename: &str, payload: &[u8]) {
        self.send(format!("UPLOAD {} {}\n", filename, payload.len()).as_bytes());
        self.send(payload);
        self.expect_line("UPLOAD OK");
    }
}

#[test]
fn signup_upload_download_list_round_trip() {
    let server = TestServer::start();
    let mut client = server.connect();

    client.signup("alice", "pw");
    client.upload("hello.txt", b"HELLO");

    client.send(b"DOWNLOAD hello.txt\n");
    assert_eq!(client.read_exact(5), b"HELLO");
    assert_eq!(client.read_line(), "\n");
    assert_eq!(client.read_line(), "DOWNLOAD OK\n");

    client.send(b"LIST\n");
    assert_eq!(client.read_line(), "hello.txt\n");
    assert_eq!(client.read_line(), "LIST END\n");

    client.send(b"QUIT\n");
    client.expect_line("Goodbye!");

    server.stop();
}

#[test]
fn quota_reject_without_reading_payload() {
    let server = TestServer::start();
    let mut client = server.connect();
    client.signup("carol", "pw");
    server.store().set_quota_limit("carol", 10).unwrap();

    // Header only; the payload is never sent, and the server must answer
    // from the header alone.
    client.send(b"UPLOAD big 11\n");
    client.expect_line("UPLOAD ERROR: Quota exceeded");

    // The connection is still in sync.
    client.send(b"LIST\n");
    client.expect_line("LIST END");

    // A fitting upload still works.
    client.upload("small.txt", b"1234567890");

    server.stop();
}

#[test]
fn wrong_password_then_right_one() {
    let server = TestServer::start();

    let mut first = server.connect();
    first.signup("bob", "pw");
    drop(first);

    let mut second = server.connect();
    second.send(b"LOGIN bob wrong\n");
    second.expect_line("LOGIN ERROR: Invalid password");
    second.send(b"LOGIN nobody pw\n");
    second.expect_line("LOGIN ERROR: User not found");
    second.login("bob", "pw");

    server.stop();
}

#[test]
fn concurrent_same_file_uploads_serialise() {
    let server = TestServer::start();

    let mut setup = server.connect();
    setup.signup("alice", "pw");
    drop(setup);

    let barrier = Arc::new(Barrier::new(2));
    let mut uploads = Vec::new();
    for fill in [(b'a', 100usize), (b'b', 200usize)] {
        let mut client = server.connect();
        client.login("alice", "pw");
        let barrier = Arc::clone(&barrier);
        uploads.push(thread::spawn(move || {
            barrier.wait();
            client.upload("f.bin", &vec![fill.0; fill.1]);
        }));
    }
    for upload in uploads {
        upload.join().unwrap();
    }

    let mut reader = server.connect();
    reader.login("alice", "pw");
    reader.send(b"DOWNLOAD f.bin\n");
    let payload = reader.read_download();
    assert!(
        payload == vec![b'a'; 100] || payload == vec![b'b'; 200],
        "download must be exactly one of the two uploads"
    );

    // Quota reflects whichever upload committed last.
    let used = server.store().get_quota("alice").unwrap().used;
    assert_eq!(used, payload.len() as u64);

    server.stop();
}

#[test]
fn overwrite_shrinks_quota() {
    let server = TestServer::start();
    let mut client = server.connect();
    client.signup("dave", "pw");
    client.upload("f.txt", b"AAAAA");
    client.upload("f.txt", b"BBB");

    client.send(b"DOWNLOAD f.txt\n");
    assert_eq!(client.read_download(), b"BBB");
    assert_eq!(server.store().get_quota("dave").unwrap().used, 3);

    server.stop();
}

#[test]
fn delete_then_download_is_not_found() {
    let server = TestServer::start();
    let mut client = server.connect();
    client.signup("erin", "pw");

    client.send(b"DELETE ghost.txt\n");
    client.expect_line("DELETE ERROR: File not found");

    client.upload("real.txt", b"data");
    client.send(b"DELETE real.txt\n");
    client.expect_line("DELETE OK");
    client.send(b"DOWNLOAD real.txt\n");
    client.expect_line("DOWNLOAD ERROR: File not found");
    assert_eq!(server.store().get_quota("erin").unwrap().used, 0);

    server.stop();
}

#[test]
fn protocol_errors_keep_the_session_alive() {
    let server = TestServer::start();
    let mut client = server.connect();

    client.send(b"LIST\n");
    client.expect_line("ERROR: Please sign up or log in first");

    client.signup("frank", "pw");
    client.send(b"FROB x\n");
    client.expect_line("ERROR: Unknown command 'FROB'");
    client.send(b"DOWNLOAD ../../etc/passwd\n");
    client.expect_line("ERROR: Invalid filename");
    client.send(b"UPLOAD f.txt five\n");
    client.expect_line("ERROR: Invalid size");

    // Still fully functional afterwards.
    client.upload("ok.txt", b"fine");

    server.stop();
}

#[test]
fn disconnect_with_task_in_flight_leaves_server_healthy() {
    let server = TestServer::start();

    let mut uploader = server.connect();
    uploader.signup("gina", "pw");
    uploader.upload("huge.bin", &vec![9u8; 256 * 1024]);
    drop(uploader);

    // Issue a download and vanish without reading the response.
    let mut vanisher = server.connect();
    vanisher.login("gina", "pw");
    vanisher.send(b"DOWNLOAD huge.bin\n");
    drop(vanisher);

    // The server keeps accepting and serving.
    let mut survivor = server.connect();
    survivor.login("gina", "pw");
    survivor.send(b"LIST\n");
    assert_eq!(survivor.read_line(), "huge.bin\n");
    assert_eq!(survivor.read_line(), "LIST END\n");

    server.stop();
}

#[test]
fn graceful_shutdown_joins_with_clients_mid_session() {
    let server = TestServer::start();

    let mut active = server.connect();
    active.signup("henry", "pw");
    active.upload("f.txt", b"payload");

    // A second client sits idle-authenticated in its read loop.
    let mut idle = server.connect();
    idle.login("henry", "pw");

    let port = server.port;
    server.stop();

    // The listener is gone; every pool thread joined in stop().
    assert!(TcpStream::connect(("127.0.0.1", port)).is_err());
    drop((active, idle));
}

#[test]
fn second_signup_with_same_name_fails() {
    let server = TestServer::start();
    let mut first = server.connect();
    first.signup("iris", "pw");

    let mut second = server.connect();
    second.send(b"SIGNUP iris other\n");
    second.expect_line("SIGNUP ERROR: User already exists");
    second.login("iris", "pw");

    server.stop();
}

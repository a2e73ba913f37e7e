//! Client connection I/O
//!
//! Buffered line-and-payload framing over one TCP stream. Commands are
//! LF-terminated ASCII lines; an UPLOAD header is followed immediately by
//! raw payload bytes, so whatever tail of a read came in after the header
//! line must be treated as payload, not as the next command. The channel
//! keeps that tail in its buffer and [`ClientChannel::read_payload`] drains
//! it before touching the socket again.

use std::io::{self, Read, Write};
use std::net::TcpStream;

use memchr::memchr;

/// Longest accepted command line, excluding the terminator.
pub const MAX_LINE_LEN: usize = 512;

const READ_BUF_SIZE: usize = 4096;

/// Buffered reader/writer owned by a client handler.
pub struct ClientChannel {
    stream: TcpStream,
    buf: Box<[u8; READ_BUF_SIZE]>,
    start: usize,
    end: usize,
}

impl ClientChannel {
    pub fn new(stream: TcpStream) -> Self {
        ClientChannel {
            stream,
            buf: Box::new([0; READ_BUF_SIZE]),
            start: 0,
            end: 0,
        }
    }

    fn buffered(&self) -> usize {
        self.end - self.start
    }

    /// Read one LF-terminated line. Returns `Ok(None)` on end-of-stream
    /// (clean disconnect, or the peer died mid-line). A CR before the LF is
    /// stripped. Lines longer than [`MAX_LINE_LEN`] are an error.
    pub fn read_line(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(pos) = memchr(b'\n', &self.buf[self.start..self.end]) {
                if pos > MAX_LINE_LEN {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "command line too long",
                    ));
                }
                let raw = &self.buf[self.start..self.start + pos];
                let raw = match raw.last() {
                    Some(b'\r') => &raw[..raw.len() - 1],
                    _ => raw,
                };
                let line = String::from_utf8(raw.to_vec()).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidData, "command line is not UTF-8")
                })?;
                self.start += pos + 1;
                return Ok(Some(line));
            }

            if self.buffered() > MAX_LINE_LEN {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "command line too long",
                ));
            }

            // Compact before refilling so a line split across reads fits.
            if self.start > 0 {
                self.buf.copy_within(self.start..self.end, 0);
                self.end -= self.start;
                self.start = 0;
            }

            let end = self.end;
            match self.stream.read(&mut self.buf[end..]) {
                Ok(0) => return Ok(None),
                Ok(n) => self.end += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Read exactly `size` payload bytes into `dest`, consuming any bytes
    /// already buffered from the command read first. Tolerates partial reads
    /// and returns the count actually received, which is less than `size`
    /// only if the peer disconnected mid-transfer.
    ///
    /// `dest` must already have capacity for `size` bytes.
    pub fn read_payload(&mut self, size: usize, dest: &mut Vec<u8>) -> io::Result<usize> {
        dest.clear();

        let take = self.buffered().min(size);
        dest.extend_from_slice(&self.buf[self.start..self.start + take]);
        self.start += take;

        let mut filled = take;
        dest.resize(size, 0);
        while filled < size {
            match self.stream.read(&mut dest[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        dest.truncate(filled);
        Ok(filled)
    }

    /// Write the whole buffer to the peer.
    pub fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn reads_lines_and_strips_terminators() {
        let (mut client, server) = socket_pair();
        let mut chan = ClientChannel::new(server);
        client.write_all(b"LIST\r\nQUIT\n").unwrap();
        assert_eq!(chan.read_line().unwrap().as_deref(), Some("LIST"));
        assert_eq!(chan.read_line().unwrap().as_deref(), Some("QUIT"));
        drop(client);
        assert_eq!(chan.read_line().unwrap(), None);
    }

    #[test]
    fn header_tail_becomes_payload() {
        let (mut client, server) = socket_pair();
        let mut chan = ClientChannel::new(server);
        // Header and payload arrive in one segment.
        client.write_all(b"UPLOAD hello.txt 5\nHELLO").unwrap();
        assert_eq!(
            chan.read_line().unwrap().as_deref(),
            Some("UPLOAD hello.txt 5")
        );
        let mut payload = Vec::with_capacity(5);
        assert_eq!(chan.read_payload(5, &mut payload).unwrap(), 5);
        assert_eq!(payload, b"HELLO");
    }

    #[test]
    fn payload_split_across_reads() {
        let (mut client, server) = socket_pair();
        let mut chan = ClientChannel::new(server);
        client.write_all(b"UPLOAD f.bin 6\nab").unwrap();
        let writer = thread::spawn(move || {
            client.write_all(b"cdef").unwrap();
            client
        });
        assert_eq!(chan.read_line().unwrap().as_deref(), Some("UPLOAD f.bin 6"));
        let mut payload = Vec::with_capacity(6);
        assert_eq!(chan.read_payload(6, &mut payload).unwrap(), 6);
        assert_eq!(payload, b"abcdef");
        drop(writer.join().unwrap());
    }

    #[test]
    fn short_payload_on_disconnect() {
        let (mut client, server) = socket_pair();
        let mut chan = ClientChannel::new(server);
        client.write_all(b"UPLOAD f.bin 10\nabc").unwrap();
        drop(client);
        assert_eq!(chan.read_line().unwrap().as_deref(), Some("UPLOAD f.bin 10"));
        let mut payload = Vec::with_capacity(10);
        assert_eq!(chan.read_payload(10, &mut payload).unwrap(), 3);
        assert_eq!(payload, b"abc");
    }

    #[test]
    fn overlong_line_is_rejected() {
        let (mut client, server) = socket_pair();
        let mut chan = ClientChannel::new(server);
        let long = vec![b'x'; MAX_LINE_LEN + 2];
        client.write_all(&long).unwrap();
        client.write_all(b"\n").unwrap();
        let err = chan.read_line().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}

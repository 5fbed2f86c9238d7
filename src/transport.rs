//  Copyright 2020 Two Sigma Investments, LP.
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

//! Exact-length send/recv over a plain TCP socket or a TLS-wrapped one,
//! with a three-way outcome on receive so an orderly peer close at a frame
//! boundary can be told apart from a mid-frame error.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::protocol::HEADER_LEN;
use crate::tls::{TlsClientStream, TlsServerStream};

pub enum RecvOutcome {
    Ok(Vec<u8>),
    Eof,
}

/// A transport is either a bare TCP socket or one wrapped in a TLS session.
/// All variants support the same exact-length operations. The server only
/// ever constructs `Plain`/`Tls`; the client additionally uses `TlsClient`
/// when its configured protocol is `https`.
pub enum Connection {
    Plain(TcpStream),
    Tls(Box<TlsServerStream>),
    TlsClient(Box<TlsClientStream>),
}

impl Connection {
    pub fn set_timeout(&self, timeout: Duration) -> Result<()> {
        let sock = match self {
            Connection::Plain(s) => s,
            Connection::Tls(s) => &s.sock,
            Connection::TlsClient(s) => &s.sock,
        };
        sock.set_read_timeout(Some(timeout)).context("Failed to set read timeout")?;
        sock.set_write_timeout(Some(timeout)).context("Failed to set write timeout")?;
        Ok(())
    }

    pub fn send_exact(&mut self, buf: &[u8]) -> Result<()> {
        let res = match self {
            Connection::Plain(s) => s.write_all(buf),
            Connection::Tls(s) => s.write_all(buf),
            Connection::TlsClient(s) => s.write_all(buf),
        };
        res.context("Failed to write to connection")
    }

    /// Reads exactly `len` bytes. Returns `Eof` only when the peer closed
    /// the connection before any byte of this read arrived (a clean close
    /// at a frame boundary); any other failure, including a close in the
    /// middle of a frame, is an error.
    pub fn recv_exact(&mut self, len: usize) -> Result<RecvOutcome> {
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        loop {
            if filled == len {
                return Ok(RecvOutcome::Ok(buf));
            }
            let n = match self {
                Connection::Plain(s) => s.read(&mut buf[filled..]),
                Connection::Tls(s) => s.read(&mut buf[filled..]),
                Connection::TlsClient(s) => s.read(&mut buf[filled..]),
            };
            match n {
                Ok(0) if filled == 0 => return Ok(RecvOutcome::Eof),
                Ok(0) => return Err(anyhow::anyhow!(
                    "EOF reached after {} of {} expected bytes", filled, len
                )),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("Failed to read from connection"),
            }
        }
    }

    pub fn recv_header(&mut self) -> Result<Option<crate::protocol::MessageHeader>> {
        match self.recv_exact(HEADER_LEN)? {
            RecvOutcome::Eof => Ok(None),
            RecvOutcome::Ok(bytes) => {
                let arr: [u8; HEADER_LEN] = bytes.try_into().unwrap();
                Ok(Some(crate::protocol::MessageHeader::decode(&arr)))
            }
        }
    }

    pub fn send_header(&mut self, header: &crate::protocol::MessageHeader) -> Result<()> {
        self.send_exact(&header.encode())
    }

    /// Orderly TLS shutdown (if established) then socket close. Idempotent:
    /// dropping the underlying `TcpStream`/TLS stream closes the fd exactly
    /// once regardless of how many times this is called.
    pub fn close(&mut self) {
        match self {
            Connection::Tls(s) => {
                s.conn.send_close_notify();
                let _ = s.flush();
            }
            Connection::TlsClient(s) => {
                s.conn.send_close_notify();
                let _ = s.flush();
            }
            Connection::Plain(_) => {}
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn plain_round_trip_send_recv() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            let mut conn = Connection::Plain(sock);
            match conn.recv_exact(5).unwrap() {
                RecvOutcome::Ok(buf) => assert_eq!(buf, b"hello"),
                RecvOutcome::Eof => panic!("unexpected eof"),
            }
            conn.send_exact(b"world").unwrap();
        });

        let sock = TcpStream::connect(addr).unwrap();
        let mut conn = Connection::Plain(sock);
        conn.send_exact(b"hello").unwrap();
        match conn.recv_exact(5).unwrap() {
            RecvOutcome::Ok(buf) => assert_eq!(buf, b"world"),
            RecvOutcome::Eof => panic!("unexpected eof"),
        }
        server.join().unwrap();
    }

    #[test]
    fn clean_close_at_frame_boundary_is_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            drop(sock);
        });

        let sock = TcpStream::connect(addr).unwrap();
        let mut conn = Connection::Plain(sock);
        server.join().unwrap();
        // Give the peer's close a chance to propagate before we read.
        thread::sleep(std::time::Duration::from_millis(50));
        match conn.recv_exact(4).unwrap() {
            RecvOutcome::Eof => {}
            RecvOutcome::Ok(_) => panic!("expected eof"),
        }
    }

    #[test]
    fn close_mid_frame_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            sock.write_all(b"ab").unwrap();
        });

        let sock = TcpStream::connect(addr).unwrap();
        let mut conn = Connection::Plain(sock);
        server.join().unwrap();
        thread::sleep(std::time::Duration::from_millis(50));
        assert!(conn.recv_exact(4).is_err());
    }
}

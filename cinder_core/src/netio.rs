//! Synchronous socket helpers with explicit millisecond deadlines, used by
//! the migration path. Streams are non-blocking; readiness waits go through
//! the reactor's single-fd `wait` primitive.

use crate::reactor::{self, Interest};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::time::Instant;

/// Formats a peer address the way client introspection expects it:
/// `host:port` for IPv4, `[host]:port` for IPv6.
pub fn format_peer(addr: &SocketAddr) -> String {
    match addr {
        SocketAddr::V4(v4) => format!("{}:{}", v4.ip(), v4.port()),
        SocketAddr::V6(v6) => format!("[{}]:{}", v6.ip(), v6.port()),
    }
}

#[inline]
fn remaining_ms(deadline: Instant) -> io::Result<u64> {
    match deadline.checked_duration_since(Instant::now()) {
        Some(left) if left.as_millis() > 0 => Ok(left.as_millis() as u64),
        _ => Err(io::ErrorKind::TimedOut.into()),
    }
}

/// Connects within the deadline and switches the stream to non-blocking
/// mode with Nagle disabled.
pub fn connect_deadline(host: &str, port: u16, deadline: Instant) -> io::Result<TcpStream> {
    let addr = (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address for host"))?;

    let left = deadline
        .checked_duration_since(Instant::now())
        .ok_or_else(|| io::Error::from(io::ErrorKind::TimedOut))?;
    let stream = TcpStream::connect_timeout(&addr, left)?;
    stream.set_nodelay(true)?;
    stream.set_nonblocking(true)?;
    Ok(stream)
}

/// Writes the whole buffer or fails with TimedOut.
pub fn write_deadline(stream: &mut TcpStream, data: &[u8], deadline: Instant) -> io::Result<()> {
    let mut written = 0;
    while written < data.len() {
        match stream.write(&data[written..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                let ms = remaining_ms(deadline)?;
                let ready = reactor::wait(stream.as_raw_fd(), Interest::WRITABLE, ms)?;
                if ready.is_none() {
                    return Err(io::ErrorKind::TimedOut.into());
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => (),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Reads a single CRLF-terminated line (without the terminator) within the
/// deadline.
pub fn read_line_deadline(stream: &mut TcpStream, deadline: Instant) -> io::Result<Vec<u8>> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(_) => {
                if byte[0] == b'\n' {
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    return Ok(line);
                }
                line.push(byte[0]);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                let ms = remaining_ms(deadline)?;
                let ready = reactor::wait(stream.as_raw_fd(), Interest::READABLE, ms)?;
                if ready.is_none() {
                    return Err(io::ErrorKind::TimedOut.into());
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => (),
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Duration;

    #[test]
    fn test_format_peer() {
        let v4: SocketAddr = "10.0.0.1:6379".parse().unwrap();
        assert_eq!(format_peer(&v4), "10.0.0.1:6379");
        let v6: SocketAddr = "[::1]:6379".parse().unwrap();
        assert_eq!(format_peer(&v6), "[::1]:6379");
    }

    #[test]
    fn test_connect_write_read_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut peer, _) = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            peer.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"hello");
            peer.write_all(b"+OK\r\n").unwrap();
        });

        let deadline = Instant::now() + Duration::from_millis(2000);
        let mut stream = connect_deadline("127.0.0.1", addr.port(), deadline).unwrap();
        write_deadline(&mut stream, b"hello", deadline).unwrap();
        let line = read_line_deadline(&mut stream, deadline).unwrap();
        assert_eq!(line, b"+OK");

        server.join().unwrap();
    }

    #[test]
    fn test_read_line_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let deadline = Instant::now() + Duration::from_millis(50);
        let mut stream = connect_deadline("127.0.0.1", addr.port(), deadline).unwrap();
        let result = read_line_deadline(&mut stream, deadline);
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::TimedOut);
        drop(listener);
    }
}

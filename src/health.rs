// src/health.rs

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

const CHECK_TIMEOUT: Duration = Duration::from_millis(500);

/// Whether a local TCP port accepts connections.
pub fn port_open(port: u16) -> bool {
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    TcpStream::connect_timeout(&addr, CHECK_TIMEOUT).is_ok()
}

/// Minimal HTTP/1.0 GET against localhost; healthy iff the status line
/// reports 200. Enough for the usual "is my service answering" endpoint
/// without dragging a client stack into the supervisor.
pub fn http_ok(port: u16, path: &str) -> bool {
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();

    let mut stream = match TcpStream::connect_timeout(&addr, CHECK_TIMEOUT) {
        Ok(stream) => stream,
        Err(_) => return false,
    };

    let _ = stream.set_read_timeout(Some(CHECK_TIMEOUT));
    let _ = stream.set_write_timeout(Some(CHECK_TIMEOUT));

    let request = format!("GET {} HTTP/1.0\r\nHost: 127.0.0.1\r\n\r\n", path);
    if stream.write_all(request.as_bytes()).is_err() {
        return false;
    }

    let mut response = [0u8; 64];
    let read = match stream.read(&mut response) {
        Ok(read) => read,
        Err(_) => return false,
    };

    let status_line = String::from_utf8_lossy(&response[..read]);
    status_line
        .lines()
        .next()
        .map(|line| line.contains(" 200"))
        .unwrap_or(false)
}

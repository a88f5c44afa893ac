//! Client helper for talking to cabinetd over its Unix socket.
//!
//! One request per connection, newline-delimited JSON both ways. A request is
//! retried once when the daemon is unreachable or reports a transient storage
//! error; every other failure goes straight back to the caller.

use cabinet_protocol::{Actor, Method, Request, Response, MAX_REQUEST_BYTES, PROTOCOL_VERSION};
use chrono::Utc;
use rand::RngCore;
use serde_json::Value;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

const SOCKET_ENV: &str = "CABINET_SOCKET";
const READ_TIMEOUT_MS: u64 = 5000;
const WRITE_TIMEOUT_MS: u64 = 1000;
const RETRY_DELAY_MS: u64 = 100;

pub fn socket_path() -> Result<PathBuf, String> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        return Ok(PathBuf::from(path));
    }
    cabinet_core::config::socket_path()
}

pub fn build_request(method: Method, actor: Option<Actor>, params: Option<Value>) -> Request {
    Request {
        protocol_version: PROTOCOL_VERSION,
        method,
        id: Some(make_request_id()),
        actor,
        params,
    }
}

/// Sends `request`, retrying once on connection failure or a retryable error.
pub fn call(socket: &Path, request: &Request) -> Result<Response, String> {
    match send_request(socket, request) {
        Ok(response) if !is_transient(&response) => Ok(response),
        first => {
            let reason = match &first {
                Ok(response) => response
                    .error
                    .as_ref()
                    .map(|err| err.message.clone())
                    .unwrap_or_default(),
                Err(err) => err.clone(),
            };
            tracing::warn!(error = %reason, method = ?request.method, "Daemon request failed; retrying");
            std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
            send_request(socket, request).inspect_err(|retry_err| {
                tracing::warn!(error = %retry_err, method = ?request.method, "Retry failed");
            })
        }
    }
}

fn is_transient(response: &Response) -> bool {
    response
        .error
        .as_ref()
        .is_some_and(|err| err.code == "transient")
}

fn send_request(socket: &Path, request: &Request) -> Result<Response, String> {
    let mut stream = UnixStream::connect(socket)
        .map_err(|err| format!("Failed to connect to daemon socket: {}", err))?;
    let _ = stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)));
    let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));

    serde_json::to_writer(&mut stream, request)
        .map_err(|err| format!("Failed to write request: {}", err))?;
    stream
        .write_all(b"\n")
        .map_err(|err| format!("Failed to flush request: {}", err))?;
    stream.flush().ok();

    read_response(&mut stream)
}

fn read_response(stream: &mut UnixStream) -> Result<Response, String> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err("Response exceeded maximum size".to_string());
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err("Timed out waiting for daemon response".to_string());
            }
            Err(err) => return Err(format!("Failed to read response: {}", err)),
        }
    }

    let response_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if response_bytes.is_empty() {
        return Err("Daemon response was empty".to_string());
    }

    serde_json::from_slice(response_bytes)
        .map_err(|err| format!("Failed to parse response JSON: {}", err))
}

fn make_request_id() -> String {
    let rand = rand::thread_rng().next_u64();
    format!(
        "req-{}-{}-{:x}",
        Utc::now().timestamp_millis(),
        std::process::id(),
        rand
    )
}

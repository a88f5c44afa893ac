use cabinet_protocol::{Actor, Method, Request, Response, Role, PROTOCOL_VERSION};
use serde_json::json;
use std::fs;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

struct DaemonGuard {
    child: Child,
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn spawn_daemon(home: &Path) -> Child {
    Command::new(env!("CARGO_BIN_EXE_cabinetd"))
        .env("HOME", home)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn cabinetd")
}

fn socket_path(home: &Path) -> PathBuf {
    home.join(".cabinet").join("cabinetd.sock")
}

fn can_bind_socket(home: &Path) -> bool {
    let check_path = home.join("bind-check.sock");
    match UnixListener::bind(&check_path) {
        Ok(listener) => {
            drop(listener);
            let _ = fs::remove_file(&check_path);
            true
        }
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => false,
        Err(_) => true,
    }
}

fn wait_for_socket(path: &Path, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if path.exists() && UnixStream::connect(path).is_ok() {
            return;
        }
        sleep(Duration::from_millis(25));
    }
    panic!("timed out waiting for daemon socket at {}", path.display());
}

fn start(prefix: &str) -> Option<(tempfile::TempDir, PathBuf, DaemonGuard)> {
    let home = tempfile::Builder::new()
        .prefix(prefix)
        .tempdir_in("/tmp")
        .expect("failed to create temp HOME");
    if !can_bind_socket(home.path()) {
        eprintln!("Skipping {prefix}: unix socket binding not permitted in this environment.");
        return None;
    }
    let socket = socket_path(home.path());
    let guard = DaemonGuard {
        child: spawn_daemon(home.path()),
    };
    wait_for_socket(&socket, Duration::from_secs(5));
    Some((home, socket, guard))
}

fn send_raw_request(socket: &Path, payload: &[u8]) -> Response {
    let mut stream = UnixStream::connect(socket).expect("failed to connect to daemon socket");
    stream
        .write_all(payload)
        .expect("failed to write raw payload");
    stream.flush().expect("failed to flush raw payload");
    read_response(&mut stream)
}

fn send_request(socket: &Path, request: &Request) -> Response {
    let mut payload = serde_json::to_vec(request).expect("serialize request");
    payload.push(b'\n');
    send_raw_request(socket, &payload)
}

fn read_response(stream: &mut UnixStream) -> Response {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).expect("failed to read response");
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
        if chunk[..n].contains(&b'\n') {
            break;
        }
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let response_bytes = match newline_index {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    serde_json::from_slice(response_bytes).expect("failed to parse response JSON")
}

fn user(id: &str) -> Actor {
    Actor {
        id: id.to_string(),
        email: format!("{}@example.com", id),
        role: Role::User,
    }
}

fn request(method: Method, actor: Option<Actor>) -> Request {
    Request {
        protocol_version: PROTOCOL_VERSION,
        method,
        id: Some("hardening".to_string()),
        actor,
        params: None,
    }
}

fn code(response: &Response) -> Option<&str> {
    response.error.as_ref().map(|err| err.code.as_str())
}

#[test]
fn daemon_handles_malformed_payload_flood_without_losing_health() {
    let Some((_home, socket, _guard)) = start("cabinetd-hardening-malformed") else {
        return;
    };

    for _ in 0..64 {
        let response = send_raw_request(&socket, b"{\"bad_json\": true\n");
        assert!(!response.ok, "malformed payload must be rejected");
        assert_eq!(code(&response), Some("invalid_json"));
    }

    let health = send_request(&socket, &request(Method::GetHealth, None));
    assert!(health.ok, "daemon should remain healthy after malformed flood");
}

#[test]
fn daemon_idle_connection_returns_read_timeout_error() {
    let Some((_home, socket, _guard)) = start("cabinetd-hardening-timeout") else {
        return;
    };

    let mut idle = UnixStream::connect(&socket).expect("failed to connect idle stream");
    let response = read_response(&mut idle);
    assert_eq!(code(&response), Some("read_timeout"));
}

#[test]
fn daemon_rejects_bad_envelopes() {
    let Some((_home, socket, _guard)) = start("cabinetd-hardening-envelope") else {
        return;
    };

    let mut stale = request(Method::GetHealth, None);
    stale.protocol_version = PROTOCOL_VERSION + 1;
    assert_eq!(
        code(&send_request(&socket, &stale)),
        Some("protocol_mismatch")
    );

    assert_eq!(
        code(&send_request(&socket, &request(Method::ListReturnable, None))),
        Some("unauthorized")
    );

    let mut blank = user("x");
    blank.id = " ".to_string();
    assert_eq!(
        code(&send_request(
            &socket,
            &request(Method::ListReturnable, Some(blank))
        )),
        Some("invalid_actor")
    );

    assert_eq!(
        code(&send_request(
            &socket,
            &request(Method::DashboardStats, Some(user("plain")))
        )),
        Some("forbidden")
    );

    let mut missing_params = request(Method::Borrow, Some(user("plain")));
    missing_params.params = Some(json!({ "slot": "A-01" }));
    assert_eq!(
        code(&send_request(&socket, &missing_params)),
        Some("invalid_params")
    );
}

#[test]
fn daemon_refuses_users_past_configured_limit() {
    let home = tempfile::Builder::new()
        .prefix("cabinetd-hardening-limit")
        .tempdir_in("/tmp")
        .expect("failed to create temp HOME");
    if !can_bind_socket(home.path()) {
        eprintln!("Skipping user limit test: unix socket binding not permitted.");
        return;
    }
    let config_dir = home.path().join(".cabinet");
    fs::create_dir_all(&config_dir).expect("create config dir");
    fs::write(
        config_dir.join("cabinetd.toml"),
        "[sessions]\nmax_active_users = 1\n",
    )
    .expect("write config");

    let socket = socket_path(home.path());
    let _guard = DaemonGuard {
        child: spawn_daemon(home.path()),
    };
    wait_for_socket(&socket, Duration::from_secs(5));

    let first = send_request(&socket, &request(Method::ListReturnable, Some(user("first"))));
    assert!(first.ok, "first user should be admitted");

    let second = send_request(&socket, &request(Method::ListReturnable, Some(user("second"))));
    assert_eq!(code(&second), Some("user_limit_reached"));
    let details = second
        .error
        .and_then(|err| err.details)
        .expect("limit details");
    assert_eq!(details["max_users"], 1);
    assert_eq!(details["retryable"], true);

    let again = send_request(&socket, &request(Method::ListReturnable, Some(user("first"))));
    assert!(again.ok, "admitted user should stay admitted");
}

#[test]
fn daemon_restart_keeps_active_borrows() {
    let home = tempfile::Builder::new()
        .prefix("cabinetd-hardening-restart")
        .tempdir_in("/tmp")
        .expect("failed to create temp HOME");
    if !can_bind_socket(home.path()) {
        eprintln!("Skipping restart test: unix socket binding not permitted.");
        return;
    }
    let socket = socket_path(home.path());
    let admin = Actor {
        id: "admin".to_string(),
        email: "admin@example.com".to_string(),
        role: Role::Admin,
    };

    let guard = DaemonGuard {
        child: spawn_daemon(home.path()),
    };
    wait_for_socket(&socket, Duration::from_secs(5));

    let mut register = request(Method::RegisterItem, Some(admin.clone()));
    register.params = Some(json!({
        "location": "B-07",
        "category": "BGA",
        "total_samples": 8
    }));
    assert!(send_request(&socket, &register).ok);

    let mut borrow = request(Method::Borrow, Some(admin.clone()));
    borrow.params = Some(json!({ "location": "B-07" }));
    assert!(send_request(&socket, &borrow).ok);

    drop(guard);

    let _guard = DaemonGuard {
        child: spawn_daemon(home.path()),
    };
    wait_for_socket(&socket, Duration::from_secs(5));

    let again = send_request(&socket, &borrow);
    assert_eq!(code(&again), Some("conflict"));

    let returnable = send_request(&socket, &request(Method::ListReturnable, Some(admin)));
    let entries = returnable.data.expect("returnable payload");
    assert_eq!(entries.as_array().map(Vec::len), Some(1));
}

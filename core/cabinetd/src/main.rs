//! Cabinet daemon entrypoint.
//!
//! A small, single-writer service that owns the borrow/return lifecycle for
//! the sample cabinets: a socket listener, strict request validation, a
//! SQLite-backed store, and two periodic sweeps (reminders and overdue
//! reporting).

use fs_err as fs;
use serde::Serialize;
use std::collections::BTreeMap;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cabinet_core::config::{self, CabinetConfig};
use cabinet_core::sweep::pass_interval;
use cabinet_core::{
    require_admin, ItemFilter, ItemUpdate, NewItem, PageRequest, SessionLimit, SessionReaper,
    SpoolNotifier, DEFAULT_ADMIN_PAGE_LIMIT, DEFAULT_PAGE_LIMIT,
};
use cabinet_protocol::{
    parse_optional_params, parse_params, Actor, ApproveParams, BorrowFilterParams, ErrorInfo,
    HistoryParams, ItemFilterParams, JustificationParams, ListItemsParams, LocationParams, Method,
    PackageCodeParams, PageParams, RegisterItemParams, Request, Response, ReturnParams,
    UpdateItemParams, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};
use chrono::Utc;

mod db;
mod state;

use db::Db;
use state::SharedState;

const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;

fn main() {
    init_logging();

    let socket_path = match config::socket_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon socket path");
            std::process::exit(1);
        }
    };

    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let cabinet_config = match config::load_config(None) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load cabinet config; using defaults");
            CabinetConfig::default()
        }
    };

    let db_path = match config::db_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon database path");
            std::process::exit(1);
        }
    };

    let db = match Db::new(db_path) {
        Ok(db) => db,
        Err(err) => {
            error!(error = %err, "Failed to initialize daemon database");
            std::process::exit(1);
        }
    };

    let spool_path = match config::cabinet_dir() {
        Ok(dir) => cabinet_config.spool_path(&dir),
        Err(err) => {
            error!(error = %err, "Failed to resolve notification spool path");
            std::process::exit(1);
        }
    };
    let notifier = match SpoolNotifier::new(spool_path) {
        Ok(notifier) => notifier,
        Err(err) => {
            error!(error = %err, "Failed to prepare notification spool");
            std::process::exit(1);
        }
    };
    info!(spool = %notifier.path().display(), "Notification spool ready");

    let shared_state = Arc::new(SharedState::new(db, Arc::new(notifier), &cabinet_config));
    let policy = cabinet_config.policy();
    info!(
        loan_hours = policy.loan_duration.num_hours(),
        reminder_window_hours = policy.reminder_window.num_hours(),
        max_active_users = cabinet_config.sessions.max_active_users,
        "Cabinet config loaded"
    );

    let _reaper = SessionReaper::start(
        shared_state.sessions(),
        pass_interval(cabinet_config.sessions.eviction_interval_secs),
    );
    spawn_reminder_sweep(
        Arc::clone(&shared_state),
        pass_interval(cabinet_config.sweep.reminder_interval_secs),
    );
    spawn_overdue_sweep(
        Arc::clone(&shared_state),
        pass_interval(cabinet_config.sweep.overdue_interval_secs),
    );

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };

    info!(path = %socket_path.display(), "Cabinet daemon started");

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let state = Arc::clone(&shared_state);
                thread::spawn(|| handle_connection(stream, state));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }
}

fn spawn_reminder_sweep(state: Arc<SharedState>, interval: Duration) {
    thread::spawn(move || loop {
        thread::sleep(interval);
        if let Err(err) = state.run_reminder_sweep(Utc::now()) {
            warn!(error = %err, "Periodic reminder sweep failed");
        }
    });
}

fn spawn_overdue_sweep(state: Arc<SharedState>, interval: Duration) {
    thread::spawn(move || loop {
        thread::sleep(interval);
        if let Err(err) = state.run_overdue_sweep(Utc::now()) {
            warn!(error = %err, "Periodic overdue sweep failed");
        }
    });
}

fn init_logging() {
    let debug_enabled = env::var("CABINET_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

fn handle_connection(mut stream: UnixStream, state: Arc<SharedState>) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut stream, response);
            return;
        }
    };

    tracing::debug!(method = ?request.method, id = ?request.id, "Daemon request received");
    let response = handle_request(request, &state);
    let _ = write_response(&mut stream, response);
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
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
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    let request_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => {
            if buffer[index + 1..].iter().any(|b| !b.is_ascii_whitespace()) {
                warn!("Extra bytes detected after newline; ignoring trailing data");
            }
            &buffer[..index]
        }
        None => buffer.as_slice(),
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn handle_request(request: Request, state: &SharedState) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    let Request {
        method,
        id,
        actor,
        params,
        ..
    } = request;

    let actor = match authorize(method, actor, state) {
        Ok(actor) => actor,
        Err(err) => return Response::error_with_info(id, err),
    };

    match dispatch(method, actor.as_ref(), params, state) {
        Ok(value) => Response::ok(id, value),
        Err(err) => {
            tracing::debug!(method = ?method, code = %err.code, message = %err.message, "Request failed");
            Response::error_with_info(id, err)
        }
    }
}

/// Validates the caller and admits them against the user limit. Returns the
/// actor when one was supplied.
fn authorize(
    method: Method,
    actor: Option<Actor>,
    state: &SharedState,
) -> Result<Option<Actor>, ErrorInfo> {
    let Some(actor) = actor else {
        if method.requires_actor() {
            return Err(ErrorInfo::new("unauthorized", "authenticated actor is required"));
        }
        return Ok(None);
    };

    actor.validate()?;
    let now = Utc::now();
    let admitted = if method == Method::GetHealth {
        state.heartbeat(&actor, now)
    } else {
        state.admit(&actor, now)
    };
    admitted.map_err(limit_error)?;

    if method.requires_admin() {
        require_admin(&actor)?;
    }
    Ok(Some(actor))
}

fn limit_error(limit: SessionLimit) -> ErrorInfo {
    ErrorInfo::new(
        "user_limit_reached",
        format!(
            "Maximum number of concurrent users ({}) reached; try again later",
            limit.max_users
        ),
    )
    .with_details(serde_json::json!({
        "active_users": limit.active_users,
        "max_users": limit.max_users,
        "retryable": true,
    }))
}

fn dispatch(
    method: Method,
    actor: Option<&Actor>,
    params: Option<serde_json::Value>,
    state: &SharedState,
) -> Result<serde_json::Value, ErrorInfo> {
    let now = Utc::now();
    match method {
        Method::GetHealth => to_data(serde_json::json!({
            "status": "ok",
            "pid": std::process::id(),
            "version": env!("CARGO_PKG_VERSION"),
            "protocol_version": PROTOCOL_VERSION,
            "sessions": state.session_stats(now),
            "sweeps": state.sweep_status(),
        })),
        Method::ListAvailableItems => {
            let params: ItemFilterParams = parse_optional_params(params)?;
            let filter = ItemFilter {
                category: non_blank(params.category),
                package_code: non_blank(params.package_code),
            };
            let page = PageRequest::new(params.page, params.limit, DEFAULT_PAGE_LIMIT);
            to_data(state.list_available_items(&filter, page)?)
        }
        Method::ListItems => {
            let params: ListItemsParams = parse_optional_params(params)?;
            let filter = ItemFilter {
                category: non_blank(params.category),
                package_code: non_blank(params.package_code),
            };
            let page = PageRequest::new(params.page, params.limit, DEFAULT_PAGE_LIMIT);
            to_data(state.list_items(&filter, params.available_only, page)?)
        }
        Method::GetItem => {
            let params: LocationParams = parse_params(params)?;
            params.validate()?;
            to_data(state.get_item(params.location.trim())?)
        }
        Method::ListCategories => to_data(state.list_categories()?),
        Method::ListPackageCodes => {
            let params: PackageCodeParams = parse_optional_params(params)?;
            to_data(state.list_package_codes(non_blank(params.category).as_deref())?)
        }
        Method::ListUnassignedSlots => to_data(state.list_unassigned_slots()?),
        Method::AddSlot => {
            let params: LocationParams = parse_params(params)?;
            params.validate()?;
            to_data(state.add_slot(&params.location, now)?)
        }
        Method::RegisterItem => {
            let actor = actor_required(actor)?;
            let params: RegisterItemParams = parse_params(params)?;
            params.validate()?;
            to_data(state.register_item(actor, &new_item(params)?, now)?)
        }
        Method::UpdateItem => {
            let actor = actor_required(actor)?;
            let params: UpdateItemParams = parse_params(params)?;
            params.validate()?;
            let location = params.location.trim().to_string();
            to_data(state.update_item(actor, &location, &item_update(params)?, now)?)
        }
        Method::Borrow => {
            let actor = actor_required(actor)?;
            let params: LocationParams = parse_params(params)?;
            params.validate()?;
            to_data(state.borrow(actor, &params.location, now)?)
        }
        Method::ListReturnable => {
            let actor = actor_required(actor)?;
            to_data(state.list_returnable(actor, now)?)
        }
        Method::BorrowHistory => {
            let actor = actor_required(actor)?;
            let params: HistoryParams = parse_optional_params(params)?;
            let page = PageRequest::new(params.page, params.limit, DEFAULT_PAGE_LIMIT);
            to_data(state.borrow_history(actor, params.status.as_deref(), page)?)
        }
        Method::Return => {
            let actor = actor_required(actor)?;
            let params: ReturnParams = parse_params(params)?;
            let returned = params.validate()?;
            to_data(state.return_item(
                actor,
                params.record_id,
                returned,
                params.justification.as_deref(),
                now,
            )?)
        }
        Method::UpdateJustification => {
            let actor = actor_required(actor)?;
            let params: JustificationParams = parse_params(params)?;
            params.validate()?;
            to_data(state.update_justification(
                actor,
                params.record_id,
                &params.justification,
                now,
            )?)
        }
        Method::ListPendingReturns => {
            let actor = actor_required(actor)?;
            to_data(state.list_pending_returns(actor)?)
        }
        Method::Approve => {
            let params: ApproveParams = parse_params(params)?;
            let approved = params.validate()?;
            to_data(state.approve(
                params.record_id,
                approved,
                params.admin_comments.as_deref(),
                now,
            )?)
        }
        Method::ListAllBorrowed => {
            let params: BorrowFilterParams = parse_optional_params(params)?;
            let page = PageRequest::new(params.page, params.limit, DEFAULT_ADMIN_PAGE_LIMIT);
            to_data(state.list_all_borrowed(
                params.status.as_deref(),
                params.borrower_email.as_deref(),
                page,
                now,
            )?)
        }
        Method::ListPendingApprovals => {
            let params: PageParams = parse_optional_params(params)?;
            let page = PageRequest::new(params.page, params.limit, DEFAULT_ADMIN_PAGE_LIMIT);
            to_data(state.list_pending_approvals(page)?)
        }
        Method::ListOverdue => {
            let params: PageParams = parse_optional_params(params)?;
            let page = PageRequest::new(params.page, params.limit, DEFAULT_ADMIN_PAGE_LIMIT);
            to_data(state.list_overdue(page, now)?)
        }
        Method::DashboardStats => to_data(state.dashboard_stats(now)?),
        Method::RunReminderSweep => to_data(state.run_reminder_sweep(now)?),
        Method::RunOverdueSweep => to_data(state.run_overdue_sweep(now)?),
        Method::SessionStats => to_data(state.session_stats(now)),
    }
}

fn actor_required(actor: Option<&Actor>) -> Result<&Actor, ErrorInfo> {
    actor.ok_or_else(|| ErrorInfo::new("unauthorized", "authenticated actor is required"))
}

fn new_item(params: RegisterItemParams) -> Result<NewItem, ErrorInfo> {
    let total_samples = u32::try_from(params.total_samples)
        .map_err(|_| ErrorInfo::new("validation", "total_samples is out of range"))?;
    let defects = defect_counts(params.defects)?;
    Ok(NewItem {
        location: params.location.map(|location| location.trim().to_string()),
        category: params.category.trim().to_string(),
        package_code: non_blank(params.package_code),
        package_description: non_blank(params.package_description),
        shift: non_blank(params.shift),
        total_samples,
        defects,
    })
}

fn item_update(params: UpdateItemParams) -> Result<ItemUpdate, ErrorInfo> {
    let total_samples = params
        .total_samples
        .map(|total| {
            u32::try_from(total)
                .map_err(|_| ErrorInfo::new("validation", "total_samples is out of range"))
        })
        .transpose()?;
    let defects = params.defects.map(defect_counts).transpose()?;
    Ok(ItemUpdate {
        category: params.category.map(|category| category.trim().to_string()),
        package_code: non_blank(params.package_code),
        package_description: non_blank(params.package_description),
        shift: non_blank(params.shift),
        total_samples,
        defects,
    })
}

fn defect_counts(
    defects: BTreeMap<String, i64>,
) -> Result<BTreeMap<String, u32>, ErrorInfo> {
    defects
        .into_iter()
        .map(|(name, count)| {
            u32::try_from(count)
                .map(|count| (name.trim().to_string(), count))
                .map_err(|_| ErrorInfo::new("validation", "defect count is out of range"))
        })
        .collect()
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn to_data<T: Serialize>(value: T) -> Result<serde_json::Value, ErrorInfo> {
    serde_json::to_value(value).map_err(|err| {
        ErrorInfo::new(
            "serialization_error",
            format!("Failed to serialize response: {}", err),
        )
    })
}

fn write_response(stream: &mut UnixStream, response: Response) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, &response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}

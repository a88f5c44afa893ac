//! cabinetctl: command-line client for cabinetd.
//!
//! Every subcommand maps to one daemon method and prints the response payload
//! as JSON. The caller's identity comes from `--user`/`--email`/`--admin` or
//! the `CABINET_USER_ID`, `CABINET_USER_EMAIL` and `CABINET_ROLE` variables.
//!
//! Exit status is 0 on success, 1 when the daemon reports an error, and 2 when
//! the daemon cannot be reached.

mod client;

use cabinet_protocol::{Actor, Method, Role};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Map, Value};
use std::env;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cabinetctl")]
#[command(about = "Borrow, return and approve sample cabinet items")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    identity: Identity,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Identity {
    /// Caller id (defaults to $CABINET_USER_ID)
    #[arg(long, global = true)]
    user: Option<String>,

    /// Caller email (defaults to $CABINET_USER_EMAIL)
    #[arg(long, global = true)]
    email: Option<String>,

    /// Act as an admin (defaults to $CABINET_ROLE == "admin")
    #[arg(long, global = true)]
    admin: bool,
}

#[derive(Args)]
struct Page {
    #[arg(long)]
    page: Option<i64>,

    #[arg(long)]
    limit: Option<i64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Daemon health, session and sweep status
    Health,

    /// List items currently available to borrow
    Items {
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        package_code: Option<String>,
        #[command(flatten)]
        page: Page,
    },

    /// List the whole catalog, including items that are out
    Catalog {
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        package_code: Option<String>,
        /// Only items currently in the room
        #[arg(long)]
        available_only: bool,
        #[command(flatten)]
        page: Page,
    },

    /// Show one item by cabinet location
    Item { location: String },

    /// List item categories
    Categories,

    /// List package codes, optionally within one category
    PackageCodes {
        #[arg(long)]
        category: Option<String>,
    },

    /// List empty cabinet slots
    Slots,

    /// Add an empty cabinet slot (admin)
    AddSlot { location: String },

    /// Register an item into a cabinet
    Register {
        #[arg(long)]
        category: String,
        #[arg(long)]
        total_samples: i64,
        /// Omit to use the first empty slot
        #[arg(long)]
        location: Option<String>,
        #[arg(long)]
        package_code: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        shift: Option<String>,
        /// Defect count as NAME=COUNT; repeatable
        #[arg(long = "defect", value_name = "NAME=COUNT")]
        defects: Vec<String>,
    },

    /// Edit an item's description (admin or the user holding it)
    Edit {
        location: String,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        total_samples: Option<i64>,
        #[arg(long)]
        package_code: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        shift: Option<String>,
        /// Replaces all defect counts; NAME=COUNT, repeatable
        #[arg(long = "defect", value_name = "NAME=COUNT")]
        defects: Vec<String>,
    },

    /// Borrow the item at a cabinet location
    Borrow { location: String },

    /// List your borrows that can be returned
    Returnable,

    /// Your borrow history
    History {
        /// Borrowed, "In Progress" or Returned
        #[arg(long)]
        status: Option<String>,
        #[command(flatten)]
        page: Page,
    },

    /// Return a borrowed item
    Return {
        record_id: i64,
        #[arg(long)]
        samples: i64,
        /// Required when returning fewer samples than borrowed
        #[arg(long)]
        justification: Option<String>,
    },

    /// Resubmit the justification for a short return
    Justify { record_id: i64, justification: String },

    /// List your returns awaiting an admin decision
    Pending,

    /// Approve a short return (admin)
    Approve {
        record_id: i64,
        #[arg(long)]
        comments: Option<String>,
    },

    /// Reject a short return (admin)
    Reject {
        record_id: i64,
        #[arg(long)]
        comments: Option<String>,
    },

    /// All borrow records (admin)
    Borrowed {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        email: Option<String>,
        #[command(flatten)]
        page: Page,
    },

    /// Short returns awaiting a decision (admin)
    Approvals {
        #[command(flatten)]
        page: Page,
    },

    /// Borrows past their due time (admin)
    Overdue {
        #[command(flatten)]
        page: Page,
    },

    /// Dashboard counters (admin)
    Stats,

    /// Run the reminder sweep now (admin)
    Remind,

    /// Run the overdue sweep now (admin)
    OverdueSweep,

    /// Active user sessions (admin)
    Sessions,
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    let (method, params) = match request_for(cli.command) {
        Ok(request) => request,
        Err(err) => {
            eprintln!("cabinetctl: {}", err);
            std::process::exit(2);
        }
    };
    let actor = resolve_actor(&cli.identity, |key| env::var(key).ok());

    let socket = match client::socket_path() {
        Ok(path) => path,
        Err(err) => {
            eprintln!("cabinetctl: {}", err);
            std::process::exit(2);
        }
    };

    let request = client::build_request(method, actor, params);
    let response = match client::call(&socket, &request) {
        Ok(response) => response,
        Err(err) => {
            eprintln!("cabinetctl: {}", err);
            std::process::exit(2);
        }
    };

    if response.ok {
        print_json(&response.data.unwrap_or(Value::Null));
        return;
    }

    match response.error {
        Some(err) => {
            eprintln!("{}: {}", err.code, err.message);
            if let Some(details) = err.details {
                print_json(&details);
            }
        }
        None => eprintln!("Unknown daemon error"),
    }
    std::process::exit(1);
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(_) => println!("{}", value),
    }
}

/// Flags win over the environment. No id means an anonymous request.
fn resolve_actor(identity: &Identity, lookup: impl Fn(&str) -> Option<String>) -> Option<Actor> {
    let id = identity
        .user
        .clone()
        .or_else(|| lookup("CABINET_USER_ID"))
        .filter(|id| !id.trim().is_empty())?;
    let email = identity
        .email
        .clone()
        .or_else(|| lookup("CABINET_USER_EMAIL"))
        .unwrap_or_default();
    let admin = identity.admin
        || lookup("CABINET_ROLE").is_some_and(|role| role.eq_ignore_ascii_case("admin"));
    Some(Actor {
        id,
        email,
        role: if admin { Role::Admin } else { Role::User },
    })
}

fn request_for(command: Commands) -> Result<(Method, Option<Value>), String> {
    let request = match command {
        Commands::Health => (Method::GetHealth, None),
        Commands::Items {
            category,
            package_code,
            page,
        } => (
            Method::ListAvailableItems,
            params([
                ("category", category.map(Value::from)),
                ("package_code", package_code.map(Value::from)),
                ("page", page.page.map(Value::from)),
                ("limit", page.limit.map(Value::from)),
            ]),
        ),
        Commands::Catalog {
            category,
            package_code,
            available_only,
            page,
        } => (
            Method::ListItems,
            params([
                ("category", category.map(Value::from)),
                ("package_code", package_code.map(Value::from)),
                ("available_only", available_only.then_some(Value::Bool(true))),
                ("page", page.page.map(Value::from)),
                ("limit", page.limit.map(Value::from)),
            ]),
        ),
        Commands::Item { location } => (Method::GetItem, Some(json!({ "location": location }))),
        Commands::Categories => (Method::ListCategories, None),
        Commands::PackageCodes { category } => (
            Method::ListPackageCodes,
            params([("category", category.map(Value::from))]),
        ),
        Commands::Slots => (Method::ListUnassignedSlots, None),
        Commands::AddSlot { location } => (Method::AddSlot, Some(json!({ "location": location }))),
        Commands::Register {
            category,
            total_samples,
            location,
            package_code,
            description,
            shift,
            defects,
        } => {
            let mut body = params([
                ("category", Some(Value::from(category))),
                ("total_samples", Some(Value::from(total_samples))),
                ("location", location.map(Value::from)),
                ("package_code", package_code.map(Value::from)),
                ("package_description", description.map(Value::from)),
                ("shift", shift.map(Value::from)),
            ])
            .unwrap_or_else(|| json!({}));
            body["defects"] = parse_defects(&defects)?;
            (Method::RegisterItem, Some(body))
        }
        Commands::Edit {
            location,
            category,
            total_samples,
            package_code,
            description,
            shift,
            defects,
        } => {
            let defects = if defects.is_empty() {
                None
            } else {
                Some(parse_defects(&defects)?)
            };
            (
                Method::UpdateItem,
                params([
                    ("location", Some(Value::from(location))),
                    ("category", category.map(Value::from)),
                    ("total_samples", total_samples.map(Value::from)),
                    ("package_code", package_code.map(Value::from)),
                    ("package_description", description.map(Value::from)),
                    ("shift", shift.map(Value::from)),
                    ("defects", defects),
                ]),
            )
        }
        Commands::Borrow { location } => (Method::Borrow, Some(json!({ "location": location }))),
        Commands::Returnable => (Method::ListReturnable, None),
        Commands::History { status, page } => (
            Method::BorrowHistory,
            params([
                ("status", status.map(Value::from)),
                ("page", page.page.map(Value::from)),
                ("limit", page.limit.map(Value::from)),
            ]),
        ),
        Commands::Return {
            record_id,
            samples,
            justification,
        } => (
            Method::Return,
            params([
                ("record_id", Some(Value::from(record_id))),
                ("returned_samples", Some(Value::from(samples))),
                ("justification", justification.map(Value::from)),
            ]),
        ),
        Commands::Justify {
            record_id,
            justification,
        } => (
            Method::UpdateJustification,
            Some(json!({ "record_id": record_id, "justification": justification })),
        ),
        Commands::Pending => (Method::ListPendingReturns, None),
        Commands::Approve {
            record_id,
            comments,
        } => (Method::Approve, Some(decision(record_id, true, comments))),
        Commands::Reject {
            record_id,
            comments,
        } => (Method::Approve, Some(decision(record_id, false, comments))),
        Commands::Borrowed {
            status,
            email,
            page,
        } => (
            Method::ListAllBorrowed,
            params([
                ("status", status.map(Value::from)),
                ("borrower_email", email.map(Value::from)),
                ("page", page.page.map(Value::from)),
                ("limit", page.limit.map(Value::from)),
            ]),
        ),
        Commands::Approvals { page } => (Method::ListPendingApprovals, page_params(page)),
        Commands::Overdue { page } => (Method::ListOverdue, page_params(page)),
        Commands::Stats => (Method::DashboardStats, None),
        Commands::Remind => (Method::RunReminderSweep, None),
        Commands::OverdueSweep => (Method::RunOverdueSweep, None),
        Commands::Sessions => (Method::SessionStats, None),
    };
    Ok(request)
}

/// Builds a params object from the present fields; `None` when all are absent.
fn params<const N: usize>(fields: [(&str, Option<Value>); N]) -> Option<Value> {
    let map: Map<String, Value> = fields
        .into_iter()
        .filter_map(|(key, value)| value.map(|value| (key.to_string(), value)))
        .collect();
    if map.is_empty() {
        None
    } else {
        Some(Value::Object(map))
    }
}

fn page_params(page: Page) -> Option<Value> {
    params([
        ("page", page.page.map(Value::from)),
        ("limit", page.limit.map(Value::from)),
    ])
}

fn decision(record_id: i64, approved: bool, comments: Option<String>) -> Value {
    let mut body = json!({ "record_id": record_id, "approved": approved });
    if let Some(comments) = comments {
        body["admin_comments"] = Value::from(comments);
    }
    body
}

fn parse_defects(entries: &[String]) -> Result<Value, String> {
    let mut defects = Map::new();
    for entry in entries {
        let (name, count) = entry
            .split_once('=')
            .ok_or_else(|| format!("defect {:?} must look like NAME=COUNT", entry))?;
        let count: i64 = count
            .trim()
            .parse()
            .map_err(|_| format!("defect count in {:?} is not a number", entry))?;
        defects.insert(name.trim().to_string(), Value::from(count));
    }
    Ok(Value::Object(defects))
}

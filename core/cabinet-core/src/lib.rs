//! # cabinet-core
//!
//! Domain logic for the sample cabinet service: item and borrow-record types,
//! the borrow/return/approval decisions, reminder timing, user admission, and
//! notification delivery.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime dependency.
//! - **Storage-agnostic**: Decisions take the rows they need and return the
//!   mutation to apply. The daemon owns SQLite and transactions.
//! - **Caller-supplied time**: Every time-dependent function takes `now`.

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod notify;
pub mod sessions;
pub mod sweep;
pub mod types;

pub use config::{load_config, CabinetConfig};
pub use error::{LifecycleError, Result, ReturnShortfall};
pub use lifecycle::{
    is_borrowable, plan_approval, plan_borrow, plan_item_update, plan_justification_update,
    plan_return, require_admin, ApprovalPlan, BorrowPlan, LoanPolicy, ReturnPlan,
};
pub use notify::{Notice, Notifier, SpoolNotifier};
pub use sessions::{SessionLimit, SessionReaper, SessionStats, SessionTracker};
pub use types::*;

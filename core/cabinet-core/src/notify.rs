//! Outbound notifications.
//!
//! The lifecycle produces three kinds of mail: a reminder to the borrower
//! before the due time, an approval request to the admin on a short return,
//! and a decision back to the borrower. Delivery is behind [`Notifier`]; the
//! daemon ships [`SpoolNotifier`], which appends one JSON line per notice for
//! a separate mailer to drain.
//!
//! Notifications are best-effort. Callers send them after their transaction
//! commits and log failures; a failed send never rolls back a transition.

use chrono::{DateTime, Utc};
use fs_err as fs;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::types::{BorrowRecord, Item};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    Reminder {
        to: String,
        cabinet_location: String,
        category: Option<String>,
        package_code: String,
        expected_samples: u32,
        borrowed_at: DateTime<Utc>,
        due_at: DateTime<Utc>,
        hours_left: i64,
    },
    ApprovalRequest {
        to: String,
        /// Set when the borrower resubmitted a justification.
        updated: bool,
        borrower_email: String,
        record_id: i64,
        cabinet_location: String,
        package_code: String,
        expected_samples: u32,
        returned_samples: u32,
        missing_samples: u32,
        returned_at: Option<DateTime<Utc>>,
        justification: String,
    },
    Decision {
        to: String,
        approved: bool,
        record_id: i64,
        cabinet_location: String,
        package_code: String,
        expected_samples: u32,
        returned_samples: u32,
        justification: Option<String>,
        admin_comments: Option<String>,
    },
}

impl Notice {
    pub fn reminder(record: &BorrowRecord, item: Option<&Item>, hours_left: i64) -> Self {
        Notice::Reminder {
            to: record.borrower_email.clone(),
            cabinet_location: record.cabinet_location.clone(),
            category: item
                .and_then(|item| item.slot.category())
                .map(str::to_string),
            package_code: record.package_code.clone(),
            expected_samples: record.expected_samples,
            borrowed_at: record.borrowed_at,
            due_at: record.due_at,
            hours_left,
        }
    }

    pub fn approval_request(record: &BorrowRecord, admin_email: &str, updated: bool) -> Self {
        Notice::ApprovalRequest {
            to: admin_email.to_string(),
            updated,
            borrower_email: record.borrower_email.clone(),
            record_id: record.id,
            cabinet_location: record.cabinet_location.clone(),
            package_code: record.package_code.clone(),
            expected_samples: record.expected_samples,
            returned_samples: record.returned_samples.unwrap_or(0),
            missing_samples: record.missing_samples(),
            returned_at: record.returned_at,
            justification: record.justification.clone().unwrap_or_default(),
        }
    }

    pub fn decision(record: &BorrowRecord, approved: bool) -> Self {
        Notice::Decision {
            to: record.borrower_email.clone(),
            approved,
            record_id: record.id,
            cabinet_location: record.cabinet_location.clone(),
            package_code: record.package_code.clone(),
            expected_samples: record.expected_samples,
            returned_samples: record.returned_samples.unwrap_or(0),
            justification: record.justification.clone(),
            admin_comments: record.admin_comments.clone(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Notice::Reminder { .. } => "reminder",
            Notice::ApprovalRequest { .. } => "approval_request",
            Notice::Decision { .. } => "decision",
        }
    }

    pub fn recipient(&self) -> &str {
        match self {
            Notice::Reminder { to, .. }
            | Notice::ApprovalRequest { to, .. }
            | Notice::Decision { to, .. } => to,
        }
    }

    pub fn subject(&self) -> String {
        match self {
            Notice::Reminder {
                cabinet_location,
                hours_left,
                ..
            } => format!(
                "Return Reminder: {} - {} hours left",
                cabinet_location, hours_left
            ),
            Notice::ApprovalRequest { updated: false, .. } => {
                "Return Justification Required - Missing Samples".to_string()
            }
            Notice::ApprovalRequest { updated: true, .. } => {
                "Updated Return Justification - Missing Samples".to_string()
            }
            Notice::Decision { approved: true, .. } => {
                "Return Approved - Item Available Again".to_string()
            }
            Notice::Decision {
                approved: false, ..
            } => "Return Rejected - Additional Action Required".to_string(),
        }
    }
}

pub trait Notifier: Send + Sync {
    fn send(&self, notice: &Notice) -> Result<(), String>;
}

/// One spooled line.
#[derive(Debug, Serialize)]
struct SpoolEntry<'a> {
    queued_at: DateTime<Utc>,
    subject: String,
    #[serde(flatten)]
    notice: &'a Notice,
}

/// Appends notices to a JSON-lines file.
pub struct SpoolNotifier {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl SpoolNotifier {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, String> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| format!("Failed to create spool directory: {}", err))?;
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Notifier for SpoolNotifier {
    fn send(&self, notice: &Notice) -> Result<(), String> {
        let entry = SpoolEntry {
            queued_at: Utc::now(),
            subject: notice.subject(),
            notice,
        };
        let mut line = serde_json::to_vec(&entry)
            .map_err(|err| format!("Failed to serialize notice: {}", err))?;
        line.push(b'\n');

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| "Spool lock poisoned".to_string())?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| format!("Failed to open spool: {}", err))?;
        file.write_all(&line)
            .map_err(|err| format!("Failed to write spool: {}", err))?;
        tracing::debug!(
            kind = notice.kind(),
            to = %notice.recipient(),
            "Notice spooled"
        );
        Ok(())
    }
}

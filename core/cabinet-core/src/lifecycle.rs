//! Borrow/return/approval decisions.
//!
//! Every function here is pure: it receives the rows the storage layer loaded
//! inside its write transaction, checks preconditions in a fixed order, and
//! returns the mutation to apply. The caller commits the mutation only when a
//! plan comes back `Ok`, so a rejected transition never leaves partial state.
//!
//! ```text
//!             borrow                 return == expected
//!   (none) ──────────▶ Borrowed ───────────────────────────▶ Returned
//!                          │                                     ▲
//!                          │ return < expected + justification   │ approve
//!                          ▼                                     │
//!                     In Progress (approval = null) ─────────────┘
//!                          │    ▲
//!                   reject │    │ resubmit justification
//!                          ▼    │
//!                     In Progress (approval = false)
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::error::{LifecycleError, Result, ReturnShortfall};
use crate::types::{
    Availability, BorrowRecord, Item, ItemUpdate, ReturnStatus, Slot, UNASSIGNED_CATEGORY,
};
use cabinet_protocol::Actor;

pub const DEFAULT_LOAN_HOURS: i64 = 24;
pub const DEFAULT_REMINDER_WINDOW_HOURS: i64 = 2;

/// Time policy for loans and reminders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoanPolicy {
    pub loan_duration: Duration,
    pub reminder_window: Duration,
}

impl Default for LoanPolicy {
    fn default() -> Self {
        Self {
            loan_duration: Duration::hours(DEFAULT_LOAN_HOURS),
            reminder_window: Duration::hours(DEFAULT_REMINDER_WINDOW_HOURS),
        }
    }
}

/// Availability gate: present in the room and an actual item, not an empty
/// cabinet slot.
pub fn is_borrowable(item: &Item) -> bool {
    item.availability == Availability::Yes && matches!(item.slot, Slot::Assigned { .. })
}

// ─────────────────────────────────────────────────────────────────────────────
// Borrow
// ─────────────────────────────────────────────────────────────────────────────

/// Row to insert for a successful borrow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BorrowPlan {
    pub cabinet_location: String,
    pub package_code: String,
    pub user_id: String,
    pub borrower_email: String,
    pub borrowed_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
    pub expected_samples: u32,
}

pub fn plan_borrow(
    location: &str,
    item: Option<&Item>,
    active: Option<&BorrowRecord>,
    actor: &Actor,
    now: DateTime<Utc>,
    policy: &LoanPolicy,
) -> Result<BorrowPlan> {
    let item = item.ok_or_else(|| LifecycleError::NotFound("Item not found".to_string()))?;

    if item.slot == Slot::Unassigned {
        return Err(LifecycleError::InvalidState(
            "Cannot borrow from an unassigned cabinet".to_string(),
        ));
    }
    // An out-of-room item with a live record lost a borrow race; report the
    // conflict rather than the flag it caused.
    if active.map(|record| record.status.is_active()).unwrap_or(false) {
        return Err(LifecycleError::Conflict(
            "Item is already borrowed".to_string(),
        ));
    }
    if !is_borrowable(item) {
        return Err(LifecycleError::InvalidState(
            "Item is not available for borrowing".to_string(),
        ));
    }

    let due_at = now
        .checked_add_signed(policy.loan_duration)
        .ok_or_else(|| {
            LifecycleError::InvalidState("Loan duration puts the due date out of range".to_string())
        })?;

    Ok(BorrowPlan {
        cabinet_location: location.to_string(),
        package_code: item.package_code.clone().unwrap_or_default(),
        user_id: actor.id.clone(),
        borrower_email: actor.email.clone(),
        borrowed_at: now,
        due_at,
        expected_samples: item.sample_baseline(),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Return
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReturnPlan {
    /// Full count back: the record closes and the item is available again.
    Completed {
        returned_at: DateTime<Utc>,
        returned_samples: u32,
    },
    /// Short return: held for an admin decision, item stays out.
    PendingApproval {
        returned_at: DateTime<Utc>,
        returned_samples: u32,
        justification: String,
        missing_samples: u32,
    },
}

impl ReturnPlan {
    pub fn status(&self) -> ReturnStatus {
        match self {
            ReturnPlan::Completed { .. } => ReturnStatus::Returned,
            ReturnPlan::PendingApproval { .. } => ReturnStatus::InProgress,
        }
    }
}

/// `record` must already be scoped to the requesting owner.
pub fn plan_return(
    record: Option<&BorrowRecord>,
    returned_samples: u32,
    justification: Option<&str>,
    now: DateTime<Utc>,
) -> Result<ReturnPlan> {
    let record = record
        .filter(|record| record.status == ReturnStatus::Borrowed)
        .ok_or_else(|| {
            LifecycleError::NotFound("No active borrow record found for this item".to_string())
        })?;

    let expected = record.expected_samples;
    let justification = justification
        .map(str::trim)
        .filter(|value| !value.is_empty());

    match returned_samples.cmp(&expected) {
        std::cmp::Ordering::Equal => Ok(ReturnPlan::Completed {
            returned_at: now,
            returned_samples,
        }),
        std::cmp::Ordering::Less => match justification {
            Some(text) => Ok(ReturnPlan::PendingApproval {
                returned_at: now,
                returned_samples,
                justification: text.to_string(),
                missing_samples: expected - returned_samples,
            }),
            None => Err(LifecycleError::Validation {
                message: "Justification is required when returning fewer samples than expected"
                    .to_string(),
                shortfall: Some(ReturnShortfall {
                    requires_justification: true,
                    expected_samples: expected,
                    returned_samples,
                }),
            }),
        },
        std::cmp::Ordering::Greater => Err(LifecycleError::validation(
            "Cannot return more samples than expected",
        )),
    }
}

/// Re-requests approval with a new justification. A record that was rejected
/// goes back into the admin queue.
pub fn plan_justification_update(
    record: Option<&BorrowRecord>,
    justification: &str,
) -> Result<String> {
    let trimmed = justification.trim();
    if trimmed.is_empty() {
        return Err(LifecycleError::validation("Justification is required"));
    }

    record
        .filter(|record| {
            record.status == ReturnStatus::InProgress && record.admin_approved != Some(true)
        })
        .ok_or_else(|| LifecycleError::NotFound("Pending return record not found".to_string()))?;

    Ok(trimmed.to_string())
}

// ─────────────────────────────────────────────────────────────────────────────
// Approval
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalPlan {
    /// Closes the record and accepts the returned count as the item's new
    /// baseline.
    Approve {
        admin_comments: Option<String>,
        accepted_samples: u32,
    },
    /// Leaves the record In Progress; the item stays out.
    Reject { admin_comments: Option<String> },
}

impl ApprovalPlan {
    pub fn approved(&self) -> bool {
        matches!(self, ApprovalPlan::Approve { .. })
    }

    pub fn admin_comments(&self) -> Option<&str> {
        match self {
            ApprovalPlan::Approve { admin_comments, .. }
            | ApprovalPlan::Reject { admin_comments } => admin_comments.as_deref(),
        }
    }
}

pub fn plan_approval(
    record: Option<&BorrowRecord>,
    approved: bool,
    admin_comments: Option<&str>,
) -> Result<ApprovalPlan> {
    let record = record
        .filter(|record| record.awaiting_decision())
        .ok_or_else(|| LifecycleError::NotFound("Pending return record not found".to_string()))?;

    let admin_comments = admin_comments
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);

    if approved {
        let accepted_samples = record.returned_samples.ok_or_else(|| {
            LifecycleError::InvalidState(format!(
                "Pending return {} has no returned sample count",
                record.id
            ))
        })?;
        Ok(ApprovalPlan::Approve {
            admin_comments,
            accepted_samples,
        })
    } else {
        Ok(ApprovalPlan::Reject { admin_comments })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Item edits
// ─────────────────────────────────────────────────────────────────────────────

/// Checks a descriptive edit. Only an admin or the user the item is recorded
/// against may edit it, and an empty cabinet slot has nothing to edit.
pub fn plan_item_update(item: Option<&Item>, update: &ItemUpdate, actor: &Actor) -> Result<()> {
    let item = item.ok_or_else(|| LifecycleError::NotFound("Item not found".to_string()))?;

    let owner = item
        .taken_by
        .as_deref()
        .is_some_and(|email| email.eq_ignore_ascii_case(&actor.email));
    if !actor.is_admin() && !owner {
        return Err(LifecycleError::Forbidden(
            "Can only update your own items".to_string(),
        ));
    }
    if item.slot == Slot::Unassigned {
        return Err(LifecycleError::InvalidState(
            "Cabinet is empty; register an item into it first".to_string(),
        ));
    }

    if let Some(category) = update.category.as_deref() {
        let category = category.trim();
        if category.is_empty() || category == UNASSIGNED_CATEGORY {
            return Err(LifecycleError::validation(
                "Category must name an item category",
            ));
        }
    }
    if update.total_samples == Some(0) {
        return Err(LifecycleError::validation(
            "total_samples must be a positive count",
        ));
    }
    if *update == ItemUpdate::default() {
        return Err(LifecycleError::validation("No item fields to update"));
    }
    Ok(())
}

/// Admin-only operations check this before touching storage.
pub fn require_admin(actor: &Actor) -> Result<()> {
    if actor.is_admin() {
        Ok(())
    } else {
        Err(LifecycleError::Forbidden(
            "Admin access required".to_string(),
        ))
    }
}

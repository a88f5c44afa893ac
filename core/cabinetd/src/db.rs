//! SQLite persistence for cabinetd.
//!
//! The daemon is the single writer. Every lifecycle transition runs inside one
//! `BEGIN IMMEDIATE` transaction: the rows handed to the pure decision in
//! `cabinet_core::lifecycle` cannot change under it, and a rejected decision
//! drops the transaction without writing anything. A partial unique index on
//! active borrow records backs the one-active-borrow-per-cabinet rule at the
//! storage level.
//!
//! Plain reads return `Result<T, String>`; transitions return
//! `cabinet_core::Result<T>` so storage failures surface as `Transient`.

use cabinet_core::lifecycle::{self, ApprovalPlan, LoanPolicy, ReturnPlan};
use cabinet_core::{
    Availability, BorrowFilter, BorrowRecord, BorrowView, DashboardStats, Item, ItemFilter,
    ItemUpdate, LifecycleError, NewItem, PageRequest, ReturnStatus, Slot, UNASSIGNED_CATEGORY,
};
use cabinet_protocol::Actor;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{
    params, params_from_iter, Connection, ErrorCode, OpenFlags, OptionalExtension, Row,
    Transaction, TransactionBehavior,
};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

const ITEM_COLUMNS: &str = "location, category, package_code, package_description, shift, \
     total_samples, current_samples, availability, taken_by";

const RECORD_COLUMNS: &str = "id, cabinet_location, package_code, user_id, borrower_email, \
     borrowed_at, due_at, returned_at, return_status, expected_samples, returned_samples, \
     justification, admin_approved, admin_comments, reminder_sent, created_at, updated_at";

pub struct Db {
    path: PathBuf,
}

impl Db {
    pub fn new(path: PathBuf) -> Result<Self, String> {
        let db = Self { path };
        db.init_schema()?;
        Ok(db)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Items
    // ─────────────────────────────────────────────────────────────────────

    pub fn get_item(&self, location: &str) -> Result<Option<Item>, String> {
        self.with_connection(|conn| select_item(conn, location))
    }

    /// Borrowable items, most samples first.
    pub fn list_available_items(
        &self,
        filter: &ItemFilter,
        page: PageRequest,
    ) -> Result<(Vec<Item>, u64), String> {
        self.with_connection(|conn| page_of_items(conn, filter, true, page))
    }

    /// The whole catalog, including items that are out. Empty slots are
    /// listed separately.
    pub fn list_items(
        &self,
        filter: &ItemFilter,
        available_only: bool,
        page: PageRequest,
    ) -> Result<(Vec<Item>, u64), String> {
        self.with_connection(|conn| page_of_items(conn, filter, available_only, page))
    }

    pub fn list_categories(&self) -> Result<Vec<String>, String> {
        self.with_connection(|conn| {
            query_strings(
                conn,
                "SELECT DISTINCT category FROM items WHERE category <> ?1 ORDER BY category ASC",
                &[SqlValue::Text(UNASSIGNED_CATEGORY.to_string())],
            )
        })
    }

    pub fn list_package_codes(&self, category: Option<&str>) -> Result<Vec<String>, String> {
        self.with_connection(|conn| {
            let mut sql = "SELECT DISTINCT package_code FROM items \
                           WHERE category <> ? AND package_code IS NOT NULL AND package_code <> ''"
                .to_string();
            let mut values = vec![SqlValue::Text(UNASSIGNED_CATEGORY.to_string())];
            if let Some(category) = category {
                sql.push_str(" AND category = ?");
                values.push(SqlValue::Text(category.to_string()));
            }
            sql.push_str(" ORDER BY package_code ASC");
            query_strings(conn, &sql, &values)
        })
    }

    pub fn list_unassigned_slots(&self) -> Result<Vec<String>, String> {
        self.with_connection(|conn| {
            query_strings(
                conn,
                "SELECT location FROM items WHERE category = ?1 ORDER BY location ASC",
                &[SqlValue::Text(UNASSIGNED_CATEGORY.to_string())],
            )
        })
    }

    /// Adds an empty cabinet slot that registration can later fill.
    pub fn add_slot(&self, location: &str, now: DateTime<Utc>) -> cabinet_core::Result<Item> {
        self.transact(|tx| {
            if select_item(tx, location)
                .map_err(LifecycleError::Transient)?
                .is_some()
            {
                return Err(LifecycleError::Conflict(format!(
                    "Cabinet location {} already exists",
                    location
                )));
            }
            let stamp = format_ts(now);
            tx.execute(
                "INSERT INTO items \
                    (location, category, total_samples, availability, created_at, updated_at) \
                 VALUES (?1, ?2, 0, 'YES', ?3, ?3)",
                params![location, UNASSIGNED_CATEGORY, stamp],
            )
            .map_err(|err| storage_error("insert cabinet slot", err))?;
            load_item(tx, location)
        })
    }

    /// Registers an item at `item.location`, or in the first unassigned slot
    /// when no location is given. A named location must be new or an
    /// unassigned slot.
    pub fn register_item(
        &self,
        item: &NewItem,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> cabinet_core::Result<Item> {
        self.transact(|tx| {
            let stamp = format_ts(now);
            let location = match item.location.as_deref() {
                Some(location) => {
                    let existing = select_item(tx, location).map_err(LifecycleError::Transient)?;
                    match existing.map(|existing| existing.slot) {
                        Some(Slot::Unassigned) => {
                            fill_slot(tx, location, item, actor, &stamp)?;
                        }
                        Some(Slot::Assigned { .. }) => {
                            return Err(LifecycleError::Conflict(format!(
                                "Item with cabinet location {} already exists",
                                location
                            )));
                        }
                        None => {
                            tx.execute(
                                "INSERT INTO items \
                                    (location, category, package_code, package_description, \
                                     shift, total_samples, current_samples, availability, \
                                     taken_by, created_at, updated_at) \
                                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, 'YES', ?7, ?8, ?8)",
                                params![
                                    location,
                                    item.category,
                                    item.package_code,
                                    item.package_description,
                                    item.shift,
                                    i64::from(item.total_samples),
                                    actor.email,
                                    stamp
                                ],
                            )
                            .map_err(|err| storage_error("insert item", err))?;
                        }
                    }
                    location.to_string()
                }
                None => {
                    let slot: Option<String> = tx
                        .query_row(
                            "SELECT location FROM items WHERE category = ?1 \
                             ORDER BY location ASC LIMIT 1",
                            params![UNASSIGNED_CATEGORY],
                            |row| row.get(0),
                        )
                        .optional()
                        .map_err(|err| storage_error("find unassigned cabinet", err))?;
                    let location = slot.ok_or_else(|| {
                        LifecycleError::InvalidState(
                            "No unassigned cabinet is available".to_string(),
                        )
                    })?;
                    fill_slot(tx, &location, item, actor, &stamp)?;
                    location
                }
            };

            replace_defects(tx, &location, &item.defects)?;
            load_item(tx, &location)
        })
    }

    /// Applies a descriptive edit. Availability and `current_samples` are
    /// left to the borrow lifecycle.
    pub fn update_item(
        &self,
        location: &str,
        update: &ItemUpdate,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> cabinet_core::Result<Item> {
        self.transact(|tx| {
            let item = select_item(tx, location).map_err(LifecycleError::Transient)?;
            lifecycle::plan_item_update(item.as_ref(), update, actor)?;

            let changed = tx
                .execute(
                    "UPDATE items SET \
                        category = COALESCE(?1, category), \
                        package_code = COALESCE(?2, package_code), \
                        package_description = COALESCE(?3, package_description), \
                        shift = COALESCE(?4, shift), \
                        total_samples = COALESCE(?5, total_samples), \
                        updated_at = ?6 \
                     WHERE location = ?7 AND category <> ?8",
                    params![
                        update.category.as_deref().map(str::trim),
                        update.package_code,
                        update.package_description,
                        update.shift,
                        update.total_samples.map(i64::from),
                        format_ts(now),
                        location,
                        UNASSIGNED_CATEGORY
                    ],
                )
                .map_err(|err| storage_error("update item", err))?;
            if changed != 1 {
                return Err(LifecycleError::NotFound("Item not found".to_string()));
            }
            if let Some(defects) = &update.defects {
                replace_defects(tx, location, defects)?;
            }
            load_item(tx, location)
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Transitions
    // ─────────────────────────────────────────────────────────────────────

    pub fn borrow(
        &self,
        location: &str,
        actor: &Actor,
        now: DateTime<Utc>,
        policy: &LoanPolicy,
    ) -> cabinet_core::Result<BorrowView> {
        self.transact(|tx| {
            let item = select_item(tx, location).map_err(LifecycleError::Transient)?;
            let active = select_active_record(tx, location).map_err(LifecycleError::Transient)?;
            let plan = lifecycle::plan_borrow(
                location,
                item.as_ref(),
                active.as_ref(),
                actor,
                now,
                policy,
            )?;

            let stamp = format_ts(now);
            tx.execute(
                "INSERT INTO borrow_history \
                    (cabinet_location, package_code, user_id, borrower_email, borrowed_at, \
                     due_at, return_status, expected_samples, reminder_sent, created_at, \
                     updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?9)",
                params![
                    plan.cabinet_location,
                    plan.package_code,
                    plan.user_id,
                    plan.borrower_email,
                    format_ts(plan.borrowed_at),
                    format_ts(plan.due_at),
                    ReturnStatus::Borrowed.as_str(),
                    i64::from(plan.expected_samples),
                    stamp
                ],
            )
            .map_err(|err| {
                if is_constraint_violation(&err) {
                    LifecycleError::Conflict("Item is already borrowed".to_string())
                } else {
                    storage_error("insert borrow record", err)
                }
            })?;
            let record_id = tx.last_insert_rowid();

            let changed = tx
                .execute(
                    "UPDATE items SET availability = 'NO', taken_by = ?1, updated_at = ?2 \
                     WHERE location = ?3 AND availability = 'YES'",
                    params![plan.borrower_email, stamp, plan.cabinet_location],
                )
                .map_err(|err| storage_error("mark item borrowed", err))?;
            if changed != 1 {
                return Err(LifecycleError::Conflict(
                    "Item is already borrowed".to_string(),
                ));
            }

            load_view(tx, record_id)
        })
    }

    /// `actor_id` scopes the lookup: a user can only return their own borrow.
    pub fn return_record(
        &self,
        record_id: i64,
        actor_id: &str,
        returned_samples: u32,
        justification: Option<&str>,
        now: DateTime<Utc>,
    ) -> cabinet_core::Result<(ReturnPlan, BorrowView)> {
        self.transact(|tx| {
            let record =
                select_owned_record(tx, record_id, actor_id).map_err(LifecycleError::Transient)?;
            let plan =
                lifecycle::plan_return(record.as_ref(), returned_samples, justification, now)?;
            let stamp = format_ts(now);

            let changed = match &plan {
                ReturnPlan::Completed {
                    returned_at,
                    returned_samples,
                } => tx.execute(
                    "UPDATE borrow_history SET \
                        return_status = ?1, returned_at = ?2, returned_samples = ?3, \
                        updated_at = ?4 \
                     WHERE id = ?5 AND user_id = ?6 AND return_status = ?7",
                    params![
                        ReturnStatus::Returned.as_str(),
                        format_ts(*returned_at),
                        i64::from(*returned_samples),
                        stamp,
                        record_id,
                        actor_id,
                        ReturnStatus::Borrowed.as_str()
                    ],
                ),
                ReturnPlan::PendingApproval {
                    returned_at,
                    returned_samples,
                    justification,
                    ..
                } => tx.execute(
                    "UPDATE borrow_history SET \
                        return_status = ?1, returned_at = ?2, returned_samples = ?3, \
                        justification = ?4, admin_approved = NULL, updated_at = ?5 \
                     WHERE id = ?6 AND user_id = ?7 AND return_status = ?8",
                    params![
                        ReturnStatus::InProgress.as_str(),
                        format_ts(*returned_at),
                        i64::from(*returned_samples),
                        justification,
                        stamp,
                        record_id,
                        actor_id,
                        ReturnStatus::Borrowed.as_str()
                    ],
                ),
            }
            .map_err(|err| storage_error("update borrow record", err))?;
            if changed != 1 {
                return Err(LifecycleError::NotFound(
                    "No active borrow record found for this item".to_string(),
                ));
            }

            if matches!(plan, ReturnPlan::Completed { .. }) {
                let location = record_location(record.as_ref())?;
                release_item(tx, location, None, &stamp)?;
            }
            let view = load_view(tx, record_id)?;
            Ok((plan, view))
        })
    }

    /// Stores a new justification on the actor's pending return and puts it
    /// back in the approval queue.
    pub fn update_justification(
        &self,
        record_id: i64,
        actor_id: &str,
        justification: &str,
        now: DateTime<Utc>,
    ) -> cabinet_core::Result<BorrowView> {
        self.transact(|tx| {
            let record =
                select_owned_record(tx, record_id, actor_id).map_err(LifecycleError::Transient)?;
            let text = lifecycle::plan_justification_update(record.as_ref(), justification)?;

            let changed = tx
                .execute(
                    "UPDATE borrow_history SET \
                        justification = ?1, admin_approved = NULL, admin_comments = NULL, \
                        updated_at = ?2 \
                     WHERE id = ?3 AND user_id = ?4 AND return_status = ?5 \
                       AND (admin_approved IS NULL OR admin_approved = 0)",
                    params![
                        text,
                        format_ts(now),
                        record_id,
                        actor_id,
                        ReturnStatus::InProgress.as_str()
                    ],
                )
                .map_err(|err| storage_error("update justification", err))?;
            if changed != 1 {
                return Err(LifecycleError::NotFound(
                    "Pending return record not found".to_string(),
                ));
            }
            load_view(tx, record_id)
        })
    }

    pub fn decide(
        &self,
        record_id: i64,
        approved: bool,
        admin_comments: Option<&str>,
        now: DateTime<Utc>,
    ) -> cabinet_core::Result<(ApprovalPlan, BorrowView)> {
        self.transact(|tx| {
            let record = select_record(tx, record_id).map_err(LifecycleError::Transient)?;
            let plan = lifecycle::plan_approval(record.as_ref(), approved, admin_comments)?;
            let stamp = format_ts(now);

            let changed = match &plan {
                ApprovalPlan::Approve { admin_comments, .. } => tx.execute(
                    "UPDATE borrow_history SET \
                        return_status = ?1, admin_approved = 1, admin_comments = ?2, \
                        updated_at = ?3 \
                     WHERE id = ?4 AND return_status = ?5 AND admin_approved IS NULL",
                    params![
                        ReturnStatus::Returned.as_str(),
                        admin_comments,
                        stamp,
                        record_id,
                        ReturnStatus::InProgress.as_str()
                    ],
                ),
                ApprovalPlan::Reject { admin_comments } => tx.execute(
                    "UPDATE borrow_history SET \
                        admin_approved = 0, admin_comments = ?1, updated_at = ?2 \
                     WHERE id = ?3 AND return_status = ?4 AND admin_approved IS NULL",
                    params![
                        admin_comments,
                        stamp,
                        record_id,
                        ReturnStatus::InProgress.as_str()
                    ],
                ),
            }
            .map_err(|err| storage_error("record approval decision", err))?;
            if changed != 1 {
                return Err(LifecycleError::NotFound(
                    "Pending return record not found".to_string(),
                ));
            }

            if let ApprovalPlan::Approve {
                accepted_samples, ..
            } = &plan
            {
                let location = record_location(record.as_ref())?;
                release_item(tx, location, Some(*accepted_samples), &stamp)?;
            }
            let view = load_view(tx, record_id)?;
            Ok((plan, view))
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Borrow record reads
    // ─────────────────────────────────────────────────────────────────────

    pub fn get_record(&self, record_id: i64) -> Result<Option<BorrowRecord>, String> {
        self.with_connection(|conn| select_record(conn, record_id))
    }

    /// The actor's open borrows, newest first.
    pub fn list_returnable(&self, user_id: &str) -> Result<Vec<BorrowView>, String> {
        self.with_connection(|conn| {
            let records = query_records(
                conn,
                &format!(
                    "SELECT {} FROM borrow_history WHERE user_id = ?1 AND return_status = ?2 \
                     ORDER BY borrowed_at DESC, id DESC",
                    RECORD_COLUMNS
                ),
                &[
                    SqlValue::Text(user_id.to_string()),
                    SqlValue::Text(ReturnStatus::Borrowed.as_str().to_string()),
                ],
            )?;
            attach_items(conn, records)
        })
    }

    /// The actor's returns awaiting (or refused) approval, most recent first.
    pub fn list_pending_returns(&self, user_id: &str) -> Result<Vec<BorrowView>, String> {
        self.with_connection(|conn| {
            let records = query_records(
                conn,
                &format!(
                    "SELECT {} FROM borrow_history WHERE user_id = ?1 AND return_status = ?2 \
                     ORDER BY returned_at DESC, id DESC",
                    RECORD_COLUMNS
                ),
                &[
                    SqlValue::Text(user_id.to_string()),
                    SqlValue::Text(ReturnStatus::InProgress.as_str().to_string()),
                ],
            )?;
            attach_items(conn, records)
        })
    }

    pub fn borrow_history(
        &self,
        user_id: &str,
        status: Option<ReturnStatus>,
        page: PageRequest,
    ) -> Result<(Vec<BorrowView>, u64), String> {
        self.with_connection(|conn| {
            let mut where_clause = "user_id = ?".to_string();
            let mut values = vec![SqlValue::Text(user_id.to_string())];
            if let Some(status) = status {
                where_clause.push_str(" AND return_status = ?");
                values.push(SqlValue::Text(status.as_str().to_string()));
            }
            page_of_records(
                conn,
                &where_clause,
                values,
                "borrowed_at DESC, id DESC",
                page,
            )
        })
    }

    pub fn list_all_borrowed(
        &self,
        filter: &BorrowFilter,
        page: PageRequest,
    ) -> Result<(Vec<BorrowView>, u64), String> {
        self.with_connection(|conn| {
            let mut clauses = vec!["1 = 1".to_string()];
            let mut values = Vec::new();
            if let Some(status) = filter.status {
                clauses.push("return_status = ?".to_string());
                values.push(SqlValue::Text(status.as_str().to_string()));
            }
            if let Some(email) = &filter.borrower_email {
                clauses.push("instr(lower(borrower_email), lower(?)) > 0".to_string());
                values.push(SqlValue::Text(email.clone()));
            }
            page_of_records(
                conn,
                &clauses.join(" AND "),
                values,
                "borrowed_at DESC, id DESC",
                page,
            )
        })
    }

    /// Undecided short returns, oldest return first.
    pub fn list_pending_approvals(
        &self,
        page: PageRequest,
    ) -> Result<(Vec<BorrowView>, u64), String> {
        self.with_connection(|conn| {
            page_of_records(
                conn,
                "return_status = ? AND admin_approved IS NULL",
                vec![SqlValue::Text(ReturnStatus::InProgress.as_str().to_string())],
                "returned_at ASC, id ASC",
                page,
            )
        })
    }

    pub fn list_overdue(
        &self,
        now: DateTime<Utc>,
        page: PageRequest,
    ) -> Result<(Vec<BorrowView>, u64), String> {
        self.with_connection(|conn| {
            page_of_records(
                conn,
                "return_status = ? AND due_at < ?",
                vec![
                    SqlValue::Text(ReturnStatus::Borrowed.as_str().to_string()),
                    SqlValue::Text(format_ts(now)),
                ],
                "due_at ASC, id ASC",
                page,
            )
        })
    }

    /// Every overdue borrow, for the observational sweep.
    pub fn overdue_records(&self, now: DateTime<Utc>) -> Result<Vec<BorrowRecord>, String> {
        self.with_connection(|conn| {
            query_records(
                conn,
                &format!(
                    "SELECT {} FROM borrow_history WHERE return_status = ?1 AND due_at < ?2 \
                     ORDER BY due_at ASC, id ASC",
                    RECORD_COLUMNS
                ),
                &[
                    SqlValue::Text(ReturnStatus::Borrowed.as_str().to_string()),
                    SqlValue::Text(format_ts(now)),
                ],
            )
        })
    }

    /// Unreminded borrows with `after < due_at <= until`.
    pub fn reminder_candidates(
        &self,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<BorrowView>, String> {
        self.with_connection(|conn| {
            let records = query_records(
                conn,
                &format!(
                    "SELECT {} FROM borrow_history \
                     WHERE return_status = ?1 AND reminder_sent = 0 \
                       AND due_at > ?2 AND due_at <= ?3 \
                     ORDER BY due_at ASC, id ASC",
                    RECORD_COLUMNS
                ),
                &[
                    SqlValue::Text(ReturnStatus::Borrowed.as_str().to_string()),
                    SqlValue::Text(format_ts(after)),
                    SqlValue::Text(format_ts(until)),
                ],
            )?;
            attach_items(conn, records)
        })
    }

    /// Flips `reminder_sent` if nobody has yet. The caller sends only when
    /// this returns true, so each record is reminded at most once.
    pub fn claim_reminder(&self, record_id: i64, now: DateTime<Utc>) -> Result<bool, String> {
        self.with_connection(|conn| {
            let changed = conn
                .execute(
                    "UPDATE borrow_history SET reminder_sent = 1, updated_at = ?1 \
                     WHERE id = ?2 AND reminder_sent = 0 AND return_status = ?3",
                    params![format_ts(now), record_id, ReturnStatus::Borrowed.as_str()],
                )
                .map_err(|err| format!("Failed to claim reminder: {}", err))?;
            Ok(changed == 1)
        })
    }

    pub fn dashboard_stats(&self, now: DateTime<Utc>) -> Result<DashboardStats, String> {
        self.with_connection(|conn| {
            let status = |value: ReturnStatus| SqlValue::Text(value.as_str().to_string());
            let sentinel = SqlValue::Text(UNASSIGNED_CATEGORY.to_string());
            Ok(DashboardStats {
                total_borrowed: count(
                    conn,
                    "SELECT COUNT(*) FROM borrow_history WHERE return_status = ?",
                    &[status(ReturnStatus::Borrowed)],
                )?,
                pending_returns: count(
                    conn,
                    "SELECT COUNT(*) FROM borrow_history WHERE return_status = ?",
                    &[status(ReturnStatus::InProgress)],
                )?,
                overdue_items: count(
                    conn,
                    "SELECT COUNT(*) FROM borrow_history WHERE return_status = ? AND due_at < ?",
                    &[
                        status(ReturnStatus::Borrowed),
                        SqlValue::Text(format_ts(now)),
                    ],
                )?,
                total_returned: count(
                    conn,
                    "SELECT COUNT(*) FROM borrow_history WHERE return_status = ?",
                    &[status(ReturnStatus::Returned)],
                )?,
                available_items: count(
                    conn,
                    "SELECT COUNT(*) FROM items WHERE availability = 'YES' AND category <> ?",
                    &[sentinel.clone()],
                )?,
                total_items: count(
                    conn,
                    "SELECT COUNT(*) FROM items WHERE category <> ?",
                    &[sentinel],
                )?,
                pending_approvals: count(
                    conn,
                    "SELECT COUNT(*) FROM borrow_history \
                     WHERE return_status = ? AND admin_approved IS NULL",
                    &[status(ReturnStatus::InProgress)],
                )?,
            })
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Plumbing
    // ─────────────────────────────────────────────────────────────────────

    fn init_schema(&self) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS items (
                    location TEXT PRIMARY KEY,
                    category TEXT NOT NULL,
                    package_code TEXT,
                    package_description TEXT,
                    shift TEXT,
                    total_samples INTEGER NOT NULL DEFAULT 0,
                    current_samples INTEGER,
                    availability TEXT NOT NULL DEFAULT 'YES',
                    taken_by TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS item_defects (
                    location TEXT NOT NULL,
                    defect TEXT NOT NULL,
                    count INTEGER NOT NULL,
                    PRIMARY KEY (location, defect)
                 );
                 CREATE TABLE IF NOT EXISTS borrow_history (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    cabinet_location TEXT NOT NULL,
                    package_code TEXT NOT NULL DEFAULT '',
                    user_id TEXT NOT NULL,
                    borrower_email TEXT NOT NULL,
                    borrowed_at TEXT NOT NULL,
                    due_at TEXT NOT NULL,
                    returned_at TEXT,
                    return_status TEXT NOT NULL,
                    expected_samples INTEGER NOT NULL,
                    returned_samples INTEGER,
                    justification TEXT,
                    admin_approved INTEGER,
                    admin_comments TEXT,
                    reminder_sent INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                 );
                 CREATE UNIQUE INDEX IF NOT EXISTS borrow_history_one_active
                    ON borrow_history(cabinet_location)
                    WHERE return_status IN ('Borrowed', 'In Progress');
                 CREATE INDEX IF NOT EXISTS borrow_history_user
                    ON borrow_history(user_id, return_status);
                 CREATE INDEX IF NOT EXISTS borrow_history_due
                    ON borrow_history(return_status, due_at);
                 COMMIT;",
            )
            .map_err(|err| format!("Failed to initialize schema: {}", err))
        })
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, String>,
    ) -> Result<T, String> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    /// Runs `op` in an IMMEDIATE transaction; any error rolls it back.
    fn transact<T>(
        &self,
        op: impl FnOnce(&Transaction<'_>) -> cabinet_core::Result<T>,
    ) -> cabinet_core::Result<T> {
        let mut conn = self.open().map_err(LifecycleError::Transient)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| storage_error("start transaction", err))?;
        let value = op(&tx)?;
        tx.commit()
            .map_err(|err| storage_error("commit transaction", err))?;
        Ok(value)
    }

    fn open(&self) -> Result<Connection, String> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)
                .map_err(|err| format!("Failed to create cabinet data dir: {}", err))?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| format!("Failed to open sqlite db: {}", err))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| format!("Failed to enable WAL: {}", err))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| format!("Failed to set synchronous: {}", err))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|err| format!("Failed to set busy_timeout: {}", err))?;

        Ok(conn)
    }
}

/// Fixed-width UTC form: string order matches time order.
pub fn format_ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| format!("Invalid timestamp {:?}: {}", value, err))
}

fn storage_error(context: &str, err: rusqlite::Error) -> LifecycleError {
    LifecycleError::Transient(format!("Failed to {}: {}", context, err))
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _) if failure.code == ErrorCode::ConstraintViolation
    )
}

fn to_count(value: i64, field: &str) -> Result<u32, String> {
    u32::try_from(value).map_err(|_| format!("Stored {} is out of range: {}", field, value))
}

// ─────────────────────────────────────────────────────────────────────────────
// Row mapping
// ─────────────────────────────────────────────────────────────────────────────

struct ItemRow {
    location: String,
    category: Option<String>,
    package_code: Option<String>,
    package_description: Option<String>,
    shift: Option<String>,
    total_samples: i64,
    current_samples: Option<i64>,
    availability: String,
    taken_by: Option<String>,
}

fn read_item_row(row: &Row<'_>) -> rusqlite::Result<ItemRow> {
    Ok(ItemRow {
        location: row.get(0)?,
        category: row.get(1)?,
        package_code: row.get(2)?,
        package_description: row.get(3)?,
        shift: row.get(4)?,
        total_samples: row.get(5)?,
        current_samples: row.get(6)?,
        availability: row.get(7)?,
        taken_by: row.get(8)?,
    })
}

impl ItemRow {
    fn into_item(self, defects: BTreeMap<String, u32>) -> Result<Item, String> {
        Ok(Item {
            slot: Slot::from_category(self.category.as_deref()),
            package_code: self.package_code,
            package_description: self.package_description,
            shift: self.shift,
            total_samples: to_count(self.total_samples, "total_samples")?,
            current_samples: self
                .current_samples
                .map(|value| to_count(value, "current_samples"))
                .transpose()?,
            // Legacy rows carry free text here; anything but YES means out.
            availability: Availability::from_str(&self.availability).unwrap_or(Availability::No),
            taken_by: self.taken_by,
            defects,
            location: self.location,
        })
    }
}

struct RecordRow {
    id: i64,
    cabinet_location: String,
    package_code: String,
    user_id: String,
    borrower_email: String,
    borrowed_at: String,
    due_at: String,
    returned_at: Option<String>,
    return_status: String,
    expected_samples: i64,
    returned_samples: Option<i64>,
    justification: Option<String>,
    admin_approved: Option<bool>,
    admin_comments: Option<String>,
    reminder_sent: bool,
    created_at: String,
    updated_at: String,
}

fn read_record_row(row: &Row<'_>) -> rusqlite::Result<RecordRow> {
    Ok(RecordRow {
        id: row.get(0)?,
        cabinet_location: row.get(1)?,
        package_code: row.get(2)?,
        user_id: row.get(3)?,
        borrower_email: row.get(4)?,
        borrowed_at: row.get(5)?,
        due_at: row.get(6)?,
        returned_at: row.get(7)?,
        return_status: row.get(8)?,
        expected_samples: row.get(9)?,
        returned_samples: row.get(10)?,
        justification: row.get(11)?,
        admin_approved: row.get(12)?,
        admin_comments: row.get(13)?,
        reminder_sent: row.get(14)?,
        created_at: row.get(15)?,
        updated_at: row.get(16)?,
    })
}

impl RecordRow {
    fn into_record(self) -> Result<BorrowRecord, String> {
        let status = ReturnStatus::from_str(&self.return_status).ok_or_else(|| {
            format!(
                "Unknown return status {:?} on record {}",
                self.return_status, self.id
            )
        })?;
        Ok(BorrowRecord {
            id: self.id,
            cabinet_location: self.cabinet_location,
            package_code: self.package_code,
            user_id: self.user_id,
            borrower_email: self.borrower_email,
            borrowed_at: parse_ts(&self.borrowed_at)?,
            due_at: parse_ts(&self.due_at)?,
            returned_at: self.returned_at.as_deref().map(parse_ts).transpose()?,
            status,
            expected_samples: to_count(self.expected_samples, "expected_samples")?,
            returned_samples: self
                .returned_samples
                .map(|value| to_count(value, "returned_samples"))
                .transpose()?,
            justification: self.justification,
            admin_approved: self.admin_approved,
            admin_comments: self.admin_comments,
            reminder_sent: self.reminder_sent,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Query helpers (work on a connection or an open transaction)
// ─────────────────────────────────────────────────────────────────────────────

fn select_item(conn: &Connection, location: &str) -> Result<Option<Item>, String> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM items WHERE location = ?1", ITEM_COLUMNS),
            params![location],
            read_item_row,
        )
        .optional()
        .map_err(|err| format!("Failed to query item: {}", err))?;
    match row {
        Some(row) => {
            let defects = select_defects(conn, &row.location)?;
            row.into_item(defects).map(Some)
        }
        None => Ok(None),
    }
}

fn load_item(conn: &Connection, location: &str) -> cabinet_core::Result<Item> {
    select_item(conn, location)
        .map_err(LifecycleError::Transient)?
        .ok_or_else(|| LifecycleError::Transient(format!("Item {} vanished mid-write", location)))
}

fn select_defects(conn: &Connection, location: &str) -> Result<BTreeMap<String, u32>, String> {
    let mut stmt = conn
        .prepare("SELECT defect, count FROM item_defects WHERE location = ?1")
        .map_err(|err| format!("Failed to prepare defects query: {}", err))?;
    let rows = stmt
        .query_map(params![location], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })
        .map_err(|err| format!("Failed to read defect rows: {}", err))?;

    let mut defects = BTreeMap::new();
    for row in rows {
        let (name, count) = row.map_err(|err| format!("Failed to decode defect row: {}", err))?;
        defects.insert(name, to_count(count, "defect count")?);
    }
    Ok(defects)
}

fn replace_defects(
    tx: &Transaction<'_>,
    location: &str,
    defects: &BTreeMap<String, u32>,
) -> cabinet_core::Result<()> {
    tx.execute(
        "DELETE FROM item_defects WHERE location = ?1",
        params![location],
    )
    .map_err(|err| storage_error("clear defects", err))?;
    for (name, count) in defects {
        tx.execute(
            "INSERT INTO item_defects (location, defect, count) VALUES (?1, ?2, ?3)",
            params![location, name, i64::from(*count)],
        )
        .map_err(|err| storage_error("insert defect", err))?;
    }
    Ok(())
}

/// Moves an item into an unassigned slot. The sentinel check in the
/// `WHERE` clause keeps two registrations from filling the same slot.
fn fill_slot(
    tx: &Transaction<'_>,
    location: &str,
    item: &NewItem,
    actor: &Actor,
    stamp: &str,
) -> cabinet_core::Result<()> {
    let changed = tx
        .execute(
            "UPDATE items SET \
                category = ?1, package_code = ?2, package_description = ?3, \
                shift = ?4, total_samples = ?5, current_samples = NULL, \
                availability = 'YES', taken_by = ?6, updated_at = ?7 \
             WHERE location = ?8 AND category = ?9",
            params![
                item.category,
                item.package_code,
                item.package_description,
                item.shift,
                i64::from(item.total_samples),
                actor.email,
                stamp,
                location,
                UNASSIGNED_CATEGORY
            ],
        )
        .map_err(|err| storage_error("assign cabinet", err))?;
    if changed != 1 {
        return Err(LifecycleError::Conflict(format!(
            "Cabinet {} is no longer unassigned",
            location
        )));
    }
    Ok(())
}

/// Puts an item back in the room. `accepted_samples` replaces the baseline
/// after an approved short return.
fn release_item(
    tx: &Transaction<'_>,
    location: &str,
    accepted_samples: Option<u32>,
    stamp: &str,
) -> cabinet_core::Result<()> {
    let changed = match accepted_samples {
        Some(accepted) => tx.execute(
            "UPDATE items SET availability = 'YES', taken_by = NULL, current_samples = ?1, \
                updated_at = ?2 \
             WHERE location = ?3",
            params![i64::from(accepted), stamp, location],
        ),
        None => tx.execute(
            "UPDATE items SET availability = 'YES', taken_by = NULL, updated_at = ?1 \
             WHERE location = ?2",
            params![stamp, location],
        ),
    }
    .map_err(|err| storage_error("release item", err))?;
    if changed == 0 {
        tracing::warn!(location = %location, "Returned item no longer exists");
    }
    Ok(())
}

fn select_record(conn: &Connection, record_id: i64) -> Result<Option<BorrowRecord>, String> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM borrow_history WHERE id = ?1", RECORD_COLUMNS),
            params![record_id],
            read_record_row,
        )
        .optional()
        .map_err(|err| format!("Failed to query borrow record: {}", err))?;
    row.map(RecordRow::into_record).transpose()
}

fn select_owned_record(
    conn: &Connection,
    record_id: i64,
    user_id: &str,
) -> Result<Option<BorrowRecord>, String> {
    Ok(select_record(conn, record_id)?.filter(|record| record.user_id == user_id))
}

fn select_active_record(conn: &Connection, location: &str) -> Result<Option<BorrowRecord>, String> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {} FROM borrow_history \
                 WHERE cabinet_location = ?1 AND return_status IN (?2, ?3) LIMIT 1",
                RECORD_COLUMNS
            ),
            params![
                location,
                ReturnStatus::Borrowed.as_str(),
                ReturnStatus::InProgress.as_str()
            ],
            read_record_row,
        )
        .optional()
        .map_err(|err| format!("Failed to query active borrow: {}", err))?;
    row.map(RecordRow::into_record).transpose()
}

fn load_view(conn: &Connection, record_id: i64) -> cabinet_core::Result<BorrowView> {
    let record = select_record(conn, record_id)
        .map_err(LifecycleError::Transient)?
        .ok_or_else(|| {
            LifecycleError::Transient(format!("Borrow record {} vanished mid-write", record_id))
        })?;
    let item = select_item(conn, &record.cabinet_location).map_err(LifecycleError::Transient)?;
    Ok(BorrowView { record, item })
}

fn record_location(record: Option<&BorrowRecord>) -> cabinet_core::Result<&str> {
    record
        .map(|record| record.cabinet_location.as_str())
        .ok_or_else(|| LifecycleError::Transient("Borrow record vanished mid-write".to_string()))
}

fn query_items(conn: &Connection, sql: &str, values: &[SqlValue]) -> Result<Vec<Item>, String> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|err| format!("Failed to prepare items query: {}", err))?;
    let rows = stmt
        .query_map(params_from_iter(values.iter()), read_item_row)
        .map_err(|err| format!("Failed to read item rows: {}", err))?;

    let mut items = Vec::new();
    for row in rows {
        let row = row.map_err(|err| format!("Failed to decode item row: {}", err))?;
        let defects = select_defects(conn, &row.location)?;
        items.push(row.into_item(defects)?);
    }
    Ok(items)
}

fn query_records(
    conn: &Connection,
    sql: &str,
    values: &[SqlValue],
) -> Result<Vec<BorrowRecord>, String> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|err| format!("Failed to prepare borrow query: {}", err))?;
    let rows = stmt
        .query_map(params_from_iter(values.iter()), read_record_row)
        .map_err(|err| format!("Failed to read borrow rows: {}", err))?;

    let mut records = Vec::new();
    for row in rows {
        let row = row.map_err(|err| format!("Failed to decode borrow row: {}", err))?;
        records.push(row.into_record()?);
    }
    Ok(records)
}

fn query_strings(conn: &Connection, sql: &str, values: &[SqlValue]) -> Result<Vec<String>, String> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|err| format!("Failed to prepare query: {}", err))?;
    let rows = stmt
        .query_map(params_from_iter(values.iter()), |row| row.get::<_, String>(0))
        .map_err(|err| format!("Failed to read rows: {}", err))?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|err| format!("Failed to decode row: {}", err))?);
    }
    Ok(out)
}

fn count(conn: &Connection, sql: &str, values: &[SqlValue]) -> Result<u64, String> {
    let value = conn
        .query_row(sql, params_from_iter(values.iter()), |row| row.get::<_, i64>(0))
        .map_err(|err| format!("Failed to count rows: {}", err))?;
    Ok(value.max(0) as u64)
}

fn page_of_items(
    conn: &Connection,
    filter: &ItemFilter,
    available_only: bool,
    page: PageRequest,
) -> Result<(Vec<Item>, u64), String> {
    let mut clauses = vec!["category <> ?".to_string()];
    let mut values = vec![SqlValue::Text(UNASSIGNED_CATEGORY.to_string())];
    if available_only {
        clauses.push("availability = 'YES'".to_string());
    }
    if let Some(category) = &filter.category {
        clauses.push("category = ?".to_string());
        values.push(SqlValue::Text(category.clone()));
    }
    if let Some(package_code) = &filter.package_code {
        clauses.push("package_code = ?".to_string());
        values.push(SqlValue::Text(package_code.clone()));
    }
    let where_clause = clauses.join(" AND ");

    let total = count(
        conn,
        &format!("SELECT COUNT(*) FROM items WHERE {}", where_clause),
        &values,
    )?;

    values.push(SqlValue::Integer(i64::from(page.limit)));
    values.push(SqlValue::Integer(page.offset() as i64));
    let items = query_items(
        conn,
        &format!(
            "SELECT {} FROM items WHERE {} \
             ORDER BY total_samples DESC, location ASC LIMIT ? OFFSET ?",
            ITEM_COLUMNS, where_clause
        ),
        &values,
    )?;
    Ok((items, total))
}

fn page_of_records(
    conn: &Connection,
    where_clause: &str,
    mut values: Vec<SqlValue>,
    order_by: &str,
    page: PageRequest,
) -> Result<(Vec<BorrowView>, u64), String> {
    let total = count(
        conn,
        &format!("SELECT COUNT(*) FROM borrow_history WHERE {}", where_clause),
        &values,
    )?;
    values.push(SqlValue::Integer(i64::from(page.limit)));
    values.push(SqlValue::Integer(page.offset() as i64));
    let records = query_records(
        conn,
        &format!(
            "SELECT {} FROM borrow_history WHERE {} ORDER BY {} LIMIT ? OFFSET ?",
            RECORD_COLUMNS, where_clause, order_by
        ),
        &values,
    )?;
    Ok((attach_items(conn, records)?, total))
}

fn attach_items(conn: &Connection, records: Vec<BorrowRecord>) -> Result<Vec<BorrowView>, String> {
    let mut cache: HashMap<String, Option<Item>> = HashMap::new();
    let mut views = Vec::with_capacity(records.len());
    for record in records {
        let item = match cache.get(&record.cabinet_location) {
            Some(item) => item.clone(),
            None => {
                let item = select_item(conn, &record.cabinet_location)?;
                cache.insert(record.cabinet_location.clone(), item.clone());
                item
            }
        };
        views.push(BorrowView { record, item });
    }
    Ok(views)
}

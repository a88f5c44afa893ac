//! Shared daemon state: storage, notifier, policy, and user admission.
//!
//! Each operation runs its transition through [`Db`], and only after the
//! transaction has committed does it attempt any notification. A failed send
//! is logged and never undoes the transition.

use cabinet_core::sweep::{
    hours_left_ceil, needs_reminder, observe_overdue, overdue_info, time_info, time_left,
    OverdueReport, ReminderReport, ReminderWindow,
};
use cabinet_core::{
    AdminBorrow, ApprovalPlan, BorrowFilter, BorrowView, CabinetConfig, DashboardStats, Item,
    ItemFilter, ItemUpdate, LifecycleError, LoanPolicy, NewItem, Notice, Notifier, OverdueBorrow, PageRequest,
    Paginated, Pagination, ReturnPlan, ReturnStatus, ReturnableBorrow, SessionLimit,
    SessionStats, SessionTracker, Slot,
};
use cabinet_protocol::Actor;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};

use crate::db::Db;

type Result<T> = cabinet_core::Result<T>;

/// Registration result with the advisory defect cross-check.
#[derive(Debug, Clone, Serialize)]
pub struct RegisteredItem {
    #[serde(flatten)]
    pub item: Item,
    pub defect_total: u64,
    pub defect_mismatch: bool,
}

/// Last outcome of each scheduled pass, reported by `get_health`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepStatus {
    pub last_reminder_at: Option<DateTime<Utc>>,
    pub last_reminder: Option<ReminderReport>,
    pub last_overdue_at: Option<DateTime<Utc>>,
    pub last_overdue_count: Option<usize>,
}

pub struct SharedState {
    db: Db,
    notifier: Arc<dyn Notifier>,
    policy: LoanPolicy,
    admin_email: String,
    sessions: Arc<SessionTracker>,
    sweep_status: Mutex<SweepStatus>,
}

impl SharedState {
    pub fn new(db: Db, notifier: Arc<dyn Notifier>, config: &CabinetConfig) -> Self {
        let idle_timeout = config.idle_timeout();
        Self {
            db,
            notifier,
            policy: config.policy(),
            admin_email: config.notify.admin_email.clone(),
            sessions: Arc::new(SessionTracker::new(
                config.sessions.max_active_users,
                idle_timeout,
            )),
            sweep_status: Mutex::new(SweepStatus::default()),
        }
    }

    pub fn sessions(&self) -> Arc<SessionTracker> {
        Arc::clone(&self.sessions)
    }

    pub fn admit(&self, actor: &Actor, now: DateTime<Utc>) -> std::result::Result<(), SessionLimit> {
        self.sessions.track(&actor.id, now).inspect_err(|limit| {
            tracing::warn!(
                user_id = %actor.id,
                active_users = limit.active_users,
                max_users = limit.max_users,
                "User limit reached"
            );
        })
    }

    pub fn heartbeat(
        &self,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> std::result::Result<(), SessionLimit> {
        self.sessions.heartbeat(&actor.id, now)
    }

    pub fn session_stats(&self, now: DateTime<Utc>) -> SessionStats {
        self.sessions.stats(now)
    }

    pub fn sweep_status(&self) -> SweepStatus {
        match self.sweep_status.lock() {
            Ok(status) => status.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Catalog
    // ─────────────────────────────────────────────────────────────────────

    pub fn list_available_items(
        &self,
        filter: &ItemFilter,
        page: PageRequest,
    ) -> Result<Paginated<Item>> {
        let (entries, total) = self
            .db
            .list_available_items(filter, page)
            .map_err(LifecycleError::Transient)?;
        Ok(paginated(entries, page, total))
    }

    pub fn list_items(
        &self,
        filter: &ItemFilter,
        available_only: bool,
        page: PageRequest,
    ) -> Result<Paginated<Item>> {
        let (entries, total) = self
            .db
            .list_items(filter, available_only, page)
            .map_err(LifecycleError::Transient)?;
        Ok(paginated(entries, page, total))
    }

    pub fn get_item(&self, location: &str) -> Result<Item> {
        self.db
            .get_item(location)
            .map_err(LifecycleError::Transient)?
            .ok_or_else(|| LifecycleError::NotFound("Item not found".to_string()))
    }

    pub fn list_categories(&self) -> Result<Vec<String>> {
        self.db.list_categories().map_err(LifecycleError::Transient)
    }

    pub fn list_package_codes(&self, category: Option<&str>) -> Result<Vec<String>> {
        self.db
            .list_package_codes(category)
            .map_err(LifecycleError::Transient)
    }

    pub fn list_unassigned_slots(&self) -> Result<Vec<String>> {
        self.db
            .list_unassigned_slots()
            .map_err(LifecycleError::Transient)
    }

    pub fn add_slot(&self, location: &str, now: DateTime<Utc>) -> Result<Item> {
        let item = self.db.add_slot(location.trim(), now)?;
        tracing::info!(location = %item.location, "Cabinet slot added");
        Ok(item)
    }

    pub fn register_item(
        &self,
        actor: &Actor,
        item: &NewItem,
        now: DateTime<Utc>,
    ) -> Result<RegisteredItem> {
        if Slot::from_category(Some(&item.category)) == Slot::Unassigned {
            return Err(LifecycleError::validation(
                "Cannot register items into the unassigned-cabinet category",
            ));
        }
        if item.total_samples == 0 {
            return Err(LifecycleError::validation(
                "total_samples must be a positive count",
            ));
        }

        let stored = self.db.register_item(item, actor, now)?;
        let registered = RegisteredItem {
            defect_total: stored.defect_total(),
            defect_mismatch: stored.defect_mismatch(),
            item: stored,
        };
        if registered.defect_mismatch {
            tracing::warn!(
                location = %registered.item.location,
                defect_total = registered.defect_total,
                total_samples = registered.item.total_samples,
                "Defect counts do not add up to total samples"
            );
        }
        tracing::info!(
            location = %registered.item.location,
            category = ?registered.item.slot.category(),
            registered_by = %actor.email,
            "Item registered"
        );
        Ok(registered)
    }

    pub fn update_item(
        &self,
        actor: &Actor,
        location: &str,
        update: &ItemUpdate,
        now: DateTime<Utc>,
    ) -> Result<RegisteredItem> {
        let stored = self
            .db
            .update_item(location.trim(), update, actor, now)
            .inspect_err(|err| {
                tracing::info!(location = %location, user_id = %actor.id, error = %err, "Item update refused");
            })?;
        let updated = RegisteredItem {
            defect_total: stored.defect_total(),
            defect_mismatch: stored.defect_mismatch(),
            item: stored,
        };
        if updated.defect_mismatch {
            tracing::warn!(
                location = %updated.item.location,
                defect_total = updated.defect_total,
                total_samples = updated.item.total_samples,
                "Defect counts do not add up to total samples"
            );
        }
        tracing::info!(location = %updated.item.location, updated_by = %actor.email, "Item updated");
        Ok(updated)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Borrower
    // ─────────────────────────────────────────────────────────────────────

    pub fn borrow(&self, actor: &Actor, location: &str, now: DateTime<Utc>) -> Result<BorrowView> {
        let view = self
            .db
            .borrow(location.trim(), actor, now, &self.policy)
            .inspect_err(|err| {
                tracing::info!(location = %location, user_id = %actor.id, error = %err, "Borrow refused");
            })?;
        tracing::info!(
            record_id = view.record.id,
            location = %view.record.cabinet_location,
            user_id = %actor.id,
            due_at = %view.record.due_at,
            "Item borrowed"
        );
        Ok(view)
    }

    pub fn list_returnable(&self, actor: &Actor, now: DateTime<Utc>) -> Result<Vec<ReturnableBorrow>> {
        let views = self
            .db
            .list_returnable(&actor.id)
            .map_err(LifecycleError::Transient)?;
        Ok(views
            .into_iter()
            .map(|borrow| ReturnableBorrow {
                time_left: time_left(borrow.record.due_at, now),
                borrow,
            })
            .collect())
    }

    pub fn borrow_history(
        &self,
        actor: &Actor,
        status: Option<&str>,
        page: PageRequest,
    ) -> Result<Paginated<BorrowView>> {
        let status = parse_status(status)?;
        let (entries, total) = self
            .db
            .borrow_history(&actor.id, status, page)
            .map_err(LifecycleError::Transient)?;
        Ok(paginated(entries, page, total))
    }

    pub fn return_item(
        &self,
        actor: &Actor,
        record_id: i64,
        returned_samples: u32,
        justification: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<BorrowView> {
        let (plan, view) =
            self.db
                .return_record(record_id, &actor.id, returned_samples, justification, now)?;

        match plan {
            ReturnPlan::Completed { .. } => {
                tracing::info!(
                    record_id,
                    location = %view.record.cabinet_location,
                    late = now > view.record.due_at,
                    "Item returned"
                );
            }
            ReturnPlan::PendingApproval {
                missing_samples, ..
            } => {
                tracing::info!(
                    record_id,
                    location = %view.record.cabinet_location,
                    missing_samples,
                    "Short return held for approval"
                );
                self.notify(Notice::approval_request(
                    &view.record,
                    &self.admin_email,
                    false,
                ));
            }
        }
        Ok(view)
    }

    /// Resubmits the justification on a pending or rejected short return.
    pub fn update_justification(
        &self,
        actor: &Actor,
        record_id: i64,
        justification: &str,
        now: DateTime<Utc>,
    ) -> Result<BorrowView> {
        let view = self
            .db
            .update_justification(record_id, &actor.id, justification, now)?;
        tracing::info!(record_id, "Return justification updated; awaiting approval");
        self.notify(Notice::approval_request(&view.record, &self.admin_email, true));
        Ok(view)
    }

    pub fn list_pending_returns(&self, actor: &Actor) -> Result<Vec<BorrowView>> {
        self.db
            .list_pending_returns(&actor.id)
            .map_err(LifecycleError::Transient)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Admin
    // ─────────────────────────────────────────────────────────────────────

    pub fn approve(
        &self,
        record_id: i64,
        approved: bool,
        admin_comments: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<BorrowView> {
        let (plan, view) = self.db.decide(record_id, approved, admin_comments, now)?;
        match &plan {
            ApprovalPlan::Approve {
                accepted_samples, ..
            } => tracing::info!(
                record_id,
                location = %view.record.cabinet_location,
                accepted_samples,
                "Short return approved"
            ),
            ApprovalPlan::Reject { .. } => tracing::info!(
                record_id,
                location = %view.record.cabinet_location,
                "Short return rejected"
            ),
        }
        self.notify(Notice::decision(&view.record, plan.approved()));
        Ok(view)
    }

    pub fn list_all_borrowed(
        &self,
        status: Option<&str>,
        borrower_email: Option<&str>,
        page: PageRequest,
        now: DateTime<Utc>,
    ) -> Result<Paginated<AdminBorrow>> {
        let filter = BorrowFilter {
            status: parse_status(status)?,
            borrower_email: borrower_email
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string),
        };
        let (views, total) = self
            .db
            .list_all_borrowed(&filter, page)
            .map_err(LifecycleError::Transient)?;
        let entries = views
            .into_iter()
            .map(|borrow| AdminBorrow {
                time_info: time_info(borrow.record.due_at, now),
                borrow,
            })
            .collect();
        Ok(paginated(entries, page, total))
    }

    pub fn list_pending_approvals(&self, page: PageRequest) -> Result<Paginated<BorrowView>> {
        let (entries, total) = self
            .db
            .list_pending_approvals(page)
            .map_err(LifecycleError::Transient)?;
        Ok(paginated(entries, page, total))
    }

    pub fn list_overdue(
        &self,
        page: PageRequest,
        now: DateTime<Utc>,
    ) -> Result<Paginated<OverdueBorrow>> {
        let (views, total) = self
            .db
            .list_overdue(now, page)
            .map_err(LifecycleError::Transient)?;
        let entries = views
            .into_iter()
            .map(|borrow| OverdueBorrow {
                overdue_info: overdue_info(borrow.record.due_at, now),
                borrow,
            })
            .collect();
        Ok(paginated(entries, page, total))
    }

    pub fn dashboard_stats(&self, now: DateTime<Utc>) -> Result<DashboardStats> {
        self.db
            .dashboard_stats(now)
            .map_err(LifecycleError::Transient)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Sweeps
    // ─────────────────────────────────────────────────────────────────────

    /// Reminds each borrow due within the window, at most once per record.
    /// The record is claimed before sending, so a delivery failure still
    /// counts as its one reminder.
    pub fn run_reminder_sweep(&self, now: DateTime<Utc>) -> Result<ReminderReport> {
        let window = ReminderWindow::at(now, &self.policy);
        let candidates = self
            .db
            .reminder_candidates(window.after, window.until)
            .map_err(LifecycleError::Transient)?;

        let mut report = ReminderReport {
            candidates: candidates.len(),
            ..ReminderReport::default()
        };
        for view in candidates
            .into_iter()
            .filter(|view| needs_reminder(&view.record, &window))
        {
            match self.db.claim_reminder(view.record.id, now) {
                Ok(true) => {}
                Ok(false) => {
                    report.skipped += 1;
                    continue;
                }
                Err(err) => {
                    tracing::warn!(error = %err, record_id = view.record.id, "Failed to claim reminder");
                    report.failed += 1;
                    continue;
                }
            }

            let hours_left = hours_left_ceil(view.record.due_at, now);
            if self.notify(Notice::reminder(&view.record, view.item.as_ref(), hours_left)) {
                report.sent += 1;
            } else {
                report.failed += 1;
            }
        }

        tracing::info!(
            candidates = report.candidates,
            sent = report.sent,
            failed = report.failed,
            skipped = report.skipped,
            "Reminder sweep finished"
        );
        self.update_sweep_status(|status| {
            status.last_reminder_at = Some(now);
            status.last_reminder = Some(report.clone());
        });
        Ok(report)
    }

    /// Reports overdue borrows. Read-only.
    pub fn run_overdue_sweep(&self, now: DateTime<Utc>) -> Result<OverdueReport> {
        let records = self
            .db
            .overdue_records(now)
            .map_err(LifecycleError::Transient)?;
        let report = observe_overdue(&records, now);
        for entry in &report.overdue {
            tracing::info!(
                record_id = entry.record_id,
                location = %entry.cabinet_location,
                borrower = %entry.borrower_email,
                overdue_hours = entry.overdue_hours,
                "Borrow overdue"
            );
        }
        tracing::info!(overdue = report.overdue.len(), "Overdue sweep finished");
        let overdue = report.overdue.len();
        self.update_sweep_status(|status| {
            status.last_overdue_at = Some(now);
            status.last_overdue_count = Some(overdue);
        });
        Ok(report)
    }

    fn notify(&self, notice: Notice) -> bool {
        match self.notifier.send(&notice) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    kind = notice.kind(),
                    to = %notice.recipient(),
                    "Notification failed"
                );
                false
            }
        }
    }

    fn update_sweep_status(&self, apply: impl FnOnce(&mut SweepStatus)) {
        match self.sweep_status.lock() {
            Ok(mut status) => apply(&mut status),
            Err(poisoned) => apply(&mut poisoned.into_inner()),
        }
    }
}

fn parse_status(value: Option<&str>) -> Result<Option<ReturnStatus>> {
    match value.map(str::trim).filter(|value| !value.is_empty()) {
        None => Ok(None),
        Some(value) => ReturnStatus::from_str(value).map(Some).ok_or_else(|| {
            LifecycleError::validation(format!(
                "Unknown status {:?}; expected Borrowed, In Progress or Returned",
                value
            ))
        }),
    }
}

fn paginated<T>(entries: Vec<T>, page: PageRequest, total: u64) -> Paginated<T> {
    Paginated {
        entries,
        pagination: Pagination::new(page, total),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cabinet_core::{Availability, DEFAULT_ADMIN_PAGE_LIMIT, DEFAULT_PAGE_LIMIT};
    use cabinet_protocol::Role;
    use chrono::{Duration, TimeZone};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Barrier;
    use std::thread;

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<Notice>>,
        failing: AtomicBool,
    }

    impl RecordingNotifier {
        fn sent(&self) -> Vec<Notice> {
            self.sent.lock().expect("notifier lock").clone()
        }
    }

    impl Notifier for RecordingNotifier {
        fn send(&self, notice: &Notice) -> std::result::Result<(), String> {
            if self.failing.load(Ordering::SeqCst) {
                return Err("smtp unreachable".to_string());
            }
            self.sent.lock().expect("notifier lock").push(notice.clone());
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        state: Arc<SharedState>,
        notifier: Arc<RecordingNotifier>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("temp dir");
        let db = Db::new(dir.path().join("cabinet.db")).expect("db init");
        let notifier = Arc::new(RecordingNotifier::default());
        let state = Arc::new(SharedState::new(
            db,
            notifier.clone(),
            &CabinetConfig::default(),
        ));
        Fixture {
            _dir: dir,
            state,
            notifier,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    fn user(id: &str) -> Actor {
        Actor {
            id: id.to_string(),
            email: format!("{}@example.com", id),
            role: Role::User,
        }
    }

    fn stock(state: &SharedState, location: &str, total: u32) {
        state
            .register_item(
                &user("registrar"),
                &NewItem {
                    location: Some(location.to_string()),
                    category: "QFN".to_string(),
                    package_code: Some("QFN-48".to_string()),
                    package_description: None,
                    shift: None,
                    total_samples: total,
                    defects: BTreeMap::new(),
                },
                t0(),
            )
            .expect("register item");
    }

    fn availability(state: &SharedState, location: &str) -> Availability {
        state.get_item(location).expect("item").availability
    }

    #[test]
    fn concurrent_borrows_of_one_cabinet_yield_one_winner() {
        let fx = fixture();
        stock(&fx.state, "C-01", 5);

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = ["alice", "bob"]
            .into_iter()
            .map(|name| {
                let state = Arc::clone(&fx.state);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    state.borrow(&user(name), "C-01", t0())
                })
            })
            .collect();
        let results: Vec<_> = handles
            .into_iter()
            .map(|handle| handle.join().expect("borrow thread"))
            .collect();

        assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|result| matches!(result, Err(LifecycleError::Conflict(_)))));

        let (active, total) = fx
            .state
            .db
            .list_all_borrowed(
                &BorrowFilter {
                    status: Some(ReturnStatus::Borrowed),
                    borrower_email: None,
                },
                PageRequest::new(None, None, DEFAULT_ADMIN_PAGE_LIMIT),
            )
            .expect("list");
        assert_eq!(total, 1);
        assert_eq!(active.len(), 1);
        assert_eq!(availability(&fx.state, "C-01"), Availability::No);
    }

    #[test]
    fn unassigned_slot_cannot_be_borrowed() {
        let fx = fixture();
        fx.state.add_slot("S-01", t0()).expect("slot");
        let err = fx.state.borrow(&user("alice"), "S-01", t0()).unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidState(_)));
        let err = fx.state.borrow(&user("alice"), "NOPE", t0()).unwrap_err();
        assert!(matches!(err, LifecycleError::NotFound(_)));
    }

    #[test]
    fn late_full_return_completes_without_approval() {
        let fx = fixture();
        stock(&fx.state, "C-01", 5);
        let alice = user("alice");
        let borrowed = fx.state.borrow(&alice, "C-01", t0()).expect("borrow");
        assert_eq!(borrowed.record.due_at, t0() + Duration::hours(24));

        let returned = fx
            .state
            .return_item(&alice, borrowed.record.id, 5, None, t0() + Duration::hours(25))
            .expect("return");
        assert_eq!(returned.record.status, ReturnStatus::Returned);
        assert_eq!(returned.record.admin_approved, None);
        let item = returned.item.expect("item in response");
        assert_eq!(item.availability, Availability::Yes);
        assert_eq!(item.taken_by, None);
        assert_eq!(availability(&fx.state, "C-01"), Availability::Yes);
        assert!(fx.notifier.sent().is_empty());
    }

    #[test]
    fn short_return_needs_justification_then_waits_for_admin() {
        let fx = fixture();
        stock(&fx.state, "C-01", 5);
        let alice = user("alice");
        let borrowed = fx.state.borrow(&alice, "C-01", t0()).expect("borrow");
        let id = borrowed.record.id;

        match fx.state.return_item(&alice, id, 3, None, t0()).unwrap_err() {
            LifecycleError::Validation {
                shortfall: Some(shortfall),
                ..
            } => {
                assert!(shortfall.requires_justification);
                assert_eq!(shortfall.expected_samples, 5);
                assert_eq!(shortfall.returned_samples, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let unchanged = fx.state.db.get_record(id).expect("read").expect("record");
        assert_eq!(unchanged.status, ReturnStatus::Borrowed);

        let pending = fx
            .state
            .return_item(&alice, id, 3, Some("2 damaged in transit"), t0())
            .expect("short return");
        assert_eq!(pending.record.status, ReturnStatus::InProgress);
        assert_eq!(pending.record.admin_approved, None);
        assert_eq!(availability(&fx.state, "C-01"), Availability::No);

        let sent = fx.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient(), "admin@localhost");
        assert_eq!(
            sent[0].subject(),
            "Return Justification Required - Missing Samples"
        );
    }

    #[test]
    fn excess_return_leaves_record_untouched() {
        let fx = fixture();
        stock(&fx.state, "C-01", 5);
        let alice = user("alice");
        let borrowed = fx.state.borrow(&alice, "C-01", t0()).expect("borrow");

        let err = fx
            .state
            .return_item(&alice, borrowed.record.id, 6, Some("extra"), t0())
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Validation { .. }));
        let record = fx
            .state
            .db
            .get_record(borrowed.record.id)
            .expect("read")
            .expect("record");
        assert_eq!(record, borrowed.record);
    }

    #[test]
    fn approved_short_return_becomes_new_baseline() {
        let fx = fixture();
        stock(&fx.state, "C-01", 5);
        let alice = user("alice");
        let borrowed = fx.state.borrow(&alice, "C-01", t0()).expect("borrow");
        let id = borrowed.record.id;
        fx.state
            .return_item(&alice, id, 3, Some("2 damaged in transit"), t0())
            .expect("short return");

        let approved = fx
            .state
            .approve(id, true, Some("confirmed"), t0())
            .expect("approve");
        assert_eq!(approved.record.status, ReturnStatus::Returned);
        assert_eq!(approved.record.admin_approved, Some(true));
        assert_eq!(approved.record.admin_comments.as_deref(), Some("confirmed"));
        let replied = approved.item.clone().expect("item in response");
        assert_eq!(replied.availability, Availability::Yes);
        assert_eq!(replied.current_samples, Some(3));

        let item = fx.state.get_item("C-01").expect("item");
        assert_eq!(item.availability, Availability::Yes);
        assert_eq!(item.current_samples, Some(3));

        let err = fx.state.approve(id, true, None, t0()).unwrap_err();
        assert!(matches!(err, LifecycleError::NotFound(_)));

        let decision = fx.notifier.sent().pop().expect("decision notice");
        assert_eq!(decision.recipient(), "alice@example.com");
        assert_eq!(decision.subject(), "Return Approved - Item Available Again");
    }

    #[test]
    fn rejected_return_stays_pending_until_resubmitted() {
        let fx = fixture();
        stock(&fx.state, "C-01", 5);
        let alice = user("alice");
        let borrowed = fx.state.borrow(&alice, "C-01", t0()).expect("borrow");
        let id = borrowed.record.id;
        fx.state
            .return_item(&alice, id, 4, Some("one missing"), t0())
            .expect("short return");

        let rejected = fx
            .state
            .approve(id, false, Some("find it"), t0())
            .expect("reject");
        assert_eq!(rejected.record.status, ReturnStatus::InProgress);
        assert_eq!(rejected.record.admin_approved, Some(false));
        assert_eq!(availability(&fx.state, "C-01"), Availability::No);

        let pending = fx.state.list_pending_returns(&alice).expect("pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].record.admin_approved, Some(false));
        assert_eq!(pending[0].record.admin_comments.as_deref(), Some("find it"));

        let admin_page = PageRequest::new(None, None, DEFAULT_ADMIN_PAGE_LIMIT);
        assert_eq!(
            fx.state
                .list_pending_approvals(admin_page)
                .expect("queue")
                .pagination
                .total_items,
            0
        );

        let err = fx
            .state
            .update_justification(&user("bob"), id, "not mine", t0())
            .unwrap_err();
        assert!(matches!(err, LifecycleError::NotFound(_)));

        let resubmitted = fx
            .state
            .update_justification(&alice, id, " dropped in the ESD bin ", t0())
            .expect("resubmit");
        assert_eq!(resubmitted.record.admin_approved, None);
        assert_eq!(
            resubmitted.record.justification.as_deref(),
            Some("dropped in the ESD bin")
        );
        let queue = fx.state.list_pending_approvals(admin_page).expect("queue");
        assert_eq!(queue.pagination.total_items, 1);

        let subjects: Vec<_> = fx.notifier.sent().iter().map(Notice::subject).collect();
        assert_eq!(
            subjects,
            vec![
                "Return Justification Required - Missing Samples".to_string(),
                "Return Rejected - Additional Action Required".to_string(),
                "Updated Return Justification - Missing Samples".to_string(),
            ]
        );
    }

    #[test]
    fn notification_failure_does_not_undo_transition() {
        let fx = fixture();
        stock(&fx.state, "C-01", 5);
        let alice = user("alice");
        let borrowed = fx.state.borrow(&alice, "C-01", t0()).expect("borrow");
        fx.notifier.failing.store(true, Ordering::SeqCst);

        let pending = fx
            .state
            .return_item(&alice, borrowed.record.id, 2, Some("three cracked"), t0())
            .expect("short return");
        assert_eq!(pending.record.status, ReturnStatus::InProgress);
    }

    #[test]
    fn reminder_sweep_reminds_once() {
        let fx = fixture();
        stock(&fx.state, "C-01", 5);
        stock(&fx.state, "C-02", 5);
        fx.state.borrow(&user("alice"), "C-01", t0()).expect("borrow");
        fx.state
            .borrow(&user("bob"), "C-02", t0() + Duration::hours(6))
            .expect("borrow");

        // C-01 is due in 90 minutes; C-02 is well outside the window.
        let now = t0() + Duration::hours(22) + Duration::minutes(30);
        let first = fx.state.run_reminder_sweep(now).expect("sweep");
        assert_eq!(first.sent, 1);
        let second = fx
            .state
            .run_reminder_sweep(now + Duration::minutes(30))
            .expect("sweep");
        assert_eq!(second.candidates, 0);
        assert_eq!(second.sent, 0);

        let sent = fx.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject(), "Return Reminder: C-01 - 2 hours left");
        assert!(fx.state.sweep_status().last_reminder.is_some());
    }

    #[test]
    fn failed_reminder_still_counts_as_sent_flag() {
        let fx = fixture();
        stock(&fx.state, "C-01", 5);
        fx.state.borrow(&user("alice"), "C-01", t0()).expect("borrow");
        fx.notifier.failing.store(true, Ordering::SeqCst);

        let now = t0() + Duration::hours(23);
        let report = fx.state.run_reminder_sweep(now).expect("sweep");
        assert_eq!((report.sent, report.failed), (0, 1));

        fx.notifier.failing.store(false, Ordering::SeqCst);
        let report = fx.state.run_reminder_sweep(now).expect("sweep");
        assert_eq!(report.candidates, 0);
        assert!(fx.notifier.sent().is_empty());
    }

    #[test]
    fn overdue_sweep_only_observes() {
        let fx = fixture();
        stock(&fx.state, "C-01", 5);
        let borrowed = fx
            .state
            .borrow(&user("alice"), "C-01", t0())
            .expect("borrow");

        let now = t0() + Duration::hours(30);
        let report = fx.state.run_overdue_sweep(now).expect("sweep");
        assert_eq!(report.overdue.len(), 1);
        assert_eq!(report.overdue[0].overdue_hours, 6);

        let after = fx
            .state
            .db
            .get_record(borrowed.record.id)
            .expect("read")
            .expect("record");
        assert_eq!(after, borrowed.record);
        assert!(fx.notifier.sent().is_empty());

        let overdue = fx
            .state
            .list_overdue(PageRequest::new(None, None, DEFAULT_ADMIN_PAGE_LIMIT), now)
            .expect("overdue list");
        assert_eq!(overdue.entries[0].overdue_info.hours, 6);
    }

    #[test]
    fn returnable_list_carries_time_left() {
        let fx = fixture();
        stock(&fx.state, "C-01", 5);
        let alice = user("alice");
        fx.state.borrow(&alice, "C-01", t0()).expect("borrow");

        let now = t0() + Duration::hours(20) + Duration::minutes(15);
        let returnable = fx.state.list_returnable(&alice, now).expect("returnable");
        assert_eq!(returnable.len(), 1);
        assert_eq!(returnable[0].time_left.hours, 3);
        assert_eq!(returnable[0].time_left.minutes, 45);
        assert!(!returnable[0].time_left.expired);
        assert!(fx
            .state
            .list_returnable(&user("bob"), now)
            .expect("returnable")
            .is_empty());
    }

    #[test]
    fn registration_rejects_sentinel_category_and_reports_defect_mismatch() {
        let fx = fixture();
        let mut item = NewItem {
            location: Some("R-01".to_string()),
            category: "Available Cabinet".to_string(),
            package_code: None,
            package_description: None,
            shift: None,
            total_samples: 4,
            defects: BTreeMap::new(),
        };
        let err = fx
            .state
            .register_item(&user("reg"), &item, t0())
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Validation { .. }));

        item.category = "BGA".to_string();
        item.defects.insert("Chip(Die)".to_string(), 1);
        let registered = fx
            .state
            .register_item(&user("reg"), &item, t0())
            .expect("register");
        assert!(registered.defect_mismatch);
        assert_eq!(registered.defect_total, 1);
    }

    #[test]
    fn history_filters_by_status_and_rejects_unknown_status() {
        let fx = fixture();
        stock(&fx.state, "C-01", 5);
        stock(&fx.state, "C-02", 5);
        let alice = user("alice");
        let first = fx.state.borrow(&alice, "C-01", t0()).expect("borrow");
        fx.state
            .return_item(&alice, first.record.id, 5, None, t0())
            .expect("return");
        fx.state
            .borrow(&alice, "C-02", t0() + Duration::hours(1))
            .expect("borrow");

        let page = PageRequest::new(None, None, DEFAULT_PAGE_LIMIT);
        let all = fx.state.borrow_history(&alice, None, page).expect("history");
        assert_eq!(all.pagination.total_items, 2);
        assert_eq!(all.entries[0].record.cabinet_location, "C-02");

        let returned = fx
            .state
            .borrow_history(&alice, Some("Returned"), page)
            .expect("history");
        assert_eq!(returned.pagination.total_items, 1);

        assert!(matches!(
            fx.state.borrow_history(&alice, Some("Lost"), page).unwrap_err(),
            LifecycleError::Validation { .. }
        ));
    }

    #[test]
    fn admission_refuses_users_past_limit() {
        let dir = tempfile::tempdir().expect("temp dir");
        let db = Db::new(dir.path().join("cabinet.db")).expect("db init");
        let mut config = CabinetConfig::default();
        config.sessions.max_active_users = 1;
        let state = SharedState::new(db, Arc::new(RecordingNotifier::default()), &config);

        state.admit(&user("alice"), t0()).expect("alice admitted");
        let limit = state.admit(&user("bob"), t0()).unwrap_err();
        assert_eq!(limit.max_users, 1);
        assert_eq!(state.session_stats(t0()).active_users, 1);
    }

    #[test]
    fn item_edits_follow_the_holder() {
        let fx = fixture();
        stock(&fx.state, "C-01", 5);
        let update = ItemUpdate {
            shift: Some("Night".to_string()),
            ..ItemUpdate::default()
        };

        fx.state
            .update_item(&user("registrar"), "C-01", &update, t0())
            .expect("registrant edits");

        let alice = user("alice");
        fx.state.borrow(&alice, "C-01", t0()).expect("borrow");
        let err = fx
            .state
            .update_item(&user("registrar"), "C-01", &update, t0())
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Forbidden(_)));

        let mut defects = BTreeMap::new();
        defects.insert("Chip(Die)".to_string(), 2);
        let edited = fx
            .state
            .update_item(
                &alice,
                "C-01",
                &ItemUpdate {
                    defects: Some(defects),
                    ..ItemUpdate::default()
                },
                t0(),
            )
            .expect("holder edits");
        assert!(edited.defect_mismatch);
        assert_eq!(edited.item.shift.as_deref(), Some("Night"));
        assert_eq!(edited.item.availability, Availability::No);
    }

    #[test]
    fn catalog_lists_borrowed_items_unless_filtered() {
        let fx = fixture();
        stock(&fx.state, "C-01", 5);
        stock(&fx.state, "C-02", 8);
        fx.state.borrow(&user("alice"), "C-02", t0()).expect("borrow");

        let filter = ItemFilter {
            category: Some("QFN".to_string()),
            package_code: None,
        };
        let page = PageRequest::new(None, None, DEFAULT_PAGE_LIMIT);
        let all = fx.state.list_items(&filter, false, page).expect("catalog");
        assert_eq!(all.pagination.total_items, 2);
        let in_room = fx.state.list_items(&filter, true, page).expect("catalog");
        assert_eq!(in_room.pagination.total_items, 1);
        assert_eq!(in_room.entries[0].location, "C-01");
    }
}

//! Core types shared by the daemon and its clients.
//!
//! Items are keyed by their cabinet location; borrow records by a surrogate id.
//! The storage layer translates these to and from rows; nothing in here knows
//! about SQL.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Storage value of the category column for a cabinet slot with no item in it.
pub const UNASSIGNED_CATEGORY: &str = "Available Cabinet";

// ═══════════════════════════════════════════════════════════════════════════════
// Items
// ═══════════════════════════════════════════════════════════════════════════════

/// What occupies a cabinet location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "slot", rename_all = "snake_case")]
pub enum Slot {
    Assigned { category: String },
    Unassigned,
}

impl Slot {
    /// Maps the storage category column onto a slot. The sentinel category
    /// (and a missing one) marks an empty, reusable cabinet.
    pub fn from_category(category: Option<&str>) -> Self {
        match category.map(str::trim) {
            None | Some("") => Slot::Unassigned,
            Some(value) if value == UNASSIGNED_CATEGORY => Slot::Unassigned,
            Some(value) => Slot::Assigned {
                category: value.to_string(),
            },
        }
    }

    pub fn category_column(&self) -> &str {
        match self {
            Slot::Assigned { category } => category,
            Slot::Unassigned => UNASSIGNED_CATEGORY,
        }
    }

    pub fn category(&self) -> Option<&str> {
        match self {
            Slot::Assigned { category } => Some(category),
            Slot::Unassigned => None,
        }
    }
}

/// Whether the item is physically present in the engineering room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Availability {
    #[serde(rename = "YES")]
    Yes,
    #[serde(rename = "NO")]
    No,
}

impl Availability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Availability::Yes => "YES",
            Availability::No => "NO",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim() {
            "YES" => Some(Availability::Yes),
            "NO" => Some(Availability::No),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Item {
    pub location: String,
    #[serde(flatten)]
    pub slot: Slot,
    pub package_code: Option<String>,
    pub package_description: Option<String>,
    pub shift: Option<String>,
    pub total_samples: u32,
    /// Accepted count after an approved short return; `None` until then.
    pub current_samples: Option<u32>,
    pub availability: Availability,
    pub taken_by: Option<String>,
    pub defects: BTreeMap<String, u32>,
}

impl Item {
    /// Count a borrower is expected to bring back.
    pub fn sample_baseline(&self) -> u32 {
        self.current_samples.unwrap_or(self.total_samples)
    }

    pub fn defect_total(&self) -> u64 {
        self.defects.values().map(|count| u64::from(*count)).sum()
    }

    /// Advisory only: defect counts are recorded by hand and drift.
    pub fn defect_mismatch(&self) -> bool {
        !self.defects.is_empty() && self.defect_total() != u64::from(self.total_samples)
    }
}

/// Input for registering an item into a cabinet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewItem {
    pub location: Option<String>,
    pub category: String,
    pub package_code: Option<String>,
    pub package_description: Option<String>,
    pub shift: Option<String>,
    pub total_samples: u32,
    pub defects: BTreeMap<String, u32>,
}

/// Descriptive edits to a registered item. `None` leaves the field alone.
/// Availability and the sample baseline belong to the lifecycle and cannot
/// be edited here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemUpdate {
    pub category: Option<String>,
    pub package_code: Option<String>,
    pub package_description: Option<String>,
    pub shift: Option<String>,
    pub total_samples: Option<u32>,
    pub defects: Option<BTreeMap<String, u32>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFilter {
    pub category: Option<String>,
    pub package_code: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Borrow records
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReturnStatus {
    Borrowed,
    #[serde(rename = "In Progress")]
    InProgress,
    Returned,
}

impl ReturnStatus {
    /// A record in an active status keeps its item out of the cabinet.
    pub fn is_active(&self) -> bool {
        matches!(self, ReturnStatus::Borrowed | ReturnStatus::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReturnStatus::Borrowed => "Borrowed",
            ReturnStatus::InProgress => "In Progress",
            ReturnStatus::Returned => "Returned",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "Borrowed" => Some(ReturnStatus::Borrowed),
            "In Progress" => Some(ReturnStatus::InProgress),
            "Returned" => Some(ReturnStatus::Returned),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BorrowRecord {
    pub id: i64,
    pub cabinet_location: String,
    pub package_code: String,
    pub user_id: String,
    pub borrower_email: String,
    pub borrowed_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
    pub returned_at: Option<DateTime<Utc>>,
    pub status: ReturnStatus,
    pub expected_samples: u32,
    pub returned_samples: Option<u32>,
    pub justification: Option<String>,
    pub admin_approved: Option<bool>,
    pub admin_comments: Option<String>,
    pub reminder_sent: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BorrowRecord {
    pub fn missing_samples(&self) -> u32 {
        self.returned_samples
            .map(|returned| self.expected_samples.saturating_sub(returned))
            .unwrap_or(0)
    }

    pub fn awaiting_decision(&self) -> bool {
        self.status == ReturnStatus::InProgress && self.admin_approved.is_none()
    }
}

/// A borrow record joined with the item it refers to. The item can be gone if
/// the cabinet was re-registered after the fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BorrowView {
    #[serde(flatten)]
    pub record: BorrowRecord,
    pub item: Option<Item>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BorrowFilter {
    pub status: Option<ReturnStatus>,
    pub borrower_email: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Time annotations
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeLeft {
    pub hours: i64,
    pub minutes: i64,
    pub expired: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeInfo {
    pub hours: i64,
    pub minutes: i64,
    pub overdue: bool,
    pub expired: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OverdueInfo {
    pub hours: i64,
    pub days: i64,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReturnableBorrow {
    #[serde(flatten)]
    pub borrow: BorrowView,
    pub time_left: TimeLeft,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdminBorrow {
    #[serde(flatten)]
    pub borrow: BorrowView,
    pub time_info: TimeInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverdueBorrow {
    #[serde(flatten)]
    pub borrow: BorrowView,
    pub overdue_info: OverdueInfo,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Pagination and stats
// ═══════════════════════════════════════════════════════════════════════════════

pub const DEFAULT_PAGE_LIMIT: u32 = 10;
pub const DEFAULT_ADMIN_PAGE_LIMIT: u32 = 20;
pub const MAX_PAGE_LIMIT: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub limit: u32,
}

impl PageRequest {
    /// Normalizes raw client values: pages are 1-based, limits are capped.
    pub fn new(page: Option<i64>, limit: Option<i64>, default_limit: u32) -> Self {
        let page = page
            .filter(|value| *value >= 1)
            .map(|value| value.min(i64::from(u32::MAX)) as u32)
            .unwrap_or(1);
        let limit = limit
            .filter(|value| *value >= 1)
            .map(|value| value.min(i64::from(MAX_PAGE_LIMIT)) as u32)
            .unwrap_or(default_limit);
        Self { page, limit }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.limit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Pagination {
    pub current_page: u32,
    pub total_pages: u64,
    pub total_items: u64,
    pub items_per_page: u32,
}

impl Pagination {
    pub fn new(request: PageRequest, total_items: u64) -> Self {
        let limit = u64::from(request.limit.max(1));
        Self {
            current_page: request.page,
            total_pages: total_items.div_ceil(limit),
            total_items,
            items_per_page: request.limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Paginated<T> {
    pub entries: Vec<T>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DashboardStats {
    pub total_borrowed: u64,
    pub pending_returns: u64,
    pub overdue_items: u64,
    pub total_returned: u64,
    pub available_items: u64,
    pub total_items: u64,
    pub pending_approvals: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(total: u32, defects: &[(&str, u32)]) -> Item {
        Item {
            location: "A-01".to_string(),
            slot: Slot::Assigned {
                category: "QFN".to_string(),
            },
            package_code: None,
            package_description: None,
            shift: None,
            total_samples: total,
            current_samples: None,
            availability: Availability::Yes,
            taken_by: None,
            defects: defects
                .iter()
                .map(|(name, count)| (name.to_string(), *count))
                .collect(),
        }
    }

    #[test]
    fn sentinel_category_maps_to_unassigned_slot() {
        assert_eq!(
            Slot::from_category(Some("Available Cabinet")),
            Slot::Unassigned
        );
        assert_eq!(Slot::from_category(Some("  ")), Slot::Unassigned);
        assert_eq!(Slot::from_category(None), Slot::Unassigned);
        assert_eq!(
            Slot::from_category(Some("BGA")),
            Slot::Assigned {
                category: "BGA".to_string()
            }
        );
        assert_eq!(Slot::Unassigned.category_column(), UNASSIGNED_CATEGORY);
    }

    #[test]
    fn baseline_prefers_accepted_count() {
        let mut item = item(5, &[]);
        assert_eq!(item.sample_baseline(), 5);
        item.current_samples = Some(3);
        assert_eq!(item.sample_baseline(), 3);
    }

    #[test]
    fn defect_mismatch_is_advisory_and_ignores_empty_maps() {
        assert!(!item(5, &[]).defect_mismatch());
        assert!(!item(5, &[("Chip(Die)", 2), ("Good Unit", 3)]).defect_mismatch());
        assert!(item(5, &[("Chip(Die)", 2)]).defect_mismatch());
    }

    #[test]
    fn item_serializes_slot_inline() {
        let value = serde_json::to_value(item(5, &[])).expect("serialize");
        assert_eq!(value["slot"], "assigned");
        assert_eq!(value["category"], "QFN");
        assert_eq!(value["availability"], "YES");
    }

    #[test]
    fn status_round_trips_storage_strings() {
        assert_eq!(
            ReturnStatus::from_str("In Progress"),
            Some(ReturnStatus::InProgress)
        );
        assert_eq!(ReturnStatus::InProgress.as_str(), "In Progress");
        assert!(ReturnStatus::from_str("in progress").is_none());
        assert!(!ReturnStatus::Returned.is_active());
    }

    #[test]
    fn page_request_normalizes_bounds() {
        let page = PageRequest::new(Some(0), Some(500), DEFAULT_PAGE_LIMIT);
        assert_eq!(page.page, 1);
        assert_eq!(page.limit, MAX_PAGE_LIMIT);

        let page = PageRequest::new(Some(3), None, DEFAULT_ADMIN_PAGE_LIMIT);
        assert_eq!(page.offset(), 40);
    }

    #[test]
    fn pagination_rounds_pages_up() {
        let pagination = Pagination::new(PageRequest::new(None, Some(10), 10), 21);
        assert_eq!(pagination.total_pages, 3);
        assert_eq!(
            Pagination::new(PageRequest::new(None, None, 10), 0).total_pages,
            0
        );
    }
}

//! IPC protocol types and validation for cabinetd.
//!
//! This crate is shared by the daemon and its clients to prevent schema drift.
//! The daemon remains the authority on validation, but clients can reuse the
//! same types to construct valid requests.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB

const MAX_ID_LEN: usize = 50;
const MAX_EMAIL_LEN: usize = 100;
const MAX_LOCATION_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    // Catalog
    ListAvailableItems,
    ListItems,
    GetItem,
    ListCategories,
    ListPackageCodes,
    ListUnassignedSlots,
    AddSlot,
    RegisterItem,
    UpdateItem,
    // Borrower
    Borrow,
    ListReturnable,
    BorrowHistory,
    Return,
    UpdateJustification,
    ListPendingReturns,
    // Admin
    Approve,
    ListAllBorrowed,
    ListPendingApprovals,
    ListOverdue,
    DashboardStats,
    RunReminderSweep,
    RunOverdueSweep,
    SessionStats,
}

impl Method {
    /// Methods that act on behalf of a user need an authenticated actor.
    pub fn requires_actor(&self) -> bool {
        !matches!(
            self,
            Method::GetHealth
                | Method::ListAvailableItems
                | Method::ListItems
                | Method::GetItem
                | Method::ListCategories
                | Method::ListPackageCodes
                | Method::ListUnassignedSlots
        )
    }

    pub fn requires_admin(&self) -> bool {
        matches!(
            self,
            Method::AddSlot
                | Method::Approve
                | Method::ListAllBorrowed
                | Method::ListPendingApprovals
                | Method::ListOverdue
                | Method::DashboardStats
                | Method::RunReminderSweep
                | Method::RunOverdueSweep
                | Method::SessionStats
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

/// Identity of the caller, supplied by the authentication layer in front of
/// the daemon and trusted as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Actor {
    pub id: String,
    pub email: String,
    pub role: Role,
}

impl Actor {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.id.trim().is_empty() {
            return Err(ErrorInfo::new("invalid_actor", "actor id is required"));
        }
        if self.id.len() > MAX_ID_LEN {
            return Err(ErrorInfo::new(
                "invalid_actor",
                format!("actor id must be {} characters or fewer", MAX_ID_LEN),
            ));
        }
        if self.email.len() > MAX_EMAIL_LEN || !self.email.contains('@') {
            return Err(ErrorInfo::new(
                "invalid_actor",
                "actor email must be a valid address",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub actor: Option<Actor>,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Method parameters
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PageParams {
    #[serde(default)]
    pub page: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ItemFilterParams {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub package_code: Option<String>,
    #[serde(default)]
    pub page: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListItemsParams {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub package_code: Option<String>,
    /// Restrict to items currently in the room.
    #[serde(default)]
    pub available_only: bool,
    #[serde(default)]
    pub page: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocationParams {
    pub location: String,
}

impl LocationParams {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_location(&self.location)
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageCodeParams {
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterItemParams {
    /// Omit to auto-assign the first unassigned cabinet slot.
    #[serde(default)]
    pub location: Option<String>,
    pub category: String,
    #[serde(default)]
    pub package_code: Option<String>,
    #[serde(default)]
    pub package_description: Option<String>,
    #[serde(default)]
    pub shift: Option<String>,
    pub total_samples: i64,
    #[serde(default)]
    pub defects: BTreeMap<String, i64>,
}

impl RegisterItemParams {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if let Some(location) = &self.location {
            require_location(location)?;
        }
        if self.category.trim().is_empty() {
            return Err(ErrorInfo::new("validation", "category is required"));
        }
        require_sample_count(self.total_samples)?;
        validate_defects(&self.defects)
    }
}

/// Descriptive edits to a registered item. Omitted fields stay as they are.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateItemParams {
    pub location: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub package_code: Option<String>,
    #[serde(default)]
    pub package_description: Option<String>,
    #[serde(default)]
    pub shift: Option<String>,
    #[serde(default)]
    pub total_samples: Option<i64>,
    /// Replaces the whole defect breakdown when present.
    #[serde(default)]
    pub defects: Option<BTreeMap<String, i64>>,
}

impl UpdateItemParams {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_location(&self.location)?;
        if self.category.is_none()
            && self.package_code.is_none()
            && self.package_description.is_none()
            && self.shift.is_none()
            && self.total_samples.is_none()
            && self.defects.is_none()
        {
            return Err(ErrorInfo::new("validation", "no item fields to update"));
        }
        if let Some(category) = &self.category {
            if category.trim().is_empty() {
                return Err(ErrorInfo::new("validation", "category must not be blank"));
            }
        }
        if let Some(total) = self.total_samples {
            require_sample_count(total)?;
        }
        if let Some(defects) = &self.defects {
            validate_defects(defects)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HistoryParams {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub page: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReturnParams {
    pub record_id: i64,
    #[serde(default)]
    pub returned_samples: Option<i64>,
    #[serde(default)]
    pub justification: Option<String>,
}

impl ReturnParams {
    /// Returns the validated count so callers do not re-check the sign.
    pub fn validate(&self) -> Result<u32, ErrorInfo> {
        require_record_id(self.record_id)?;
        let returned = self.returned_samples.ok_or_else(|| {
            ErrorInfo::new("validation", "returned_samples count is required")
        })?;
        if returned < 0 {
            return Err(ErrorInfo::new(
                "validation",
                "returned_samples cannot be negative",
            ));
        }
        u32::try_from(returned)
            .map_err(|_| ErrorInfo::new("validation", "returned_samples is too large"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JustificationParams {
    pub record_id: i64,
    pub justification: String,
}

impl JustificationParams {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_record_id(self.record_id)?;
        if self.justification.trim().is_empty() {
            return Err(ErrorInfo::new("validation", "justification is required"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApproveParams {
    pub record_id: i64,
    #[serde(default)]
    pub approved: Option<bool>,
    #[serde(default)]
    pub admin_comments: Option<String>,
}

impl ApproveParams {
    pub fn validate(&self) -> Result<bool, ErrorInfo> {
        require_record_id(self.record_id)?;
        self.approved.ok_or_else(|| {
            ErrorInfo::new("validation", "approval decision (approved) is required")
        })
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BorrowFilterParams {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub borrower_email: Option<String>,
    #[serde(default)]
    pub page: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
}

/// Parses required params for a method.
pub fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, ErrorInfo> {
    let params = params.ok_or_else(|| ErrorInfo::new("invalid_params", "params are required"))?;
    decode(params)
}

/// Parses optional params, falling back to defaults when none were sent.
pub fn parse_optional_params<T: DeserializeOwned + Default>(
    params: Option<Value>,
) -> Result<T, ErrorInfo> {
    match params {
        None | Some(Value::Null) => Ok(T::default()),
        Some(params) => decode(params),
    }
}

fn decode<T: DeserializeOwned>(params: Value) -> Result<T, ErrorInfo> {
    if !params.is_object() {
        return Err(ErrorInfo::new("invalid_params", "params must be an object"));
    }
    serde_json::from_value(params)
        .map_err(|err| ErrorInfo::new("invalid_params", format!("params are invalid: {}", err)))
}

fn require_location(location: &str) -> Result<(), ErrorInfo> {
    if location.trim().is_empty() {
        return Err(ErrorInfo::new("validation", "location is required"));
    }
    if location.len() > MAX_LOCATION_LEN {
        return Err(ErrorInfo::new(
            "validation",
            format!("location must be {} characters or fewer", MAX_LOCATION_LEN),
        ));
    }
    Ok(())
}

fn require_sample_count(total: i64) -> Result<(), ErrorInfo> {
    if total <= 0 || total > i64::from(u32::MAX) {
        return Err(ErrorInfo::new(
            "validation",
            "total_samples must be a positive count",
        ));
    }
    Ok(())
}

fn validate_defects(defects: &BTreeMap<String, i64>) -> Result<(), ErrorInfo> {
    for (name, count) in defects {
        if name.trim().is_empty() {
            return Err(ErrorInfo::new("validation", "defect names must not be empty"));
        }
        if *count < 0 || *count > i64::from(u32::MAX) {
            return Err(ErrorInfo::new(
                "validation",
                format!("defect count for {} must be non-negative", name),
            ));
        }
    }
    Ok(())
}

fn require_record_id(record_id: i64) -> Result<(), ErrorInfo> {
    if record_id <= 0 {
        return Err(ErrorInfo::new("validation", "record_id must be positive"));
    }
    Ok(())
}

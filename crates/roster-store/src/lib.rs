#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod mem;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Failure classes reported by a lease store, mirroring its HTTP status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    BadRequest,
    Forbidden,
    NotFound,
    /// The role is full, or a fenced write lost against a newer update.
    Conflict,
    PayloadTooLarge,
    Internal,
    RequestCollision,
    InsufficientStorage,
    Other(u16),
}

impl ErrorCode {
    pub fn from_http(code: u16) -> Self {
        match code {
            400 => ErrorCode::BadRequest,
            403 => ErrorCode::Forbidden,
            404 => ErrorCode::NotFound,
            409 => ErrorCode::Conflict,
            413 => ErrorCode::PayloadTooLarge,
            500 => ErrorCode::Internal,
            503 => ErrorCode::RequestCollision,
            507 => ErrorCode::InsufficientStorage,
            other => ErrorCode::Other(other),
        }
    }

    pub fn http_code(&self) -> u16 {
        match self {
            ErrorCode::BadRequest => 400,
            ErrorCode::Forbidden => 403,
            ErrorCode::NotFound => 404,
            ErrorCode::Conflict => 409,
            ErrorCode::PayloadTooLarge => 413,
            ErrorCode::Internal => 500,
            ErrorCode::RequestCollision => 503,
            ErrorCode::InsufficientStorage => 507,
            ErrorCode::Other(code) => *code,
        }
    }

    pub fn generic_message(&self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "Bad request",
            ErrorCode::Forbidden => "Forbidden",
            ErrorCode::NotFound => "Not found",
            ErrorCode::Conflict => "Conflict",
            ErrorCode::PayloadTooLarge => "Payload too large",
            ErrorCode::Internal => "Internal server error",
            ErrorCode::RequestCollision => "Request collision",
            ErrorCode::InsufficientStorage => "Insufficient storage",
            ErrorCode::Other(_) => "Unknown error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.http_code(), self.generic_message())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct StoreError {
    pub code: ErrorCode,
    pub message: String,
}

impl StoreError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.code == ErrorCode::Conflict
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TakeRoleResult {
    pub org_time_ms: u64,
    /// The holder got a new slot rather than renewing one it already had.
    pub is_new_holder: bool,
    /// When the holder must stop playing the role, on the caller's clock.
    pub expires_unix_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseRoleResult {
    pub org_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRoleResult {
    pub org_time_ms: u64,
    pub default_playtime: Duration,
    pub max_holders: u32,
    /// Remaining lease per holder; may include non-positive values.
    pub remaining_ms: BTreeMap<String, i64>,
}

impl ReadRoleResult {
    pub fn active_holders(&self) -> BTreeSet<String> {
        self.remaining_ms
            .iter()
            .filter(|(_, remaining)| **remaining > 0)
            .map(|(holder, _)| holder.clone())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteDataResult {
    pub org_time_ms: u64,
    pub is_new_item: bool,
    pub create_org_time_ms: u64,
    pub update_org_time_ms: u64,
    pub bytes_written: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadDataResult {
    pub org_time_ms: u64,
    pub create_org_time_ms: u64,
    pub update_org_time_ms: u64,
    pub content_type: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteDataResult {
    pub org_time_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ListStats {
    pub role_count: u64,
    pub data_item_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListItemsResult {
    pub org_time_ms: u64,
    /// Item names relative to the listed directory, suffixed `.role` or `.data`.
    pub items: Vec<String>,
    pub stats: ListStats,
}

/// Contract of the remote role/data registry.
///
/// Every call may fail with any [`ErrorCode`]; callers treat a failure as "the operation did
/// not happen" even though it may have taken effect server-side.
#[async_trait]
pub trait LeaseStore: Send + Sync + 'static {
    /// Acquires a slot in the role, or renews the slot `holder` already has.
    ///
    /// Fails with [`ErrorCode::Conflict`] when all `max_holders` slots belong to others.
    async fn take_role(
        &self,
        role_path: &str,
        holder: &str,
        playtime: Duration,
        max_holders: u32,
    ) -> Result<TakeRoleResult, StoreError>;

    async fn release_role(
        &self,
        role_path: &str,
        holder: &str,
    ) -> Result<ReleaseRoleResult, StoreError>;

    async fn read_role(&self, role_path: &str) -> Result<ReadRoleResult, StoreError>;

    /// Writes a whole blob. With `if_updated_at` set, the write only lands when the item's
    /// last update happened at exactly that org time.
    async fn write_data(
        &self,
        data_path: &str,
        content: &[u8],
        content_type: &str,
        if_updated_at: Option<u64>,
    ) -> Result<WriteDataResult, StoreError>;

    async fn read_data(&self, data_path: &str) -> Result<ReadDataResult, StoreError>;

    async fn delete_data(
        &self,
        data_path: &str,
        if_updated_at: Option<u64>,
    ) -> Result<DeleteDataResult, StoreError>;

    async fn list_items(&self, directory: &str) -> Result<ListItemsResult, StoreError>;
}

fn validate_path(path: &str) -> Result<(), StoreError> {
    if path.trim().trim_matches('/').is_empty() {
        return Err(StoreError::new(ErrorCode::BadRequest, "path must be non-empty"));
    }
    if path.contains('\\') || path.contains("..") {
        return Err(StoreError::new(
            ErrorCode::BadRequest,
            format!("invalid path {path:?}"),
        ));
    }
    Ok(())
}

fn normalize_path(path: &str) -> String {
    format!("/{}", path.trim().trim_matches('/'))
}

//! In-process lease store.
//!
//! Holds roles and blobs in memory behind a single lock. Expired holders are purged on every
//! access to their role, so a crashed holder frees its slot once its lease runs out.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use roster_core::types::unix_time_ms;

use crate::{
    normalize_path, validate_path, DeleteDataResult, ErrorCode, LeaseStore, ListItemsResult,
    ListStats, ReadDataResult, ReadRoleResult, ReleaseRoleResult, StoreError, TakeRoleResult,
    WriteDataResult,
};

#[derive(Debug, Clone)]
pub struct MemStoreConfig {
    /// Largest blob accepted by `write_data`.
    pub max_data_bytes: usize,
    /// Playtime reported by `read_role` for roles created without one.
    pub default_playtime: Duration,
}

impl Default for MemStoreConfig {
    fn default() -> Self {
        Self {
            max_data_bytes: 64 * 1024,
            default_playtime: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
struct RoleEntry {
    max_holders: u32,
    default_playtime: Duration,
    /// holder -> expiration (Unix ms)
    holders: BTreeMap<String, u64>,
}

impl RoleEntry {
    fn purge_expired(&mut self, now_ms: u64) {
        self.holders.retain(|_, expires| *expires > now_ms);
    }
}

#[derive(Debug)]
struct DataItem {
    content_type: String,
    content: Vec<u8>,
    create_org_time_ms: u64,
    update_org_time_ms: u64,
}

#[derive(Debug, Default)]
struct MemState {
    roles: BTreeMap<String, RoleEntry>,
    data: BTreeMap<String, DataItem>,
    last_org_time_ms: u64,
}

impl MemState {
    /// Strictly increasing so update timestamps can be used for fencing.
    fn tick(&mut self, now_ms: u64) -> u64 {
        self.last_org_time_ms = now_ms.max(self.last_org_time_ms.saturating_add(1));
        self.last_org_time_ms
    }
}

#[derive(Debug, Default)]
pub struct MemLeaseStore {
    config: MemStoreConfig,
    state: Mutex<MemState>,
    outage: AtomicBool,
}

impl MemLeaseStore {
    pub fn new(config: MemStoreConfig) -> Self {
        Self {
            config,
            state: Mutex::new(MemState::default()),
            outage: AtomicBool::new(false),
        }
    }

    /// While set, every call fails with [`ErrorCode::RequestCollision`].
    pub fn set_outage(&self, outage: bool) {
        self.outage.store(outage, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemState>, StoreError> {
        if self.outage.load(Ordering::SeqCst) {
            return Err(StoreError::new(
                ErrorCode::RequestCollision,
                "store unavailable",
            ));
        }
        self.state
            .lock()
            .map_err(|_| StoreError::new(ErrorCode::Internal, "store state poisoned"))
    }
}

fn duration_ms(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}

fn not_found(path: &str) -> StoreError {
    StoreError::new(ErrorCode::NotFound, format!("{path} not found"))
}

#[async_trait]
impl LeaseStore for MemLeaseStore {
    async fn take_role(
        &self,
        role_path: &str,
        holder: &str,
        playtime: Duration,
        max_holders: u32,
    ) -> Result<TakeRoleResult, StoreError> {
        validate_path(role_path)?;
        if holder.trim().is_empty() {
            return Err(StoreError::new(ErrorCode::BadRequest, "holder must be non-empty"));
        }
        if max_holders == 0 || playtime.is_zero() {
            return Err(StoreError::new(
                ErrorCode::BadRequest,
                "max_holders and playtime must be positive",
            ));
        }

        let mut state = self.lock()?;
        let now_ms = unix_time_ms();
        let org_time_ms = state.tick(now_ms);
        let role = state
            .roles
            .entry(normalize_path(role_path))
            .or_insert_with(|| RoleEntry {
                max_holders,
                default_playtime: playtime,
                holders: BTreeMap::new(),
            });
        role.purge_expired(now_ms);
        role.max_holders = max_holders;

        let requested = now_ms.saturating_add(duration_ms(playtime));
        let holder_count = role.holders.len();
        let is_new_holder = match role.holders.get_mut(holder) {
            Some(expires) => {
                *expires = (*expires).max(requested);
                false
            }
            None if holder_count < max_holders as usize => {
                role.holders.insert(holder.to_string(), requested);
                true
            }
            None => {
                return Err(StoreError::new(
                    ErrorCode::Conflict,
                    format!("role {role_path} is full"),
                ));
            }
        };
        let expires_unix_time_ms = role.holders.get(holder).copied().unwrap_or(requested);

        tracing::trace!(
            role = role_path,
            holder,
            is_new_holder,
            expires_unix_time_ms,
            "role taken"
        );
        Ok(TakeRoleResult {
            org_time_ms,
            is_new_holder,
            expires_unix_time_ms,
        })
    }

    async fn release_role(
        &self,
        role_path: &str,
        holder: &str,
    ) -> Result<ReleaseRoleResult, StoreError> {
        validate_path(role_path)?;
        let mut state = self.lock()?;
        let org_time_ms = state.tick(unix_time_ms());
        if let Some(role) = state.roles.get_mut(&normalize_path(role_path)) {
            role.holders.remove(holder);
        }
        Ok(ReleaseRoleResult { org_time_ms })
    }

    async fn read_role(&self, role_path: &str) -> Result<ReadRoleResult, StoreError> {
        validate_path(role_path)?;
        let mut state = self.lock()?;
        let now_ms = unix_time_ms();
        let org_time_ms = state.tick(now_ms);
        let role = state
            .roles
            .get_mut(&normalize_path(role_path))
            .ok_or_else(|| not_found(role_path))?;
        role.purge_expired(now_ms);

        let remaining_ms = role
            .holders
            .iter()
            .map(|(holder, expires)| (holder.clone(), *expires as i64 - now_ms as i64))
            .collect();
        Ok(ReadRoleResult {
            org_time_ms,
            default_playtime: role.default_playtime,
            max_holders: role.max_holders,
            remaining_ms,
        })
    }

    async fn write_data(
        &self,
        data_path: &str,
        content: &[u8],
        content_type: &str,
        if_updated_at: Option<u64>,
    ) -> Result<WriteDataResult, StoreError> {
        validate_path(data_path)?;
        if content_type.trim().is_empty() {
            return Err(StoreError::new(
                ErrorCode::BadRequest,
                "content type must be non-empty",
            ));
        }
        if content.len() > self.config.max_data_bytes {
            return Err(StoreError::new(
                ErrorCode::PayloadTooLarge,
                format!(
                    "{} bytes exceeds limit of {}",
                    content.len(),
                    self.config.max_data_bytes
                ),
            ));
        }

        let mut state = self.lock()?;
        let org_time_ms = state.tick(unix_time_ms());
        let key = normalize_path(data_path);

        let existing = state.data.get(&key);
        if let Some(expected) = if_updated_at {
            match existing {
                None => return Err(not_found(data_path)),
                Some(item) if item.update_org_time_ms != expected => {
                    return Err(StoreError::new(
                        ErrorCode::Conflict,
                        format!(
                            "{data_path} was updated at {}, not {expected}",
                            item.update_org_time_ms
                        ),
                    ));
                }
                Some(_) => {}
            }
        }

        let is_new_item = existing.is_none();
        let create_org_time_ms = existing
            .map(|item| item.create_org_time_ms)
            .unwrap_or(org_time_ms);
        state.data.insert(
            key,
            DataItem {
                content_type: content_type.to_string(),
                content: content.to_vec(),
                create_org_time_ms,
                update_org_time_ms: org_time_ms,
            },
        );

        Ok(WriteDataResult {
            org_time_ms,
            is_new_item,
            create_org_time_ms,
            update_org_time_ms: org_time_ms,
            bytes_written: content.len() as u64,
        })
    }

    async fn read_data(&self, data_path: &str) -> Result<ReadDataResult, StoreError> {
        validate_path(data_path)?;
        let mut state = self.lock()?;
        let org_time_ms = state.tick(unix_time_ms());
        let item = state
            .data
            .get(&normalize_path(data_path))
            .ok_or_else(|| not_found(data_path))?;
        Ok(ReadDataResult {
            org_time_ms,
            create_org_time_ms: item.create_org_time_ms,
            update_org_time_ms: item.update_org_time_ms,
            content_type: item.content_type.clone(),
            content: item.content.clone(),
        })
    }

    async fn delete_data(
        &self,
        data_path: &str,
        if_updated_at: Option<u64>,
    ) -> Result<DeleteDataResult, StoreError> {
        validate_path(data_path)?;
        let mut state = self.lock()?;
        let org_time_ms = state.tick(unix_time_ms());
        let key = normalize_path(data_path);
        let Some(item) = state.data.get(&key) else {
            return Err(not_found(data_path));
        };
        if let Some(expected) = if_updated_at {
            if item.update_org_time_ms != expected {
                return Err(StoreError::new(
                    ErrorCode::Conflict,
                    format!("{data_path} was updated after {expected}"),
                ));
            }
        }
        state.data.remove(&key);
        Ok(DeleteDataResult { org_time_ms })
    }

    async fn list_items(&self, directory: &str) -> Result<ListItemsResult, StoreError> {
        validate_path(directory)?;
        let mut state = self.lock()?;
        let now_ms = unix_time_ms();
        let org_time_ms = state.tick(now_ms);
        let prefix = format!("{}/", normalize_path(directory));

        let mut items = Vec::new();
        let mut stats = ListStats::default();
        for (path, role) in state.roles.iter_mut() {
            role.purge_expired(now_ms);
            if let Some(name) = path.strip_prefix(&prefix) {
                items.push(format!("{name}.role"));
                stats.role_count += 1;
            }
        }
        for path in state.data.keys() {
            if let Some(name) = path.strip_prefix(&prefix) {
                items.push(format!("{name}.data"));
                stats.data_item_count += 1;
            }
        }
        items.sort();

        Ok(ListItemsResult {
            org_time_ms,
            items,
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROLE: &str = "/run/manager";

    #[tokio::test]
    async fn role_cap_is_enforced() -> anyhow::Result<()> {
        let store = MemLeaseStore::default();
        let playtime = Duration::from_secs(10);

        assert!(store.take_role(ROLE, "a", playtime, 2).await?.is_new_holder);
        assert!(store.take_role(ROLE, "b", playtime, 2).await?.is_new_holder);
        let err = store.take_role(ROLE, "c", playtime, 2).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Conflict);

        // Members renew even when the role is full.
        assert!(!store.take_role(ROLE, "a", playtime, 2).await?.is_new_holder);

        let read = store.read_role(ROLE).await?;
        assert_eq!(read.max_holders, 2);
        assert_eq!(read.active_holders().len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn renewal_never_moves_expiration_back() -> anyhow::Result<()> {
        let store = MemLeaseStore::default();
        let long = store.take_role(ROLE, "a", Duration::from_secs(30), 1).await?;
        let short = store.take_role(ROLE, "a", Duration::from_secs(1), 1).await?;
        assert!(short.expires_unix_time_ms >= long.expires_unix_time_ms);
        Ok(())
    }

    #[tokio::test]
    async fn expired_holder_frees_its_slot() -> anyhow::Result<()> {
        let store = MemLeaseStore::default();
        store.take_role(ROLE, "a", Duration::from_millis(50), 1).await?;
        assert!(store
            .take_role(ROLE, "b", Duration::from_millis(50), 1)
            .await
            .is_err());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(store.read_role(ROLE).await?.active_holders().is_empty());
        store.take_role(ROLE, "b", Duration::from_millis(50), 1).await?;
        Ok(())
    }

    #[tokio::test]
    async fn release_frees_the_slot_and_is_idempotent() -> anyhow::Result<()> {
        let store = MemLeaseStore::default();
        store.take_role(ROLE, "a", Duration::from_secs(10), 1).await?;
        store.release_role(ROLE, "a").await?;
        store.release_role(ROLE, "a").await?;
        store.take_role(ROLE, "b", Duration::from_secs(10), 1).await?;
        Ok(())
    }

    #[tokio::test]
    async fn unknown_role_is_not_found() {
        let store = MemLeaseStore::default();
        let err = store.read_role("/nobody/here").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn fenced_write_rejects_stale_timestamp() -> anyhow::Result<()> {
        let store = MemLeaseStore::default();
        let first = store.write_data("/run/problem", b"{}", "application/json", None).await?;
        assert!(first.is_new_item);

        let second = store
            .write_data(
                "/run/problem",
                b"{\"a\":1}",
                "application/json",
                Some(first.update_org_time_ms),
            )
            .await?;
        assert!(!second.is_new_item);
        assert_eq!(second.create_org_time_ms, first.create_org_time_ms);
        assert!(second.update_org_time_ms > first.update_org_time_ms);

        let err = store
            .write_data(
                "/run/problem",
                b"{}",
                "application/json",
                Some(first.update_org_time_ms),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Conflict);

        let read = store.read_data("/run/problem").await?;
        assert_eq!(read.content, b"{\"a\":1}".to_vec());
        assert_eq!(read.content_type, "application/json");
        Ok(())
    }

    #[tokio::test]
    async fn oversized_write_is_rejected() {
        let store = MemLeaseStore::new(MemStoreConfig {
            max_data_bytes: 4,
            ..Default::default()
        });
        let err = store
            .write_data("/run/problem", b"12345", "text/plain", None)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::PayloadTooLarge);
    }

    #[tokio::test]
    async fn delete_data_honours_fencing() -> anyhow::Result<()> {
        let store = MemLeaseStore::default();
        let written = store.write_data("/run/blob", b"x", "text/plain", None).await?;
        let err = store
            .delete_data("/run/blob", Some(written.update_org_time_ms + 1))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Conflict);
        store
            .delete_data("/run/blob", Some(written.update_org_time_ms))
            .await?;
        assert_eq!(
            store.read_data("/run/blob").await.unwrap_err().code,
            ErrorCode::NotFound
        );
        Ok(())
    }

    #[tokio::test]
    async fn list_items_counts_roles_and_data() -> anyhow::Result<()> {
        let store = MemLeaseStore::default();
        store.take_role("/run/manager", "a", Duration::from_secs(10), 1).await?;
        store.take_role("/run/workers", "b", Duration::from_secs(10), 3).await?;
        store.write_data("/run/problem", b"{}", "application/json", None).await?;
        store.write_data("/other/problem", b"{}", "application/json", None).await?;

        let listed = store.list_items("/run").await?;
        assert_eq!(
            listed.items,
            vec![
                "manager.role".to_string(),
                "problem.data".to_string(),
                "workers.role".to_string()
            ]
        );
        assert_eq!(
            listed.stats,
            ListStats {
                role_count: 2,
                data_item_count: 1
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn outage_fails_every_call() {
        let store = MemLeaseStore::default();
        store.set_outage(true);
        let err = store
            .take_role(ROLE, "a", Duration::from_secs(1), 1)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::RequestCollision);
        store.set_outage(false);
        assert!(store.take_role(ROLE, "a", Duration::from_secs(1), 1).await.is_ok());
    }
}

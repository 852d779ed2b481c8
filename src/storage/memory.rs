//! In-memory audit store.
//!
//! Same filter, sort and pagination semantics as the PostgreSQL store. Used
//! for local runs (`storage.type: memory`) and throughout the test suite,
//! where the failure and latency knobs stand in for an unhealthy database.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{AuditStore, Result, StorageError};
use crate::model::{AuditEvent, AuditFilter, AuditPage, Pagination, SortField, SortOrder};

/// Audit store backed by a `Vec`.
#[derive(Default)]
pub struct MemoryAuditStore {
    events: RwLock<Vec<AuditEvent>>,
    fail_on_save: AtomicBool,
    save_delay: RwLock<Option<Duration>>,
    save_calls: AtomicUsize,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `save` fail with `StorageError::Unavailable`.
    pub fn set_fail_on_save(&self, fail: bool) {
        self.fail_on_save.store(fail, AtomicOrdering::SeqCst);
    }

    /// Delay every subsequent `save` by `delay` before it does anything.
    pub async fn set_save_delay(&self, delay: Option<Duration>) {
        *self.save_delay.write().await = delay;
    }

    /// Number of `save` calls observed, successful or not.
    pub fn save_count(&self) -> usize {
        self.save_calls.load(AtomicOrdering::SeqCst)
    }

    /// Number of distinct events stored.
    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }

    /// Snapshot of everything stored, in insertion order.
    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.read().await.clone()
    }
}

fn matches(filter: &AuditFilter, event: &AuditEvent) -> bool {
    fn eq(expected: &Option<String>, actual: &str) -> bool {
        expected.as_deref().map_or(true, |e| e == actual)
    }

    eq(&filter.action, &event.action)
        && eq(&filter.status, &event.status)
        && eq(&filter.actor_id, &event.actor_id)
        && eq(&filter.actor_type, &event.actor_type)
        && filter.start_time.map_or(true, |t| event.timestamp >= t)
        && filter.end_time.map_or(true, |t| event.timestamp <= t)
        && eq(&filter.service_name, &event.service_name)
}

fn compare(field: SortField, a: &AuditEvent, b: &AuditEvent) -> Ordering {
    let primary = match field {
        SortField::Timestamp => a.timestamp.cmp(&b.timestamp),
        SortField::EventId => a.event_id.cmp(&b.event_id),
        SortField::Action => a.action.cmp(&b.action),
        SortField::Status => a.status.cmp(&b.status),
        SortField::ActorId => a.actor_id.cmp(&b.actor_id),
        SortField::ActorType => a.actor_type.cmp(&b.actor_type),
        SortField::ServiceName => a.service_name.cmp(&b.service_name),
    };
    primary.then_with(|| a.event_id.cmp(&b.event_id))
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn save(&self, event: &AuditEvent) -> Result<()> {
        self.save_calls.fetch_add(1, AtomicOrdering::SeqCst);

        let delay = *self.save_delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail_on_save.load(AtomicOrdering::SeqCst) {
            return Err(StorageError::Unavailable("Mock save failure".to_string()));
        }

        let mut events = self.events.write().await;
        if !events.iter().any(|e| e.event_id == event.event_id) {
            events.push(event.clone());
        }
        Ok(())
    }

    async fn query(&self, filter: &AuditFilter) -> Result<AuditPage> {
        let events = self.events.read().await;

        let mut matched: Vec<&AuditEvent> = events.iter().filter(|e| matches(filter, e)).collect();
        matched.sort_by(|a, b| {
            let ord = compare(filter.sort_by, a, b);
            match filter.sort_order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            }
        });

        let total = matched.len() as i64;
        let page: Vec<AuditEvent> = matched
            .into_iter()
            .skip(filter.offset() as usize)
            .take(filter.page_size() as usize)
            .cloned()
            .collect();

        Ok(AuditPage {
            events: page,
            pagination: Pagination {
                page: filter.page(),
                page_size: filter.page_size(),
                total,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn event_at(action: &str, actor: &str, hour: u32) -> AuditEvent {
        AuditEvent::new(action, "success", actor, "user", "auth")
            .at(Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap())
    }

    async fn seeded() -> MemoryAuditStore {
        let store = MemoryAuditStore::new();
        store.save(&event_at("login", "alice", 1)).await.unwrap();
        store.save(&event_at("logout", "alice", 2)).await.unwrap();
        store.save(&event_at("login", "bob", 3)).await.unwrap();
        store.save(&event_at("login", "carol", 4)).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_save_is_idempotent_on_event_id() {
        let store = MemoryAuditStore::new();
        let event = event_at("login", "alice", 1);

        store.save(&event).await.unwrap();
        store.save(&event).await.unwrap();

        assert_eq!(store.len().await, 1);
        assert_eq!(store.save_count(), 2);
    }

    #[tokio::test]
    async fn test_fail_on_save() {
        let store = MemoryAuditStore::new();
        store.set_fail_on_save(true);

        let result = store.save(&event_at("login", "alice", 1)).await;

        assert!(matches!(result, Err(StorageError::Unavailable(_))));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_query_defaults_newest_first() {
        let store = seeded().await;
        let page = store.query(&AuditFilter::default()).await.unwrap();

        assert_eq!(page.pagination.total, 4);
        assert_eq!(page.pagination.page, 1);
        assert_eq!(page.pagination.page_size, 20);
        let actors: Vec<&str> = page.events.iter().map(|e| e.actor_id.as_str()).collect();
        assert_eq!(actors, ["carol", "bob", "alice", "alice"]);
    }

    #[tokio::test]
    async fn test_query_equality_and_time_range() {
        let store = seeded().await;
        let filter = AuditFilter::default().with_action("login").between(
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 2, 0, 0).unwrap()),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 3, 0, 0).unwrap()),
        );

        let page = store.query(&filter).await.unwrap();

        assert_eq!(page.pagination.total, 1);
        assert_eq!(page.events[0].actor_id, "bob");
    }

    #[tokio::test]
    async fn test_query_pagination_reports_total_of_all_matches() {
        let store = seeded().await;
        let filter = AuditFilter::default()
            .sorted(SortField::Timestamp, SortOrder::Asc)
            .paged(2, 3);

        let page = store.query(&filter).await.unwrap();

        assert_eq!(page.pagination.total, 4);
        assert_eq!(page.events.len(), 1);
        assert_eq!(page.events[0].actor_id, "carol");
    }

    #[tokio::test]
    async fn test_query_page_past_end_is_empty() {
        let store = seeded().await;
        let page = store
            .query(&AuditFilter::default().paged(9, 20))
            .await
            .unwrap();

        assert!(page.events.is_empty());
        assert_eq!(page.pagination.total, 4);
    }
}

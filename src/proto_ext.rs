//! Conversions between protobuf messages and model types.

use chrono::{DateTime, Utc};
use prost_types::Timestamp;

use crate::model::{AuditEvent, AuditFilter, AuditPage, Pagination, SortField, SortOrder};
use crate::proto;
use crate::storage::StorageError;

/// Convert a chrono timestamp to protobuf.
pub fn timestamp_to_proto(ts: DateTime<Utc>) -> Timestamp {
    Timestamp {
        seconds: ts.timestamp(),
        nanos: ts.timestamp_subsec_nanos() as i32,
    }
}

/// Convert a protobuf timestamp to chrono. `None` when out of range.
pub fn timestamp_from_proto(ts: &Timestamp) -> Option<DateTime<Utc>> {
    let nanos = u32::try_from(ts.nanos).ok()?;
    DateTime::from_timestamp(ts.seconds, nanos)
}

/// Treat empty and whitespace-only strings as "not supplied".
fn present(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn saturating_i32(value: i64) -> i32 {
    i32::try_from(value).unwrap_or(if value < 0 { i32::MIN } else { i32::MAX })
}

impl From<&AuditEvent> for proto::AuditEvent {
    fn from(event: &AuditEvent) -> Self {
        Self {
            event_id: event.event_id.to_string(),
            timestamp: Some(timestamp_to_proto(event.timestamp)),
            action: event.action.clone(),
            status: event.status.clone(),
            actor_id: event.actor_id.clone(),
            actor_type: event.actor_type.clone(),
            ip_address: event.ip_address.clone(),
            user_agent: event.user_agent.clone(),
            resource: event.resource.clone(),
            resource_id: event.resource_id.clone(),
            details: event.details.as_ref().map(|d| d.to_string()),
            service_name: event.service_name.clone(),
        }
    }
}

impl From<Pagination> for proto::Pagination {
    fn from(p: Pagination) -> Self {
        Self {
            page: saturating_i32(p.page),
            page_size: saturating_i32(p.page_size),
            total: p.total,
        }
    }
}

impl From<AuditPage> for proto::FindAuditResponse {
    fn from(page: AuditPage) -> Self {
        Self {
            events: page.events.iter().map(proto::AuditEvent::from).collect(),
            pagination: Some(page.pagination.into()),
        }
    }
}

impl TryFrom<proto::FindAuditRequest> for AuditFilter {
    type Error = StorageError;

    fn try_from(req: proto::FindAuditRequest) -> Result<Self, Self::Error> {
        let start_time = req
            .start_time
            .as_ref()
            .map(|ts| {
                timestamp_from_proto(ts)
                    .ok_or_else(|| StorageError::InvalidFilter("start_time out of range".to_string()))
            })
            .transpose()?;
        let end_time = req
            .end_time
            .as_ref()
            .map(|ts| {
                timestamp_from_proto(ts)
                    .ok_or_else(|| StorageError::InvalidFilter("end_time out of range".to_string()))
            })
            .transpose()?;

        let sort_by =
            SortField::parse(&req.sort_by).map_err(|e| StorageError::InvalidFilter(e.to_string()))?;

        Ok(Self {
            action: present(req.action),
            status: present(req.status),
            actor_id: present(req.actor_id),
            actor_type: present(req.actor_type),
            start_time,
            end_time,
            service_name: present(req.service_name),
            page: i64::from(req.page),
            page_size: i64::from(req.page_size),
            sort_by,
            sort_order: SortOrder::parse(&req.sort_order),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_timestamp_conversion_keeps_nanos() {
        let ts = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        assert_eq!(timestamp_from_proto(&timestamp_to_proto(ts)), Some(ts));
    }

    #[test]
    fn test_negative_nanos_rejected() {
        let ts = Timestamp {
            seconds: 0,
            nanos: -1,
        };
        assert_eq!(timestamp_from_proto(&ts), None);
    }

    #[test]
    fn test_event_to_proto() {
        let event = AuditEvent::new("login", "success", "u-1", "user", "auth")
            .with_details(json!({"mfa": true}));

        let msg = proto::AuditEvent::from(&event);

        assert_eq!(msg.event_id, event.event_id.to_string());
        assert_eq!(msg.details.as_deref(), Some(r#"{"mfa":true}"#));
        assert_eq!(msg.ip_address, None);
        assert_eq!(
            msg.timestamp.as_ref().and_then(timestamp_from_proto),
            Some(event.timestamp)
        );
    }

    #[test]
    fn test_request_to_filter() {
        let req = proto::FindAuditRequest {
            action: Some("login".to_string()),
            status: Some(String::new()),
            start_time: Some(Timestamp {
                seconds: 1_700_000_000,
                nanos: 0,
            }),
            page: 0,
            page_size: -5,
            sort_by: "ACTOR_ID".to_string(),
            sort_order: "Asc".to_string(),
            ..Default::default()
        };

        let filter = AuditFilter::try_from(req).unwrap();

        assert_eq!(filter.action.as_deref(), Some("login"));
        assert_eq!(filter.status, None);
        assert!(filter.start_time.is_some());
        assert_eq!(filter.end_time, None);
        assert_eq!(filter.page(), 1);
        assert_eq!(filter.page_size(), 20);
        assert_eq!(filter.sort_by, SortField::ActorId);
        assert_eq!(filter.sort_order, SortOrder::Asc);
    }

    #[test]
    fn test_unknown_sort_field_is_invalid_filter() {
        let req = proto::FindAuditRequest {
            sort_by: "password; DROP TABLE audit_event".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            AuditFilter::try_from(req),
            Err(StorageError::InvalidFilter(_))
        ));
    }

    #[test]
    fn test_page_to_response() {
        let page = AuditPage {
            events: vec![AuditEvent::new("a", "s", "id", "t", "svc")],
            pagination: Pagination {
                page: 2,
                page_size: 1,
                total: 7,
            },
        };

        let resp = proto::FindAuditResponse::from(page);

        assert_eq!(resp.events.len(), 1);
        let pagination = resp.pagination.unwrap();
        assert_eq!((pagination.page, pagination.page_size, pagination.total), (2, 1, 7));
    }
}

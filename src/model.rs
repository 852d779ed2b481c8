//! Audit event model.
//!
//! `AuditEvent` is the unit flowing through the ingestion pipeline; `AuditFilter`
//! and `AuditPage` describe the query side consumed by `AuditStore::query`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default page size when a caller supplies none (or a non-positive one).
pub const DEFAULT_PAGE_SIZE: i64 = 20;

/// A single audit record produced by an upstream service.
///
/// Identifier and timestamp are assigned by the producer; ingestion never
/// rewrites either.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub status: String,
    pub actor_id: String,
    pub actor_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    /// Opaque structured payload, stored as-is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub service_name: String,
}

/// Errors decoding a delivery body into an `AuditEvent`.
///
/// Every variant marks the message as malformed: it will never decode, so it
/// must not be requeued.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing required field '{0}'")]
    MissingField(&'static str),
}

/// Wire shape of a delivery body. Everything is optional here so that absent
/// fields surface as `DecodeError::MissingField` rather than a generic serde
/// message. Unknown fields are ignored.
#[derive(Deserialize)]
struct AuditEventPayload {
    event_id: Option<Uuid>,
    timestamp: Option<DateTime<Utc>>,
    action: Option<String>,
    status: Option<String>,
    actor_id: Option<String>,
    actor_type: Option<String>,
    ip_address: Option<String>,
    user_agent: Option<String>,
    resource: Option<String>,
    resource_id: Option<String>,
    details: Option<serde_json::Value>,
    service_name: Option<String>,
}

fn required(value: Option<String>, field: &'static str) -> Result<String, DecodeError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(DecodeError::MissingField(field)),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

impl AuditEvent {
    /// Create an event with a fresh identifier and the current time.
    ///
    /// Producer-side convenience; the ingestion path only ever decodes.
    pub fn new(
        action: impl Into<String>,
        status: impl Into<String>,
        actor_id: impl Into<String>,
        actor_type: impl Into<String>,
        service_name: impl Into<String>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            action: action.into(),
            status: status.into(),
            actor_id: actor_id.into(),
            actor_type: actor_type.into(),
            ip_address: None,
            user_agent: None,
            resource: None,
            resource_id: None,
            details: None,
            service_name: service_name.into(),
        }
    }

    /// Attach the resource this event refers to.
    pub fn with_resource(mut self, resource: impl Into<String>, resource_id: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self.resource_id = Some(resource_id.into());
        self
    }

    /// Attach network context.
    pub fn with_client(mut self, ip_address: impl Into<String>, user_agent: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Attach the structured details payload.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Override the producer timestamp.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Decode a delivery body.
    ///
    /// Identifier, timestamp, action, status, actor id, actor type and
    /// service name must be present and non-empty. A nil UUID counts as
    /// missing.
    pub fn decode(body: &[u8]) -> Result<Self, DecodeError> {
        let payload: AuditEventPayload = serde_json::from_slice(body)?;

        let event_id = payload
            .event_id
            .filter(|id| !id.is_nil())
            .ok_or(DecodeError::MissingField("event_id"))?;
        let timestamp = payload
            .timestamp
            .ok_or(DecodeError::MissingField("timestamp"))?;

        Ok(Self {
            event_id,
            timestamp,
            action: required(payload.action, "action")?,
            status: required(payload.status, "status")?,
            actor_id: required(payload.actor_id, "actor_id")?,
            actor_type: required(payload.actor_type, "actor_type")?,
            ip_address: non_empty(payload.ip_address),
            user_agent: non_empty(payload.user_agent),
            resource: non_empty(payload.resource),
            resource_id: non_empty(payload.resource_id),
            details: payload.details.filter(|d| !d.is_null()),
            service_name: required(payload.service_name, "service_name")?,
        })
    }

    /// Encode as a delivery body.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

// ============================================================================
// Query side
// ============================================================================

/// Sortable columns. Anything else is rejected before it reaches a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortField {
    #[default]
    Timestamp,
    EventId,
    Action,
    Status,
    ActorId,
    ActorType,
    ServiceName,
}

/// Unknown sort column requested by a caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown sort field '{0}'")]
pub struct UnknownSortField(pub String);

impl SortField {
    /// Parse a caller-supplied column name. Empty means the default.
    pub fn parse(name: &str) -> Result<Self, UnknownSortField> {
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "timestamp" => Ok(Self::Timestamp),
            "event_id" => Ok(Self::EventId),
            "action" => Ok(Self::Action),
            "status" => Ok(Self::Status),
            "actor_id" => Ok(Self::ActorId),
            "actor_type" => Ok(Self::ActorType),
            "service_name" => Ok(Self::ServiceName),
            _ => Err(UnknownSortField(name.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timestamp => "timestamp",
            Self::EventId => "event_id",
            Self::Action => "action",
            Self::Status => "status",
            Self::ActorId => "actor_id",
            Self::ActorType => "actor_type",
            Self::ServiceName => "service_name",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    /// `asc` in any case sorts ascending; everything else is descending.
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("asc") {
            Self::Asc
        } else {
            Self::Desc
        }
    }
}

/// Query over stored audit events.
///
/// Every predicate is optional; absent predicates match everything. `page`
/// and `page_size` are kept as supplied and normalised through
/// [`AuditFilter::page`] / [`AuditFilter::page_size`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditFilter {
    pub action: Option<String>,
    pub status: Option<String>,
    pub actor_id: Option<String>,
    pub actor_type: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub service_name: Option<String>,
    pub page: i64,
    pub page_size: i64,
    pub sort_by: SortField,
    pub sort_order: SortOrder,
}

impl AuditFilter {
    /// 1-based page, never below 1.
    pub fn page(&self) -> i64 {
        self.page.max(1)
    }

    /// Page size, `DEFAULT_PAGE_SIZE` when unset or non-positive.
    pub fn page_size(&self) -> i64 {
        if self.page_size <= 0 {
            DEFAULT_PAGE_SIZE
        } else {
            self.page_size
        }
    }

    /// Row offset of the first event on the requested page.
    pub fn offset(&self) -> i64 {
        (self.page() - 1).saturating_mul(self.page_size())
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_actor(mut self, actor_id: impl Into<String>, actor_type: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self.actor_type = Some(actor_type.into());
        self
    }

    pub fn with_service(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = Some(service_name.into());
        self
    }

    pub fn between(mut self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        self.start_time = start;
        self.end_time = end;
        self
    }

    pub fn paged(mut self, page: i64, page_size: i64) -> Self {
        self.page = page;
        self.page_size = page_size;
        self
    }

    pub fn sorted(mut self, field: SortField, order: SortOrder) -> Self {
        self.sort_by = field;
        self.sort_order = order;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: i64,
    pub page_size: i64,
    pub total: i64,
}

/// One page of query results plus the total match count.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditPage {
    pub events: Vec<AuditEvent>,
    pub pagination: Pagination,
}

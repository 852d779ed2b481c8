//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building.
//! The DDL itself lives in `migrations/postgres`.

use sea_query::Iden;

use crate::model::SortField;

/// `audit_event` table schema.
#[derive(Iden, Clone, Copy)]
pub enum AuditEvents {
    #[iden = "audit_event"]
    Table,
    #[iden = "event_id"]
    EventId,
    #[iden = "timestamp"]
    Timestamp,
    #[iden = "action"]
    Action,
    #[iden = "status"]
    Status,
    #[iden = "actor_id"]
    ActorId,
    #[iden = "actor_type"]
    ActorType,
    #[iden = "ip_address"]
    IpAddress,
    #[iden = "user_agent"]
    UserAgent,
    #[iden = "resource"]
    Resource,
    #[iden = "resource_id"]
    ResourceId,
    #[iden = "details"]
    Details,
    #[iden = "service_name"]
    ServiceName,
}

/// Every column in the order rows are read back.
pub const ALL_COLUMNS: [AuditEvents; 12] = [
    AuditEvents::EventId,
    AuditEvents::Timestamp,
    AuditEvents::Action,
    AuditEvents::Status,
    AuditEvents::ActorId,
    AuditEvents::ActorType,
    AuditEvents::IpAddress,
    AuditEvents::UserAgent,
    AuditEvents::Resource,
    AuditEvents::ResourceId,
    AuditEvents::Details,
    AuditEvents::ServiceName,
];

impl From<SortField> for AuditEvents {
    fn from(field: SortField) -> Self {
        match field {
            SortField::Timestamp => Self::Timestamp,
            SortField::EventId => Self::EventId,
            SortField::Action => Self::Action,
            SortField::Status => Self::Status,
            SortField::ActorId => Self::ActorId,
            SortField::ActorType => Self::ActorType,
            SortField::ServiceName => Self::ServiceName,
        }
    }
}

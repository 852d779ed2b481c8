//! Audit query service.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{debug, error};

use crate::model::AuditFilter;
use crate::proto::{audit_query_server::AuditQuery, FindAuditRequest, FindAuditResponse};
use crate::storage::{AuditStore, StorageError};

/// Read-only query access to the audit store.
pub struct AuditQueryService {
    store: Arc<dyn AuditStore>,
}

impl AuditQueryService {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }
}

fn to_status(e: StorageError) -> Status {
    match e {
        StorageError::InvalidFilter(msg) => Status::invalid_argument(msg),
        other => {
            error!(error = %other, "FindAudit query failed");
            Status::internal(other.to_string())
        }
    }
}

#[tonic::async_trait]
impl AuditQuery for AuditQueryService {
    async fn find_audit(
        &self,
        request: Request<FindAuditRequest>,
    ) -> Result<Response<FindAuditResponse>, Status> {
        let filter = AuditFilter::try_from(request.into_inner()).map_err(to_status)?;
        debug!(
            page = filter.page(),
            page_size = filter.page_size(),
            sort_by = filter.sort_by.as_str(),
            "FindAudit"
        );

        let page = self.store.query(&filter).await.map_err(to_status)?;
        Ok(Response::new(page.into()))
    }
}

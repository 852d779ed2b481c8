//! Typed translation of an `AuditFilter` into SQL.
//!
//! Each present filter field appends exactly one predicate, always in the same
//! order, so a given filter renders to the same statement and the same
//! positional parameters every time. The count and page statements share the
//! predicate list.

use sea_query::{Alias, Asterisk, Expr, Func, Order, Query, SelectStatement};

use crate::model::{AuditFilter, SortField, SortOrder};

use super::schema::{AuditEvents, ALL_COLUMNS};

/// Builds the statements needed to answer one `AuditFilter`.
pub struct AuditQueryBuilder<'a> {
    filter: &'a AuditFilter,
}

impl<'a> AuditQueryBuilder<'a> {
    pub fn new(filter: &'a AuditFilter) -> Self {
        Self { filter }
    }

    /// Append one `and_where` per present predicate.
    fn apply_predicates(&self, stmt: &mut SelectStatement) {
        let f = self.filter;

        if let Some(action) = &f.action {
            stmt.and_where(Expr::col(AuditEvents::Action).eq(action.as_str()));
        }
        if let Some(status) = &f.status {
            stmt.and_where(Expr::col(AuditEvents::Status).eq(status.as_str()));
        }
        if let Some(actor_id) = &f.actor_id {
            stmt.and_where(Expr::col(AuditEvents::ActorId).eq(actor_id.as_str()));
        }
        if let Some(actor_type) = &f.actor_type {
            stmt.and_where(Expr::col(AuditEvents::ActorType).eq(actor_type.as_str()));
        }
        if let Some(start) = f.start_time {
            stmt.and_where(Expr::col(AuditEvents::Timestamp).gte(start));
        }
        if let Some(end) = f.end_time {
            stmt.and_where(Expr::col(AuditEvents::Timestamp).lte(end));
        }
        if let Some(service_name) = &f.service_name {
            stmt.and_where(Expr::col(AuditEvents::ServiceName).eq(service_name.as_str()));
        }
    }

    /// `SELECT COUNT(*) AS total ...` over the filtered rows.
    pub fn count(&self) -> SelectStatement {
        let mut stmt = Query::select();
        stmt.expr_as(Func::count(Expr::col(Asterisk)), Alias::new("total"))
            .from(AuditEvents::Table);
        self.apply_predicates(&mut stmt);
        stmt
    }

    /// Sorted, limited page of full rows.
    ///
    /// Ties on the sort column are broken by `event_id` so page boundaries
    /// are stable between requests.
    pub fn page(&self) -> SelectStatement {
        let f = self.filter;
        let order = match f.sort_order {
            SortOrder::Asc => Order::Asc,
            SortOrder::Desc => Order::Desc,
        };

        let mut stmt = Query::select();
        stmt.columns(ALL_COLUMNS).from(AuditEvents::Table);
        self.apply_predicates(&mut stmt);
        stmt.order_by(AuditEvents::from(f.sort_by), order.clone());
        if f.sort_by != SortField::EventId {
            stmt.order_by(AuditEvents::EventId, order);
        }
        stmt.limit(f.page_size() as u64).offset(f.offset() as u64);
        stmt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sea_query::{PostgresQueryBuilder, Value};

    #[test]
    fn test_empty_filter_has_no_where_clause() {
        let filter = AuditFilter::default();
        let builder = AuditQueryBuilder::new(&filter);

        let (count_sql, count_values) = builder.count().build(PostgresQueryBuilder);
        assert!(count_sql.starts_with(r#"SELECT COUNT(*) AS "total" FROM "audit_event""#));
        assert!(!count_sql.contains("WHERE"));
        assert!(count_values.0.is_empty());

        let page_sql = builder.page().to_string(PostgresQueryBuilder);
        assert!(!page_sql.contains("WHERE"));
        assert!(page_sql.contains(r#"ORDER BY "timestamp" DESC, "event_id" DESC"#));
        assert!(page_sql.ends_with("LIMIT 20 OFFSET 0"));
    }

    #[test]
    fn test_predicates_follow_fixed_order() {
        let start = chrono::Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = chrono::Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        // Set in a different order than the builder emits them.
        let filter = AuditFilter::default()
            .with_service("billing")
            .between(Some(start), Some(end))
            .with_status("failure")
            .with_action("invoice.void");

        let (sql, values) = AuditQueryBuilder::new(&filter).count().build(PostgresQueryBuilder);

        let positions: Vec<usize> = [
            r#""action" = $1"#,
            r#""status" = $2"#,
            r#""timestamp" >= $3"#,
            r#""timestamp" <= $4"#,
            r#""service_name" = $5"#,
        ]
        .iter()
        .map(|needle| sql.find(needle).unwrap_or_else(|| panic!("{needle} missing in {sql}")))
        .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));

        assert_eq!(values.0.len(), 5);
        assert_eq!(values.0[0], Value::from("invoice.void"));
        assert_eq!(values.0[1], Value::from("failure"));
        assert_eq!(values.0[4], Value::from("billing"));
    }

    #[test]
    fn test_count_and_page_share_parameters() {
        let filter = AuditFilter::default()
            .with_actor("u-1", "user")
            .paged(2, 10);
        let builder = AuditQueryBuilder::new(&filter);

        let (_, count_values) = builder.count().build(PostgresQueryBuilder);
        let (page_sql, page_values) = builder.page().build(PostgresQueryBuilder);

        assert_eq!(count_values.0[..2], page_values.0[..2]);
        assert!(page_sql.contains(r#""actor_id" = $1 AND "actor_type" = $2"#));
    }

    #[test]
    fn test_page_sort_and_offset() {
        let filter = AuditFilter::default()
            .sorted(SortField::ActorId, SortOrder::Asc)
            .paged(3, 25);
        let sql = AuditQueryBuilder::new(&filter)
            .page()
            .to_string(PostgresQueryBuilder);

        assert!(sql.contains(r#"ORDER BY "actor_id" ASC, "event_id" ASC"#));
        assert!(sql.ends_with("LIMIT 25 OFFSET 50"));
    }

    #[test]
    fn test_sort_by_event_id_has_no_tiebreak() {
        let filter = AuditFilter::default().sorted(SortField::EventId, SortOrder::Desc);
        let sql = AuditQueryBuilder::new(&filter)
            .page()
            .to_string(PostgresQueryBuilder);
        assert!(sql.contains(r#"ORDER BY "event_id" DESC LIMIT"#));
    }
}

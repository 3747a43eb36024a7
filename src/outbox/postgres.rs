//! PostgreSQL outbox store.

use chrono::{DateTime, Utc};
use sea_query::{ColumnDef, Expr, Iden, Index, Order, PostgresQueryBuilder, Query, Table};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use super::{EventState, OutboxEntry, OutboxError, OutboxStore};
use crate::event::Envelope;

/// Outbox table schema.
#[derive(Iden)]
enum EventOutbox {
    Table,
    #[iden = "event_id"]
    EventId,
    #[iden = "event_type"]
    EventType,
    #[iden = "content"]
    Content,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "transaction_id"]
    TransactionId,
    #[iden = "state"]
    State,
    #[iden = "times_sent"]
    TimesSent,
}

const ENTRY_COLUMNS: [EventOutbox; 7] = [
    EventOutbox::EventId,
    EventOutbox::EventType,
    EventOutbox::Content,
    EventOutbox::CreatedAt,
    EventOutbox::TransactionId,
    EventOutbox::State,
    EventOutbox::TimesSent,
];

/// Outbox store backed by the service's own PostgreSQL database.
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Initialize the outbox table schema.
    pub async fn init(&self) -> Result<(), OutboxError> {
        let create_table = Table::create()
            .table(EventOutbox::Table)
            .if_not_exists()
            .col(ColumnDef::new(EventOutbox::EventId).uuid().primary_key())
            .col(ColumnDef::new(EventOutbox::EventType).text().not_null())
            .col(ColumnDef::new(EventOutbox::Content).text().not_null())
            .col(
                ColumnDef::new(EventOutbox::CreatedAt)
                    .timestamp_with_time_zone()
                    .not_null(),
            )
            .col(ColumnDef::new(EventOutbox::TransactionId).uuid().not_null())
            .col(ColumnDef::new(EventOutbox::State).text().not_null())
            .col(
                ColumnDef::new(EventOutbox::TimesSent)
                    .integer()
                    .not_null()
                    .default(0),
            )
            .to_string(PostgresQueryBuilder);

        sqlx::query(&create_table).execute(&self.pool).await?;

        // Relay lookups
        let tx_state_index = Index::create()
            .if_not_exists()
            .name("idx_event_outbox_tx_state")
            .table(EventOutbox::Table)
            .col(EventOutbox::TransactionId)
            .col(EventOutbox::State)
            .to_string(PostgresQueryBuilder);

        sqlx::query(&tx_state_index).execute(&self.pool).await?;

        // Sweep lookups
        let created_index = Index::create()
            .if_not_exists()
            .name("idx_event_outbox_created_at")
            .table(EventOutbox::Table)
            .col(EventOutbox::CreatedAt)
            .to_string(PostgresQueryBuilder);

        sqlx::query(&created_index).execute(&self.pool).await?;

        info!("Outbox table initialized");
        Ok(())
    }

    /// Record the intent to publish, on the caller's open transaction.
    ///
    /// The business rows and this entry commit or roll back together; that
    /// is the whole point of the outbox.
    pub async fn save(
        &self,
        envelope: &Envelope,
        tx: &mut Transaction<'_, Postgres>,
        transaction_id: Uuid,
    ) -> Result<(), OutboxError> {
        let entry = OutboxEntry::new(envelope, transaction_id)?;

        let insert = Query::insert()
            .into_table(EventOutbox::Table)
            .columns(ENTRY_COLUMNS)
            .values_panic([
                entry.event_id.to_string().into(),
                entry.event_type.clone().into(),
                entry.content.clone().into(),
                entry.created_at.into(),
                entry.transaction_id.to_string().into(),
                entry.state.as_str().into(),
                entry.times_sent.into(),
            ])
            .to_string(PostgresQueryBuilder);

        sqlx::query(&insert).execute(&mut **tx).await?;

        debug!(
            event_id = %entry.event_id,
            event_type = %entry.event_type,
            transaction_id = %transaction_id,
            "Event recorded in outbox"
        );

        Ok(())
    }

    async fn set_state(&self, event_id: Uuid, state: EventState) -> Result<(), OutboxError> {
        let update = Query::update()
            .table(EventOutbox::Table)
            .value(EventOutbox::State, state.as_str())
            .and_where(Expr::col(EventOutbox::EventId).eq(event_id.to_string()))
            .to_string(PostgresQueryBuilder);

        let result = sqlx::query(&update).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(OutboxError::NotFound(event_id));
        }
        Ok(())
    }

    fn entry_from_row(row: &sqlx::postgres::PgRow) -> Result<OutboxEntry, OutboxError> {
        let state: String = row.try_get("state")?;
        Ok(OutboxEntry {
            event_id: row.try_get("event_id")?,
            event_type: row.try_get("event_type")?,
            content: row.try_get("content")?,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            transaction_id: row.try_get("transaction_id")?,
            state: EventState::parse(&state)?,
            times_sent: row.try_get("times_sent")?,
        })
    }
}

#[async_trait::async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn pending_for_transaction(
        &self,
        transaction_id: Uuid,
    ) -> Result<Vec<OutboxEntry>, OutboxError> {
        let select = Query::select()
            .columns(ENTRY_COLUMNS)
            .from(EventOutbox::Table)
            .and_where(Expr::col(EventOutbox::TransactionId).eq(transaction_id.to_string()))
            .and_where(Expr::col(EventOutbox::State).eq(EventState::NotPublished.as_str()))
            .order_by(EventOutbox::CreatedAt, Order::Asc)
            .to_string(PostgresQueryBuilder);

        let rows = sqlx::query(&select).fetch_all(&self.pool).await?;
        rows.iter().map(Self::entry_from_row).collect()
    }

    async fn mark_in_progress(&self, event_id: Uuid) -> Result<(), OutboxError> {
        let update = Query::update()
            .table(EventOutbox::Table)
            .value(EventOutbox::State, EventState::InProgress.as_str())
            .value(
                EventOutbox::TimesSent,
                Expr::col(EventOutbox::TimesSent).add(1),
            )
            .and_where(Expr::col(EventOutbox::EventId).eq(event_id.to_string()))
            .to_string(PostgresQueryBuilder);

        let result = sqlx::query(&update).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(OutboxError::NotFound(event_id));
        }
        Ok(())
    }

    async fn mark_published(&self, event_id: Uuid) -> Result<(), OutboxError> {
        self.set_state(event_id, EventState::Published).await
    }

    async fn mark_failed(&self, event_id: Uuid) -> Result<(), OutboxError> {
        self.set_state(event_id, EventState::Failed).await
    }

    async fn stalled_entries(
        &self,
        older_than: std::time::Duration,
        limit: u32,
    ) -> Result<Vec<OutboxEntry>, OutboxError> {
        let threshold = Utc::now() - older_than;

        let select = Query::select()
            .columns(ENTRY_COLUMNS)
            .from(EventOutbox::Table)
            .and_where(Expr::col(EventOutbox::State).is_in([
                EventState::NotPublished.as_str(),
                EventState::Failed.as_str(),
            ]))
            .and_where(Expr::col(EventOutbox::CreatedAt).lt(threshold))
            .order_by(EventOutbox::CreatedAt, Order::Asc)
            .limit(limit as u64)
            .to_string(PostgresQueryBuilder);

        let rows = sqlx::query(&select).fetch_all(&self.pool).await?;
        rows.iter().map(Self::entry_from_row).collect()
    }
}

/// Integration tests requiring a running PostgreSQL instance.
///
/// Run with: DATABASE_URL=postgres://localhost/caravel_test cargo test postgres_outbox -- --ignored
#[cfg(test)]
mod postgres_outbox {
    use super::*;
    use crate::event::IntegrationEvent;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct AppointmentCreated {
        appointment_id: u64,
    }

    impl IntegrationEvent for AppointmentCreated {
        const NAME: &'static str = "appointments.AppointmentCreated";
    }

    async fn store() -> PostgresOutboxStore {
        let url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/caravel_test".to_string());
        let pool = PgPool::connect(&url).await.expect("connect");
        let store = PostgresOutboxStore::new(pool);
        store.init().await.expect("init");
        store
    }

    #[tokio::test]
    #[ignore = "Requires PostgreSQL"]
    async fn rolled_back_transaction_leaves_no_entry() {
        let store = store().await;
        let transaction_id = Uuid::new_v4();
        let envelope = Envelope::new(&AppointmentCreated { appointment_id: 1 }).unwrap();

        let mut tx = store.pool.begin().await.unwrap();
        store.save(&envelope, &mut tx, transaction_id).await.unwrap();
        tx.rollback().await.unwrap();

        let pending = store.pending_for_transaction(transaction_id).await.unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    #[ignore = "Requires PostgreSQL"]
    async fn committed_entries_are_pending_in_order() {
        let store = store().await;
        let transaction_id = Uuid::new_v4();

        let first = Envelope::new(&AppointmentCreated { appointment_id: 1 }).unwrap();
        let second = Envelope::new(&AppointmentCreated { appointment_id: 2 }).unwrap();

        let mut tx = store.pool.begin().await.unwrap();
        store.save(&first, &mut tx, transaction_id).await.unwrap();
        store.save(&second, &mut tx, transaction_id).await.unwrap();
        tx.commit().await.unwrap();

        let pending = store.pending_for_transaction(transaction_id).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].event_id, first.id);
        assert_eq!(pending[1].event_id, second.id);
        assert!(pending.iter().all(|e| e.state == EventState::NotPublished));
    }

    #[tokio::test]
    #[ignore = "Requires PostgreSQL"]
    async fn state_transitions_and_times_sent() {
        let store = store().await;
        let transaction_id = Uuid::new_v4();
        let envelope = Envelope::new(&AppointmentCreated { appointment_id: 3 }).unwrap();

        let mut tx = store.pool.begin().await.unwrap();
        store.save(&envelope, &mut tx, transaction_id).await.unwrap();
        tx.commit().await.unwrap();

        store.mark_in_progress(envelope.id).await.unwrap();
        store.mark_published(envelope.id).await.unwrap();

        // Published entries are no longer pending
        let pending = store.pending_for_transaction(transaction_id).await.unwrap();
        assert!(pending.is_empty());

        let row = sqlx::query("SELECT state, times_sent FROM event_outbox WHERE event_id = $1")
            .bind(envelope.id)
            .fetch_one(&store.pool)
            .await
            .unwrap();
        let state: String = row.get("state");
        let times_sent: i32 = row.get("times_sent");
        assert_eq!(state, "Published");
        assert_eq!(times_sent, 1);

        assert!(matches!(
            store.mark_in_progress(Uuid::new_v4()).await,
            Err(OutboxError::NotFound(_))
        ));
    }

    #[tokio::test]
    #[ignore = "Requires PostgreSQL"]
    async fn failed_entries_show_up_as_stalled() {
        let store = store().await;
        let transaction_id = Uuid::new_v4();
        let envelope = Envelope::new(&AppointmentCreated { appointment_id: 4 }).unwrap();

        let mut tx = store.pool.begin().await.unwrap();
        store.save(&envelope, &mut tx, transaction_id).await.unwrap();
        tx.commit().await.unwrap();

        store.mark_in_progress(envelope.id).await.unwrap();
        store.mark_failed(envelope.id).await.unwrap();

        let stalled = store
            .stalled_entries(std::time::Duration::ZERO, 100)
            .await
            .unwrap();
        assert!(stalled.iter().any(|e| e.event_id == envelope.id));
    }
}

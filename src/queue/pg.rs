use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Double, Integer, Text};
use diesel_async::RunQueryDsl;
use tokio::time::{sleep, Instant};

use super::{Delivery, JobEnvelope, JobQueue, QueueResult};
use crate::db::schema::encoding_jobs;
use crate::db::DbPool;

// Timestamps are naive UTC, as written by the application.
const LEASE_SQL: &str = r#"
    UPDATE encoding_jobs
    SET locked_until = (NOW() AT TIME ZONE 'UTC') + make_interval(secs => $1),
        deliveries = deliveries + 1
    WHERE id = (
        SELECT id
        FROM encoding_jobs
        WHERE available_at <= (NOW() AT TIME ZONE 'UTC')
          AND (locked_until IS NULL OR locked_until < (NOW() AT TIME ZONE 'UTC'))
        ORDER BY id ASC
        LIMIT 1
        FOR UPDATE SKIP LOCKED
    )
    RETURNING id, payload, deliveries
"#;

const EXTEND_SQL: &str = r#"
    UPDATE encoding_jobs
    SET locked_until = (NOW() AT TIME ZONE 'UTC') + make_interval(secs => $1)
    WHERE id = $2
"#;

#[derive(QueryableByName)]
struct LeasedJob {
    #[diesel(sql_type = BigInt)]
    id: i64,
    #[diesel(sql_type = Text)]
    payload: String,
    #[diesel(sql_type = Integer)]
    deliveries: i32,
}

/// [`JobQueue`] stored in the `encoding_jobs` table.
///
/// Receiving leases a row for `visibility_timeout`; rows are deleted on ack.
#[derive(Clone)]
pub struct PgJobQueue {
    pool: DbPool,
    visibility_timeout: Duration,
    poll_interval: Duration,
}

impl PgJobQueue {
    pub fn new(pool: DbPool, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            visibility_timeout,
            poll_interval: Duration::from_millis(500),
        }
    }

    async fn try_lease(&self) -> QueueResult<Option<Delivery>> {
        loop {
            let conn = &mut self.pool.get().await?;
            let leased = diesel::sql_query(LEASE_SQL)
                .bind::<Double, _>(self.visibility_timeout.as_secs_f64())
                .get_result::<LeasedJob>(conn)
                .await
                .optional()?;
            let Some(row) = leased else {
                return Ok(None);
            };

            match JobEnvelope::from_payload(&row.payload) {
                Ok(envelope) => {
                    return Ok(Some(Delivery {
                        receipt: row.id,
                        deliveries: row.deliveries,
                        envelope,
                    }))
                }
                Err(err) => {
                    // Poison message: drop it so it cannot loop forever.
                    log::error!("discarding job {} with bad payload: {}", row.id, err);
                    diesel::delete(encoding_jobs::table.find(row.id))
                        .execute(conn)
                        .await?;
                }
            }
        }
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, envelope: JobEnvelope) -> QueueResult<i64> {
        let payload = envelope.to_payload()?;
        let conn = &mut self.pool.get().await?;
        let now = Utc::now().naive_utc();
        let id = diesel::insert_into(encoding_jobs::table)
            .values((
                encoding_jobs::payload.eq(payload),
                encoding_jobs::deliveries.eq(0),
                encoding_jobs::available_at.eq(now),
                encoding_jobs::created_at.eq(now),
            ))
            .returning(encoding_jobs::id)
            .get_result::<i64>(conn)
            .await?;
        log::debug!("enqueued job {} kind={}", id, envelope.kind());
        Ok(id)
    }

    async fn receive(&self, wait: Duration) -> QueueResult<Option<Delivery>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(delivery) = self.try_lease().await? {
                return Ok(Some(delivery));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        let conn = &mut self.pool.get().await?;
        diesel::delete(encoding_jobs::table.find(delivery.receipt))
            .execute(conn)
            .await?;
        Ok(())
    }

    async fn extend_lease(&self, delivery: &Delivery) -> QueueResult<()> {
        let conn = &mut self.pool.get().await?;
        let updated = diesel::sql_query(EXTEND_SQL)
            .bind::<Double, _>(self.visibility_timeout.as_secs_f64())
            .bind::<BigInt, _>(delivery.receipt)
            .execute(conn)
            .await?;
        if updated == 0 {
            log::warn!("job {} vanished while its lease was extended", delivery.receipt);
        }
        Ok(())
    }
}

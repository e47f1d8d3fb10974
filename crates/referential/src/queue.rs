//! Durable write-order queue.
//!
//! Orders are rows in the referential database: an order is written (and
//! synced) before any consumer can see it. Delivery is FIFO per bucket and
//! at-least-once: [`poll`](WriteOrderQueue::poll) only *looks* at the head of
//! a bucket, which stays there until it is acknowledged. A parked head blocks
//! its bucket until an operator requeues it, so later orders never overtake
//! it. A consumer that dies half-way simply sees the same order again next
//! time.

use crate::Database;
use crate::error::{ErrorKind, Result, map_constraint};
use crate::models::{NewWriteOrder, WriteOrder, WriteOrderRow, path_to_string};
use exn::ResultExt;
use reel_archive::ContainerId;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use time::UtcDateTime;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug)]
struct Shared {
    pool: SqlitePool,
    // Woken on every enqueue, requeue and on close.
    notify: Notify,
    closed: AtomicBool,
}

/// Cheap to clone; clones share wake-ups and the closed flag. Create one per process.
#[derive(Debug, Clone)]
pub struct WriteOrderQueue {
    shared: Arc<Shared>,
}
impl From<&Database> for WriteOrderQueue {
    fn from(db: &Database) -> Self {
        Self {
            shared: Arc::new(Shared { pool: db.pool().clone(), notify: Notify::new(), closed: AtomicBool::new(false) }),
        }
    }
}
impl WriteOrderQueue {
    fn pool(&self) -> &SqlitePool {
        &self.shared.pool
    }

    /// Durably append an order to the end of its bucket's queue.
    ///
    /// Fails with [`ErrorKind::AlreadyQueued`] if the container already has an
    /// outstanding order, and [`ErrorKind::NotFound`] if the referential doesn't
    /// know about the container.
    pub async fn enqueue(&self, order: &NewWriteOrder) -> Result<WriteOrder> {
        let id = order.container_id.as_str();
        let row: WriteOrderRow = sqlx::query_as(include_str!("../queries/enqueue_write_order.sql"))
            .bind(id)
            .bind(order.bucket.as_str())
            .bind(path_to_string(&order.source_path)?)
            .bind(UtcDateTime::now().unix_timestamp())
            .fetch_one(self.pool())
            .await
            .map_err(|err| map_constraint(err, id, ErrorKind::AlreadyQueued(id.to_string())))?;
        let order = WriteOrder::try_from(row)?;
        tracing::info!(container = %order.container_id, bucket = %order.bucket, sequence = order.sequence, "write order enqueued");
        self.shared.notify.notify_waiters();
        Ok(order)
    }

    /// The oldest unacknowledged order of `bucket`, waiting up to `wait` for one to appear.
    ///
    /// The order is not removed: it is delivered again until
    /// [`acknowledge`](Self::acknowledge)d. Nothing is delivered while the
    /// oldest order is [`park`](Self::park)ed.
    pub async fn poll(&self, bucket: &str, wait: Duration) -> Result<Option<WriteOrder>> {
        let deadline = Instant::now() + wait;
        loop {
            // Register interest before looking, so an enqueue in between isn't missed.
            let mut notified = std::pin::pin!(self.shared.notify.notified());
            notified.as_mut().enable();
            if self.is_closed() {
                exn::bail!(ErrorKind::Closed);
            }
            let row: Option<WriteOrderRow> = sqlx::query_as(include_str!("../queries/poll_write_order.sql"))
                .bind(bucket)
                .fetch_optional(self.pool())
                .await
                .or_raise(|| ErrorKind::Database)?;
            if let Some(row) = row {
                return Ok(Some(WriteOrder::try_from(row)?));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    /// Count one more delivery of an order, returning the new total.
    pub async fn record_attempt(&self, id: i64) -> Result<u32> {
        let attempts: Option<i64> = sqlx::query_scalar(include_str!("../queries/record_write_order_attempt.sql"))
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .or_raise(|| ErrorKind::Database)?;
        let Some(attempts) = attempts else {
            exn::bail!(ErrorKind::NotFound(format!("write order {id}")));
        };
        u32::try_from(attempts).or_raise(|| ErrorKind::InvalidData("attempts"))
    }

    /// Mark an order as done. Returns `false` if it had already been acknowledged.
    pub async fn acknowledge(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(include_str!("../queries/acknowledge_write_order.sql"))
            .bind(id)
            .bind(UtcDateTime::now().unix_timestamp())
            .execute(self.pool())
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected() > 0)
    }

    /// Stop delivering an order until it is requeued by an operator.
    pub async fn park(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(include_str!("../queries/park_write_order.sql"))
            .bind(id)
            .execute(self.pool())
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected() > 0)
    }

    /// Make a bucket's parked orders deliverable again, with a fresh attempt count.
    pub async fn requeue_parked(&self, bucket: &str) -> Result<u64> {
        let result = sqlx::query(include_str!("../queries/requeue_parked_write_orders.sql"))
            .bind(bucket)
            .execute(self.pool())
            .await
            .or_raise(|| ErrorKind::Database)?;
        let requeued = result.rows_affected();
        if requeued > 0 {
            tracing::info!(bucket, requeued, "parked write orders requeued");
            self.shared.notify.notify_waiters();
        }
        Ok(requeued)
    }

    /// Outstanding (pending or parked) orders, optionally for one bucket only.
    pub async fn pending(&self, bucket: Option<&str>) -> Result<Vec<WriteOrder>> {
        let rows: Vec<WriteOrderRow> = sqlx::query_as(include_str!("../queries/list_pending_write_orders.sql"))
            .bind(bucket)
            .fetch_all(self.pool())
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(WriteOrder::try_from).collect()
    }

    /// Every order ever enqueued for a container, acknowledged ones included.
    pub async fn find_for_container(&self, id: &ContainerId) -> Result<Vec<WriteOrder>> {
        let rows: Vec<WriteOrderRow> = sqlx::query_as(include_str!("../queries/list_write_orders_for_container.sql"))
            .bind(id.as_str())
            .fetch_all(self.pool())
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(WriteOrder::try_from).collect()
    }

    /// Refuse further polls and wake everyone currently waiting in one.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

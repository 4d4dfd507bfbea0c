//! Periodic compensation and retention sweeps.

use std::sync::Arc;

use chrono::Utc;
use store::TransactionLogStore;

use crate::compensation::CompensationService;
use crate::config::SchedulerConfig;
use crate::error::Result;

/// Counters from one compensation sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Rows matching the selection predicate.
    pub scanned: usize,

    /// Reverse writes applied this sweep.
    pub compensated: usize,

    /// Rows whose reverse write failed; they stay eligible.
    pub failed: usize,

    /// Rows another sweep resolved between selection and execution.
    pub skipped: usize,
}

/// Drives the compensation service on a fixed cadence.
///
/// Each tick runs one single-flight sweep over rows whose local write
/// committed, whose message rolled back, and whose last update is older
/// than the grace period. Log retention is a separate concern: callers
/// schedule [`purge_old_logs`](Self::purge_old_logs) at their own, much
/// lower, frequency.
pub struct CompensationScheduler {
    service: Arc<CompensationService>,
    txlog: Arc<dyn TransactionLogStore>,
    config: SchedulerConfig,
}

impl CompensationScheduler {
    pub fn new(
        service: Arc<CompensationService>,
        txlog: Arc<dyn TransactionLogStore>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            service,
            txlog,
            config,
        }
    }

    /// Runs sweeps forever at the configured interval.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match self.sweep_once().await {
                Ok(stats) if stats.scanned > 0 => {
                    tracing::info!(
                        scanned = stats.scanned,
                        compensated = stats.compensated,
                        failed = stats.failed,
                        skipped = stats.skipped,
                        "compensation sweep finished"
                    );
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::error!(%error, "compensation sweep failed");
                }
            }
        }
    }

    /// Runs one sweep over the currently eligible rows.
    pub async fn sweep_once(&self) -> Result<SweepStats> {
        let rows = self.txlog.needing_compensation(self.config.grace).await?;
        let mut stats = SweepStats {
            scanned: rows.len(),
            ..SweepStats::default()
        };

        for row in rows {
            match self.service.compensate(row.transaction_id).await {
                Ok(true) => stats.compensated += 1,
                Ok(false) => stats.skipped += 1,
                Err(error) => {
                    tracing::error!(
                        transaction_id = %row.transaction_id,
                        %error,
                        "compensation failed; row stays eligible"
                    );
                    stats.failed += 1;
                }
            }
        }

        metrics::gauge!("messaging_unresolved_rows")
            .set(self.service.unresolved_count().await? as f64);
        Ok(stats)
    }

    /// Deletes transaction log rows older than the retention window,
    /// regardless of their compensation state. Returns the number of rows
    /// deleted.
    pub async fn purge_old_logs(&self) -> Result<usize> {
        let cutoff = Utc::now() - self.config.retention;
        let deleted = self.txlog.purge_older_than(cutoff).await?;
        if deleted > 0 {
            tracing::info!(deleted, "purged expired transaction log rows");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use common::{ArticleId, TransactionId, UserId};
    use resources::InMemoryUserResource;
    use store::memory::{InMemoryOperationLogStore, InMemoryTransactionLogStore};
    use store::{LocalStatus, MessageStatus, TransactionLogRecord};

    struct Fixture {
        txlog: Arc<InMemoryTransactionLogStore>,
        user: Arc<InMemoryUserResource>,
        scheduler: CompensationScheduler,
    }

    fn fixture(grace: Duration) -> Fixture {
        let txlog = Arc::new(InMemoryTransactionLogStore::new());
        let oplog = Arc::new(InMemoryOperationLogStore::new());
        let user = Arc::new(InMemoryUserResource::new());
        user.insert_user(UserId::new(1), "alice", None);
        let service = Arc::new(CompensationService::new(
            txlog.clone(),
            oplog,
            user.clone(),
        ));
        let config = SchedulerConfig {
            grace,
            ..SchedulerConfig::default()
        };
        let scheduler = CompensationScheduler::new(service, txlog.clone(), config);
        Fixture {
            txlog,
            user,
            scheduler,
        }
    }

    async fn seed_trigger_row(f: &Fixture) -> TransactionId {
        let xid = TransactionId::new();
        f.txlog
            .insert(TransactionLogRecord::preparing(
                xid,
                "article-update",
                "update",
                serde_json::json!({}),
                UserId::new(1),
                ArticleId::new(5),
            ))
            .await
            .unwrap();
        f.txlog.update_local_status(xid, LocalStatus::Committed).await.unwrap();
        f.txlog.update_message_status(xid, MessageStatus::Rollback).await.unwrap();
        xid
    }

    #[tokio::test]
    async fn sweep_compensates_eligible_rows() {
        let f = fixture(Duration::zero());
        seed_trigger_row(&f).await;

        let stats = f.scheduler.sweep_once().await.unwrap();
        assert_eq!(stats.scanned, 1);
        assert_eq!(stats.compensated, 1);
        assert_eq!(f.user.restore_count(), 1);

        // Nothing left for the next sweep.
        let stats = f.scheduler.sweep_once().await.unwrap();
        assert_eq!(stats, SweepStats::default());
        assert_eq!(f.user.restore_count(), 1);
    }

    #[tokio::test]
    async fn grace_period_defers_fresh_rows() {
        let f = fixture(Duration::minutes(2));
        seed_trigger_row(&f).await;

        let stats = f.scheduler.sweep_once().await.unwrap();
        assert_eq!(stats.scanned, 0);
        assert_eq!(f.user.restore_count(), 0);
    }

    #[tokio::test]
    async fn failed_rows_stay_for_the_next_sweep() {
        let f = fixture(Duration::zero());
        seed_trigger_row(&f).await;
        f.user.set_fail_on_restore(true);

        let stats = f.scheduler.sweep_once().await.unwrap();
        assert_eq!(stats.failed, 1);

        f.user.set_fail_on_restore(false);
        let stats = f.scheduler.sweep_once().await.unwrap();
        assert_eq!(stats.compensated, 1);
    }

    #[tokio::test]
    async fn purge_respects_the_retention_window() {
        let f = fixture(Duration::zero());
        let old_xid = TransactionId::new();
        let mut old_row = TransactionLogRecord::preparing(
            old_xid,
            "article-update",
            "update",
            serde_json::json!({}),
            UserId::new(1),
            ArticleId::new(5),
        );
        old_row.created_time = Utc::now() - Duration::days(45);
        f.txlog.insert(old_row).await.unwrap();
        seed_trigger_row(&f).await;

        let deleted = f.scheduler.purge_old_logs().await.unwrap();
        assert_eq!(deleted, 1);
        assert!(f.txlog.get(old_xid).await.unwrap().is_none());
    }
}

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::leader::{LeaseStore, RECONCILER_LEASE};
use crate::reconciler::Reconciler;

/// Fires one reconciliation cycle per fixed interval. The only component with
/// a notion of "now"; everything below it takes the timestamp as an argument.
pub struct Scheduler {
    reconciler: Arc<Reconciler>,
    leases: Arc<dyn LeaseStore>,
    interval: Duration,
    holder: String,
}

impl Scheduler {
    pub fn new(reconciler: Arc<Reconciler>, leases: Arc<dyn LeaseStore>, interval: Duration) -> Self {
        Self {
            reconciler,
            leases,
            interval,
            holder: format!("reconciler-{}", Uuid::new_v4()),
        }
    }

    pub async fn run(&self) {
        let mut ticker = time::interval(self.interval);

        loop {
            ticker.tick().await;

            if let Err(e) = self.run_once().await {
                error!("reconciliation cycle failed: {:#}", e);
            }
        }
    }

    async fn run_once(&self) -> Result<()> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.interval)? * 2;

        if !self
            .leases
            .acquire(RECONCILER_LEASE, &self.holder, now, ttl)
            .await?
        {
            info!("reconciler lease held elsewhere, skipping cycle");
            return Ok(());
        }

        let outcome = self.reconciler.run_cycle(now).await;

        if let Err(e) = self
            .leases
            .release(RECONCILER_LEASE, &self.holder, Utc::now())
            .await
        {
            warn!("failed to release reconciler lease: {:#}", e);
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::{Reconciler, ReconcilerConfig};
    use crate::testing::{
        booking_fixture, FakeAlerts, FakeCarts, FakePartner, FakeRollbacks, MemLeases, MemStore,
    };
    use chrono::Duration as Span;
    use shared::PaymentStatus;

    fn scheduler_with(leases: Arc<MemLeases>) -> (Scheduler, Arc<MemStore>) {
        let store = Arc::new(MemStore::default());
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            Arc::new(FakePartner::default()),
            Arc::new(FakeRollbacks::default()),
            Arc::new(FakeCarts::default()),
            Arc::new(FakeAlerts::default()),
            ReconcilerConfig::default(),
        ));
        let scheduler = Scheduler::new(reconciler, leases, Duration::from_secs(300));
        (scheduler, store)
    }

    #[tokio::test]
    async fn skips_cycle_while_another_holder_has_the_lease() {
        let leases = Arc::new(MemLeases::default());
        leases.seize(
            RECONCILER_LEASE,
            "other-instance",
            Utc::now() + Span::minutes(10),
        );
        let (scheduler, store) = scheduler_with(leases.clone());
        let id = store.insert(booking_fixture(
            PaymentStatus::Initiated,
            Utc::now() - Span::minutes(45),
            Utc::now() - Span::minutes(45),
        ));

        scheduler.run_once().await.unwrap();

        assert_eq!(store.get(id).payment_status, "INITIATED");
        assert_eq!(
            leases.holder_of(RECONCILER_LEASE).as_deref(),
            Some("other-instance")
        );
    }

    #[tokio::test]
    async fn takes_over_an_expired_lease_and_releases_after_the_cycle() {
        let leases = Arc::new(MemLeases::default());
        leases.seize(
            RECONCILER_LEASE,
            "other-instance",
            Utc::now() - Span::minutes(1),
        );
        let (scheduler, store) = scheduler_with(leases.clone());
        let id = store.insert(booking_fixture(
            PaymentStatus::Initiated,
            Utc::now() - Span::minutes(45),
            Utc::now() - Span::minutes(45),
        ));

        scheduler.run_once().await.unwrap();

        assert_eq!(store.get(id).payment_status, "EXPIRED");
        // Released: any other instance can claim it immediately.
        assert!(leases
            .acquire(
                RECONCILER_LEASE,
                "third-instance",
                Utc::now() + Span::seconds(1),
                Span::minutes(10),
            )
            .await
            .unwrap());
    }
}

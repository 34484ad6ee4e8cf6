use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use shared::{can_transition, retry_backoff, DeadLetterAlert, PartnerBookingConfirmation, PaymentStatus};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::collaborators::{AlertSink, CartService, RollbackHandler};
use crate::models::{Booking, PartnerRetry};
use crate::partner::PartnerGateway;
use crate::store::BookingStore;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// How long an INITIATED booking may wait for gateway confirmation.
    pub abandoned_ttl: Duration,
    /// How long an AUTHORIZED booking may sit without a partner booking.
    pub stuck_window: Duration,
    pub expire_batch: i64,
    pub stuck_batch: i64,
    pub retry_batch: i64,
    pub max_attempts: i32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            abandoned_ttl: Duration::minutes(30),
            stuck_window: Duration::minutes(5),
            expire_batch: 50,
            stuck_batch: 20,
            retry_batch: 10,
            max_attempts: 3,
        }
    }
}

/// Drives divergent bookings back to a consistent terminal state. All writes
/// go through the store's conditional updates, so running concurrently with
/// the user-triggered verify flow is safe: losing a race is a no-op.
pub struct Reconciler {
    store: Arc<dyn BookingStore>,
    partner: Arc<dyn PartnerGateway>,
    rollbacks: Arc<dyn RollbackHandler>,
    carts: Arc<dyn CartService>,
    alerts: Arc<dyn AlertSink>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn BookingStore>,
        partner: Arc<dyn PartnerGateway>,
        rollbacks: Arc<dyn RollbackHandler>,
        carts: Arc<dyn CartService>,
        alerts: Arc<dyn AlertSink>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            partner,
            rollbacks,
            carts,
            alerts,
            config,
        }
    }

    /// One reconciliation cycle: expire abandoned bookings, recover stuck
    /// authorized ones, then drain due partner retries. `now` is injected so
    /// tests can drive the cycle with a fixed clock.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<()> {
        self.expire_abandoned(now).await?;
        self.process_stuck_authorized(now).await?;
        self.drain_retry_queue(now).await?;
        Ok(())
    }

    async fn expire_abandoned(&self, now: DateTime<Utc>) -> Result<()> {
        let cutoff = now - self.config.abandoned_ttl;
        let batch = self
            .store
            .abandoned_initiated(cutoff, self.config.expire_batch)
            .await?;

        for booking in &batch {
            if let Err(e) = self.expire_one(booking).await {
                error!("failed to expire booking {}: {:#}", booking.id, e);
            }
        }

        Ok(())
    }

    async fn expire_one(&self, booking: &Booking) -> Result<()> {
        let current = booking.payment_status()?;
        if !can_transition(current, PaymentStatus::Expired) {
            warn!(
                "booking {} in {} cannot expire, skipping",
                booking.id, current
            );
            return Ok(());
        }

        let updated = self
            .store
            .transition(booking.id, current, PaymentStatus::Expired)
            .await?;
        if updated == 0 {
            debug!("booking {} already left {}, nothing to expire", booking.id, current);
            return Ok(());
        }

        info!("expired abandoned booking {}", booking.id);
        if let Err(e) = self.rollbacks.rollback_reserved(booking).await {
            error!(
                "failed to roll back reserved resources for booking {}: {:#}",
                booking.id, e
            );
        }

        Ok(())
    }

    async fn process_stuck_authorized(&self, now: DateTime<Utc>) -> Result<()> {
        let cutoff = now - self.config.stuck_window;
        let batch = self
            .store
            .stuck_authorized(cutoff, self.config.stuck_batch)
            .await?;

        for booking in &batch {
            if let Err(e) = self.process_stuck_one(booking, now).await {
                error!("failed to process stuck booking {}: {:#}", booking.id, e);
            }
        }

        Ok(())
    }

    async fn process_stuck_one(&self, booking: &Booking, now: DateTime<Utc>) -> Result<()> {
        let from = booking.payment_status()?;

        match self.partner.create_booking(booking).await {
            Ok(confirmation) => self.promote_confirmed(booking, from, &confirmation).await,
            Err(e) => {
                warn!(
                    "partner booking failed for stuck booking {}: {}",
                    booking.id, e
                );
                let first_retry_at = now + retry_backoff(0);
                let updated = self
                    .store
                    .mark_partner_failed(
                        booking.id,
                        from,
                        &e.to_string(),
                        first_retry_at,
                        self.config.max_attempts,
                    )
                    .await?;
                if updated == 0 {
                    debug!("booking {} already left {}, not queueing retry", booking.id, from);
                }
                Ok(())
            }
        }
    }

    async fn drain_retry_queue(&self, now: DateTime<Utc>) -> Result<()> {
        let due = self.store.due_retries(now, self.config.retry_batch).await?;

        for (entry, booking) in &due {
            if let Err(e) = self.process_retry(entry, booking, now).await {
                error!(
                    "failed to process partner retry for booking {}: {:#}",
                    entry.booking_id, e
                );
            }
        }

        Ok(())
    }

    async fn process_retry(
        &self,
        entry: &PartnerRetry,
        booking: &Booking,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let from = booking.payment_status()?;

        if entry.is_exhausted() {
            return self.dead_letter(entry, booking, from, now).await;
        }

        match self.partner.create_booking(booking).await {
            Ok(confirmation) => self.promote_confirmed(booking, from, &confirmation).await,
            Err(e) => {
                let attempts = entry.attempts + 1;
                let next_retry_at = now + retry_backoff(attempts);
                warn!(
                    "partner retry {}/{} failed for booking {}: {}",
                    attempts, entry.max_attempts, booking.id, e
                );
                self.store
                    .bump_retry(entry.booking_id, &e.to_string(), next_retry_at)
                    .await
            }
        }
    }

    async fn dead_letter(
        &self,
        entry: &PartnerRetry,
        booking: &Booking,
        from: PaymentStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.alerts
            .booking_dead_lettered(DeadLetterAlert {
                booking_id: entry.booking_id,
                attempts: entry.attempts,
                last_error: entry.last_error.clone(),
                raised_at: now,
            })
            .await;

        // Best-effort: the booking should visibly read "money taken, service
        // not delivered" while it awaits manual action.
        if can_transition(from, PaymentStatus::Refunded) {
            match self
                .store
                .transition(booking.id, from, PaymentStatus::Refunded)
                .await
            {
                Ok(0) => debug!("booking {} already left {}", booking.id, from),
                Ok(_) => info!("booking {} marked REFUNDED pending manual action", booking.id),
                Err(e) => error!(
                    "failed to mark booking {} refunded: {:#}",
                    booking.id, e
                ),
            }
        }

        self.store.delete_retry(entry.booking_id).await
    }

    async fn promote_confirmed(
        &self,
        booking: &Booking,
        from: PaymentStatus,
        confirmation: &PartnerBookingConfirmation,
    ) -> Result<()> {
        let updated = self
            .store
            .confirm_booking(booking.id, from, &confirmation.partner_booking_id)
            .await?;
        if updated == 0 {
            debug!(
                "booking {} already left {}, partner booking {} not recorded",
                booking.id, from, confirmation.partner_booking_id
            );
            return Ok(());
        }

        info!(
            "confirmed booking {} with partner booking {}",
            booking.id, confirmation.partner_booking_id
        );
        if let Err(e) = self.carts.clear_cart(booking.user_id).await {
            warn!("failed to clear cart for user {}: {:#}", booking.user_id, e);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        booking_fixture, FakeAlerts, FakeCarts, FakePartner, FakeRollbacks, MemStore,
    };
    use shared::RETRY_BACKOFF_SECS;
    use uuid::Uuid;

    struct Harness {
        store: Arc<MemStore>,
        partner: Arc<FakePartner>,
        rollbacks: Arc<FakeRollbacks>,
        carts: Arc<FakeCarts>,
        alerts: Arc<FakeAlerts>,
        reconciler: Reconciler,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemStore::default());
        let partner = Arc::new(FakePartner::default());
        let rollbacks = Arc::new(FakeRollbacks::default());
        let carts = Arc::new(FakeCarts::default());
        let alerts = Arc::new(FakeAlerts::default());
        let reconciler = Reconciler::new(
            store.clone(),
            partner.clone(),
            rollbacks.clone(),
            carts.clone(),
            alerts.clone(),
            ReconcilerConfig::default(),
        );
        Harness {
            store,
            partner,
            rollbacks,
            carts,
            alerts,
            reconciler,
        }
    }

    fn now() -> DateTime<Utc> {
        "2026-08-18T12:00:00Z".parse().unwrap()
    }

    #[tokio::test]
    async fn abandoned_booking_is_expired_and_rolled_back() {
        let h = harness();
        let id = h.store.insert(booking_fixture(
            PaymentStatus::Initiated,
            now() - Duration::minutes(45),
            now() - Duration::minutes(45),
        ));

        h.reconciler.run_cycle(now()).await.unwrap();

        let booking = h.store.get(id);
        assert_eq!(booking.payment_status, "EXPIRED");
        assert_eq!(h.rollbacks.calls(), vec![id]);
    }

    #[tokio::test]
    async fn ttl_boundary_leaves_younger_bookings_alone() {
        let h = harness();
        let young = h.store.insert(booking_fixture(
            PaymentStatus::Initiated,
            now() - Duration::minutes(29),
            now() - Duration::minutes(29),
        ));
        let old = h.store.insert(booking_fixture(
            PaymentStatus::Initiated,
            now() - Duration::minutes(31),
            now() - Duration::minutes(31),
        ));

        h.reconciler.run_cycle(now()).await.unwrap();

        assert_eq!(h.store.get(young).payment_status, "INITIATED");
        assert_eq!(h.store.get(old).payment_status, "EXPIRED");
        assert_eq!(h.rollbacks.calls(), vec![old]);
    }

    #[tokio::test]
    async fn stuck_authorized_booking_is_confirmed_on_partner_success() {
        let h = harness();
        h.partner.succeed_with("PB-123");
        let id = h.store.insert(booking_fixture(
            PaymentStatus::Authorized,
            now() - Duration::minutes(20),
            now() - Duration::minutes(10),
        ));

        h.reconciler.run_cycle(now()).await.unwrap();

        let booking = h.store.get(id);
        assert_eq!(booking.payment_status, "CONFIRMED");
        assert_eq!(booking.partner_booking_id.as_deref(), Some("PB-123"));
        assert_eq!(booking.status, "Order Booked");
        assert_eq!(h.carts.cleared(), vec![booking.user_id]);
    }

    #[tokio::test]
    async fn recently_touched_authorized_booking_is_not_stuck() {
        let h = harness();
        h.partner.succeed_with("PB-1");
        let id = h.store.insert(booking_fixture(
            PaymentStatus::Authorized,
            now() - Duration::minutes(20),
            now() - Duration::minutes(3),
        ));

        h.reconciler.run_cycle(now()).await.unwrap();

        assert_eq!(h.store.get(id).payment_status, "AUTHORIZED");
        assert!(h.partner.calls().is_empty());
    }

    #[tokio::test]
    async fn partner_failure_demotes_and_queues_first_retry() {
        let h = harness();
        h.partner.fail_with("partner unavailable");
        let id = h.store.insert(booking_fixture(
            PaymentStatus::Authorized,
            now() - Duration::minutes(20),
            now() - Duration::minutes(10),
        ));

        h.reconciler.run_cycle(now()).await.unwrap();

        let booking = h.store.get(id);
        assert_eq!(booking.payment_status, "PARTNER_FAILED");
        assert!(booking.partner_error.as_deref().unwrap().contains("partner unavailable"));

        let entry = h.store.retry(id).unwrap();
        assert_eq!(entry.attempts, 0);
        assert_eq!(entry.max_attempts, 3);
        assert_eq!(
            entry.next_retry_at,
            now() + Duration::seconds(RETRY_BACKOFF_SECS[0])
        );
    }

    #[tokio::test]
    async fn backoff_grows_per_failure_and_plateaus() {
        let h = harness();
        h.partner.fail_with("still down");
        let id = h.store.insert(booking_fixture(
            PaymentStatus::Authorized,
            now() - Duration::minutes(20),
            now() - Duration::minutes(10),
        ));

        // First failure queues the entry at +60s.
        let mut at = now();
        h.reconciler.run_cycle(at).await.unwrap();
        assert_eq!(
            h.store.retry(id).unwrap().next_retry_at,
            at + Duration::seconds(60)
        );

        // Each subsequent failure walks the schedule: 300s, 900s, then stays.
        for expected in [300, 900, 900] {
            at = h.store.retry(id).unwrap().next_retry_at;
            h.reconciler.run_cycle(at).await.unwrap();
            let entry = h.store.retry(id).unwrap();
            assert_eq!(entry.next_retry_at, at + Duration::seconds(expected));
        }
        assert_eq!(h.store.retry(id).unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn due_retry_success_confirms_and_clears_entry() {
        let h = harness();
        h.partner.fail_with("flaky");
        let id = h.store.insert(booking_fixture(
            PaymentStatus::Authorized,
            now() - Duration::minutes(20),
            now() - Duration::minutes(10),
        ));

        h.reconciler.run_cycle(now()).await.unwrap();
        assert!(h.store.retry(id).is_some());

        h.partner.succeed_with("PB-777");
        let later = now() + Duration::seconds(61);
        h.reconciler.run_cycle(later).await.unwrap();

        let booking = h.store.get(id);
        assert_eq!(booking.payment_status, "CONFIRMED");
        assert_eq!(booking.partner_booking_id.as_deref(), Some("PB-777"));
        assert!(h.store.retry(id).is_none());
        assert_eq!(h.carts.cleared(), vec![booking.user_id]);
    }

    #[tokio::test]
    async fn exhausted_retry_dead_letters_exactly_once() {
        let h = harness();
        h.partner.fail_with("permanent outage");
        let id = h.store.insert(booking_fixture(
            PaymentStatus::Authorized,
            now() - Duration::minutes(20),
            now() - Duration::minutes(10),
        ));

        // Drive the entry to exhaustion: enqueue, then three failed retries.
        let mut at = now();
        h.reconciler.run_cycle(at).await.unwrap();
        for _ in 0..3 {
            at = h.store.retry(id).unwrap().next_retry_at;
            h.reconciler.run_cycle(at).await.unwrap();
        }
        assert_eq!(h.store.retry(id).unwrap().attempts, 3);
        assert!(h.alerts.raised().is_empty());

        // Next due cycle dead-letters.
        at = h.store.retry(id).unwrap().next_retry_at;
        h.reconciler.run_cycle(at).await.unwrap();

        let booking = h.store.get(id);
        assert_eq!(booking.payment_status, "REFUNDED");
        assert!(h.store.retry(id).is_none());
        let alerts = h.alerts.raised();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].booking_id, id);
        assert_eq!(alerts[0].attempts, 3);
        assert!(alerts[0].last_error.contains("permanent outage"));

        // Re-running finds no entry and takes no further action.
        let writes = h.store.write_count();
        h.reconciler.run_cycle(at + Duration::minutes(5)).await.unwrap();
        assert_eq!(h.store.write_count(), writes);
        assert_eq!(h.alerts.raised().len(), 1);
    }

    #[tokio::test]
    async fn cycle_is_idempotent_when_nothing_qualifies() {
        let h = harness();
        h.partner.succeed_with("PB-9");
        h.store.insert(booking_fixture(
            PaymentStatus::Initiated,
            now() - Duration::minutes(45),
            now() - Duration::minutes(45),
        ));
        h.store.insert(booking_fixture(
            PaymentStatus::Authorized,
            now() - Duration::minutes(20),
            now() - Duration::minutes(10),
        ));

        h.reconciler.run_cycle(now()).await.unwrap();
        let writes = h.store.write_count();
        let alerts = h.alerts.raised().len();

        h.reconciler.run_cycle(now()).await.unwrap();

        assert_eq!(h.store.write_count(), writes);
        assert_eq!(h.alerts.raised().len(), alerts);
    }

    #[tokio::test]
    async fn losing_the_confirmation_race_is_a_no_op() {
        let h = harness();
        let id = h.store.insert(booking_fixture(
            PaymentStatus::Authorized,
            now() - Duration::minutes(20),
            now() - Duration::minutes(10),
        ));

        // Two writers attempt AUTHORIZED -> CONFIRMED; exactly one lands.
        let first = h
            .store
            .confirm_booking(id, PaymentStatus::Authorized, "PB-A")
            .await
            .unwrap();
        let second = h
            .store
            .confirm_booking(id, PaymentStatus::Authorized, "PB-B")
            .await
            .unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 0);
        assert_eq!(h.store.get(id).partner_booking_id.as_deref(), Some("PB-A"));
    }

    #[tokio::test]
    async fn store_rejects_out_of_table_transitions() {
        let h = harness();
        let id = h.store.insert(booking_fixture(
            PaymentStatus::Confirmed,
            now() - Duration::minutes(45),
            now() - Duration::minutes(45),
        ));

        let err = h
            .store
            .transition(id, PaymentStatus::Confirmed, PaymentStatus::Expired)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid payment status transition"));
        assert_eq!(h.store.get(id).payment_status, "CONFIRMED");
    }

    #[tokio::test]
    async fn expirer_skips_booking_that_cannot_expire() {
        let h = harness();
        // A booking whose state changed after selection; the guard skips it.
        let booking = booking_fixture(
            PaymentStatus::Confirmed,
            now() - Duration::minutes(45),
            now() - Duration::minutes(45),
        );
        let id = booking.id;
        h.store.insert(booking.clone());

        h.reconciler.expire_one(&booking).await.unwrap();

        assert_eq!(h.store.get(id).payment_status, "CONFIRMED");
        assert!(h.rollbacks.calls().is_empty());
    }

    #[tokio::test]
    async fn one_bad_item_does_not_block_the_batch() {
        let h = harness();
        let bad = h.store.insert(booking_fixture(
            PaymentStatus::Initiated,
            now() - Duration::minutes(50),
            now() - Duration::minutes(50),
        ));
        let good = h.store.insert(booking_fixture(
            PaymentStatus::Initiated,
            now() - Duration::minutes(40),
            now() - Duration::minutes(40),
        ));
        h.store.fail_writes_for(bad);

        h.reconciler.run_cycle(now()).await.unwrap();

        assert_eq!(h.store.get(bad).payment_status, "INITIATED");
        assert_eq!(h.store.get(good).payment_status, "EXPIRED");
        assert_eq!(h.rollbacks.calls(), vec![good]);
    }

    #[tokio::test]
    async fn retry_for_unrelated_booking_id_is_isolated() {
        let h = harness();
        h.partner.succeed_with("PB-OK");
        let missing = Uuid::new_v4();
        h.store.insert_retry_orphan(missing, now() - Duration::seconds(1));
        let id = h.store.insert(booking_fixture(
            PaymentStatus::Authorized,
            now() - Duration::minutes(20),
            now() - Duration::minutes(10),
        ));

        h.reconciler.run_cycle(now()).await.unwrap();

        assert_eq!(h.store.get(id).payment_status, "CONFIRMED");
    }
}

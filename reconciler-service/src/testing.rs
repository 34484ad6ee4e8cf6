//! In-memory doubles for the store, lease, and collaborator ports. They keep
//! the same conditional-update semantics as the Postgres implementations so
//! the scans can be exercised with a pinned clock and no database.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use shared::{assert_transition, DeadLetterAlert, PartnerBookingConfirmation, PaymentStatus, STATUS_ORDER_BOOKED};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use uuid::Uuid;

use crate::collaborators::{AlertSink, CartService, RollbackHandler};
use crate::leader::LeaseStore;
use crate::models::{Booking, PartnerRetry};
use crate::partner::{PartnerError, PartnerGateway};
use crate::store::BookingStore;

pub fn booking_fixture(
    status: PaymentStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
) -> Booking {
    Booking {
        id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        total_amount: BigDecimal::from(1499),
        slot_date: NaiveDate::from_ymd_opt(2026, 8, 20).unwrap(),
        slot_time: "07:00-08:00".to_string(),
        payment_status: status.as_str().to_string(),
        status: "Payment Pending".to_string(),
        partner_booking_id: None,
        partner_error: None,
        created_at,
        updated_at,
    }
}

#[derive(Default)]
pub struct MemStore {
    bookings: Mutex<HashMap<Uuid, Booking>>,
    retries: Mutex<HashMap<Uuid, PartnerRetry>>,
    writes: Mutex<usize>,
    failing: Mutex<HashSet<Uuid>>,
}

impl MemStore {
    pub fn insert(&self, booking: Booking) -> Uuid {
        let id = booking.id;
        self.bookings.lock().unwrap().insert(id, booking);
        id
    }

    pub fn get(&self, id: Uuid) -> Booking {
        self.bookings.lock().unwrap().get(&id).cloned().unwrap()
    }

    pub fn retry(&self, booking_id: Uuid) -> Option<PartnerRetry> {
        self.retries.lock().unwrap().get(&booking_id).cloned()
    }

    /// Mutating writes that actually changed a row, across all tables.
    pub fn write_count(&self) -> usize {
        *self.writes.lock().unwrap()
    }

    /// Injects a store failure for every write touching the given booking.
    pub fn fail_writes_for(&self, booking_id: Uuid) {
        self.failing.lock().unwrap().insert(booking_id);
    }

    /// A retry entry whose booking row is gone; the join must skip it.
    pub fn insert_retry_orphan(&self, booking_id: Uuid, due: DateTime<Utc>) {
        self.retries.lock().unwrap().insert(
            booking_id,
            PartnerRetry {
                booking_id,
                attempts: 0,
                max_attempts: 3,
                next_retry_at: due,
                last_error: "orphaned".to_string(),
                created_at: due - Duration::minutes(1),
                updated_at: due - Duration::minutes(1),
            },
        );
    }

    fn check_injected(&self, booking_id: Uuid) -> Result<()> {
        if self.failing.lock().unwrap().contains(&booking_id) {
            return Err(anyhow!("injected store failure for booking {booking_id}"));
        }
        Ok(())
    }

    fn record_write(&self) {
        *self.writes.lock().unwrap() += 1;
    }
}

#[async_trait]
impl BookingStore for MemStore {
    async fn abandoned_initiated(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<Booking>> {
        let bookings = self.bookings.lock().unwrap();
        let mut batch: Vec<Booking> = bookings
            .values()
            .filter(|b| b.payment_status == PaymentStatus::Initiated.as_str())
            .filter(|b| b.created_at < cutoff)
            .cloned()
            .collect();
        batch.sort_by_key(|b| b.created_at);
        batch.truncate(limit as usize);
        Ok(batch)
    }

    async fn stuck_authorized(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<Booking>> {
        let bookings = self.bookings.lock().unwrap();
        let mut batch: Vec<Booking> = bookings
            .values()
            .filter(|b| b.payment_status == PaymentStatus::Authorized.as_str())
            .filter(|b| b.partner_booking_id.is_none())
            .filter(|b| b.updated_at < cutoff)
            .cloned()
            .collect();
        batch.sort_by_key(|b| b.updated_at);
        batch.truncate(limit as usize);
        Ok(batch)
    }

    async fn due_retries(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<(PartnerRetry, Booking)>> {
        let retries = self.retries.lock().unwrap();
        let bookings = self.bookings.lock().unwrap();
        let mut batch: Vec<(PartnerRetry, Booking)> = retries
            .values()
            .filter(|r| r.next_retry_at <= now)
            .filter_map(|r| bookings.get(&r.booking_id).map(|b| (r.clone(), b.clone())))
            .collect();
        batch.sort_by_key(|(r, _)| r.next_retry_at);
        batch.truncate(limit as usize);
        Ok(batch)
    }

    async fn transition(
        &self,
        booking_id: Uuid,
        from: PaymentStatus,
        to: PaymentStatus,
    ) -> Result<usize> {
        assert_transition(from, to)?;
        self.check_injected(booking_id)?;

        let moved = {
            let mut bookings = self.bookings.lock().unwrap();
            match bookings.get_mut(&booking_id) {
                Some(b) if b.payment_status == from.as_str() => {
                    b.payment_status = to.as_str().to_string();
                    b.updated_at = Utc::now();
                    true
                }
                _ => false,
            }
        };
        if moved {
            self.record_write();
        }
        Ok(usize::from(moved))
    }

    async fn confirm_booking(
        &self,
        booking_id: Uuid,
        from: PaymentStatus,
        partner_booking_id: &str,
    ) -> Result<usize> {
        assert_transition(from, PaymentStatus::Confirmed)?;
        self.check_injected(booking_id)?;

        let moved = {
            let mut bookings = self.bookings.lock().unwrap();
            match bookings.get_mut(&booking_id) {
                Some(b) if b.payment_status == from.as_str() => {
                    b.payment_status = PaymentStatus::Confirmed.as_str().to_string();
                    b.partner_booking_id = Some(partner_booking_id.to_string());
                    b.status = STATUS_ORDER_BOOKED.to_string();
                    b.partner_error = None;
                    b.updated_at = Utc::now();
                    true
                }
                _ => false,
            }
        };
        if moved {
            self.record_write();
            if self.retries.lock().unwrap().remove(&booking_id).is_some() {
                self.record_write();
            }
        }
        Ok(usize::from(moved))
    }

    async fn mark_partner_failed(
        &self,
        booking_id: Uuid,
        from: PaymentStatus,
        error: &str,
        first_retry_at: DateTime<Utc>,
        max_attempts: i32,
    ) -> Result<usize> {
        assert_transition(from, PaymentStatus::PartnerFailed)?;
        self.check_injected(booking_id)?;

        let moved = {
            let mut bookings = self.bookings.lock().unwrap();
            match bookings.get_mut(&booking_id) {
                Some(b) if b.payment_status == from.as_str() => {
                    b.payment_status = PaymentStatus::PartnerFailed.as_str().to_string();
                    b.partner_error = Some(error.to_string());
                    b.updated_at = Utc::now();
                    true
                }
                _ => false,
            }
        };
        if moved {
            self.record_write();
            let queued = {
                let mut retries = self.retries.lock().unwrap();
                if retries.contains_key(&booking_id) {
                    false
                } else {
                    retries.insert(
                        booking_id,
                        PartnerRetry {
                            booking_id,
                            attempts: 0,
                            max_attempts,
                            next_retry_at: first_retry_at,
                            last_error: error.to_string(),
                            created_at: Utc::now(),
                            updated_at: Utc::now(),
                        },
                    );
                    true
                }
            };
            if queued {
                self.record_write();
            }
        }
        Ok(usize::from(moved))
    }

    async fn bump_retry(
        &self,
        booking_id: Uuid,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<()> {
        self.check_injected(booking_id)?;

        let bumped = {
            let mut retries = self.retries.lock().unwrap();
            match retries.get_mut(&booking_id) {
                Some(entry) => {
                    entry.attempts += 1;
                    entry.last_error = error.to_string();
                    entry.next_retry_at = next_retry_at;
                    entry.updated_at = Utc::now();
                    true
                }
                None => false,
            }
        };
        if bumped {
            self.record_write();
        }
        Ok(())
    }

    async fn delete_retry(&self, booking_id: Uuid) -> Result<()> {
        self.check_injected(booking_id)?;

        if self.retries.lock().unwrap().remove(&booking_id).is_some() {
            self.record_write();
        }
        Ok(())
    }
}

enum PartnerScript {
    Succeed(String),
    Fail(String),
}

pub struct FakePartner {
    script: Mutex<PartnerScript>,
    calls: Mutex<Vec<Uuid>>,
}

impl Default for FakePartner {
    fn default() -> Self {
        Self {
            script: Mutex::new(PartnerScript::Fail("partner unavailable".to_string())),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl FakePartner {
    pub fn succeed_with(&self, partner_booking_id: &str) {
        *self.script.lock().unwrap() = PartnerScript::Succeed(partner_booking_id.to_string());
    }

    pub fn fail_with(&self, message: &str) {
        *self.script.lock().unwrap() = PartnerScript::Fail(message.to_string());
    }

    pub fn calls(&self) -> Vec<Uuid> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PartnerGateway for FakePartner {
    async fn create_booking(
        &self,
        booking: &Booking,
    ) -> Result<PartnerBookingConfirmation, PartnerError> {
        self.calls.lock().unwrap().push(booking.id);
        match &*self.script.lock().unwrap() {
            PartnerScript::Succeed(id) => Ok(PartnerBookingConfirmation {
                partner_booking_id: id.clone(),
            }),
            PartnerScript::Fail(message) => Err(PartnerError::Rejected {
                status: 503,
                body: message.clone(),
            }),
        }
    }
}

#[derive(Default)]
pub struct FakeRollbacks {
    calls: Mutex<Vec<Uuid>>,
}

impl FakeRollbacks {
    pub fn calls(&self) -> Vec<Uuid> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RollbackHandler for FakeRollbacks {
    async fn rollback_reserved(&self, booking: &Booking) -> Result<()> {
        self.calls.lock().unwrap().push(booking.id);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeCarts {
    cleared: Mutex<Vec<Uuid>>,
}

impl FakeCarts {
    pub fn cleared(&self) -> Vec<Uuid> {
        self.cleared.lock().unwrap().clone()
    }
}

#[async_trait]
impl CartService for FakeCarts {
    async fn clear_cart(&self, user_id: Uuid) -> Result<()> {
        self.cleared.lock().unwrap().push(user_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeAlerts {
    raised: Mutex<Vec<DeadLetterAlert>>,
}

impl FakeAlerts {
    pub fn raised(&self) -> Vec<DeadLetterAlert> {
        self.raised.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertSink for FakeAlerts {
    async fn booking_dead_lettered(&self, alert: DeadLetterAlert) {
        self.raised.lock().unwrap().push(alert);
    }
}

#[derive(Default)]
pub struct MemLeases {
    leases: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
}

impl MemLeases {
    pub fn seize(&self, name: &str, holder: &str, expires_at: DateTime<Utc>) {
        self.leases
            .lock()
            .unwrap()
            .insert(name.to_string(), (holder.to_string(), expires_at));
    }

    pub fn holder_of(&self, name: &str) -> Option<String> {
        self.leases
            .lock()
            .unwrap()
            .get(name)
            .map(|(holder, _)| holder.clone())
    }
}

#[async_trait]
impl LeaseStore for MemLeases {
    async fn acquire(
        &self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool> {
        let mut leases = self.leases.lock().unwrap();
        let free = match leases.get(name) {
            Some((current, expires_at)) => *expires_at < now || current == holder,
            None => true,
        };
        if free {
            leases.insert(name.to_string(), (holder.to_string(), now + ttl));
        }
        Ok(free)
    }

    async fn release(&self, name: &str, holder: &str, now: DateTime<Utc>) -> Result<()> {
        let mut leases = self.leases.lock().unwrap();
        if let Some((current, expires_at)) = leases.get_mut(name) {
            if current == holder {
                *expires_at = now;
            }
        }
        Ok(())
    }
}

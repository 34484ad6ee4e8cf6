use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use shared::{assert_transition, PaymentStatus, STATUS_ORDER_BOOKED};
use uuid::Uuid;

use crate::models::{Booking, NewPartnerRetry, PartnerRetry};
use crate::schema::{bookings, partner_retries};

pub type DbPool = Pool<AsyncPgConnection>;

/// Persistence port for the reconciler. Every payment-status mutation goes
/// through a conditional update: the write carries a predicate on the expected
/// current state and reports how many rows it touched. Zero rows means another
/// writer won the race and the caller treats it as a no-op.
#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn abandoned_initiated(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<Booking>>;

    async fn stuck_authorized(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<Booking>>;

    async fn due_retries(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<(PartnerRetry, Booking)>>;

    async fn transition(
        &self,
        booking_id: Uuid,
        from: PaymentStatus,
        to: PaymentStatus,
    ) -> Result<usize>;

    async fn confirm_booking(
        &self,
        booking_id: Uuid,
        from: PaymentStatus,
        partner_booking_id: &str,
    ) -> Result<usize>;

    async fn mark_partner_failed(
        &self,
        booking_id: Uuid,
        from: PaymentStatus,
        error: &str,
        first_retry_at: DateTime<Utc>,
        max_attempts: i32,
    ) -> Result<usize>;

    async fn bump_retry(
        &self,
        booking_id: Uuid,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn delete_retry(&self, booking_id: Uuid) -> Result<()>;
}

pub struct PgBookingStore {
    pool: DbPool,
}

impl PgBookingStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BookingStore for PgBookingStore {
    async fn abandoned_initiated(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<Booking>> {
        let mut conn = self.pool.get().await?;

        let batch = bookings::table
            .filter(bookings::payment_status.eq(PaymentStatus::Initiated.as_str()))
            .filter(bookings::created_at.lt(cutoff))
            .order(bookings::created_at.asc())
            .limit(limit)
            .load::<Booking>(&mut conn)
            .await?;

        Ok(batch)
    }

    async fn stuck_authorized(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<Booking>> {
        let mut conn = self.pool.get().await?;

        let batch = bookings::table
            .filter(bookings::payment_status.eq(PaymentStatus::Authorized.as_str()))
            .filter(bookings::partner_booking_id.is_null())
            .filter(bookings::updated_at.lt(cutoff))
            .order(bookings::updated_at.asc())
            .limit(limit)
            .load::<Booking>(&mut conn)
            .await?;

        Ok(batch)
    }

    async fn due_retries(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<(PartnerRetry, Booking)>> {
        let mut conn = self.pool.get().await?;

        let batch = partner_retries::table
            .inner_join(bookings::table)
            .filter(partner_retries::next_retry_at.le(now))
            .order(partner_retries::next_retry_at.asc())
            .limit(limit)
            .load::<(PartnerRetry, Booking)>(&mut conn)
            .await?;

        Ok(batch)
    }

    async fn transition(
        &self,
        booking_id: Uuid,
        from: PaymentStatus,
        to: PaymentStatus,
    ) -> Result<usize> {
        assert_transition(from, to)?;
        let mut conn = self.pool.get().await?;

        let updated = diesel::update(
            bookings::table
                .filter(bookings::id.eq(booking_id))
                .filter(bookings::payment_status.eq(from.as_str())),
        )
        .set((
            bookings::payment_status.eq(to.as_str()),
            bookings::updated_at.eq(diesel::dsl::now),
        ))
        .execute(&mut conn)
        .await?;

        Ok(updated)
    }

    async fn confirm_booking(
        &self,
        booking_id: Uuid,
        from: PaymentStatus,
        partner_booking_id: &str,
    ) -> Result<usize> {
        assert_transition(from, PaymentStatus::Confirmed)?;
        let mut conn = self.pool.get().await?;
        let partner_booking_id = partner_booking_id.to_string();

        let updated = conn
            .transaction::<_, anyhow::Error, _>(|conn| {
                Box::pin(async move {
                    let updated = diesel::update(
                        bookings::table
                            .filter(bookings::id.eq(booking_id))
                            .filter(bookings::payment_status.eq(from.as_str())),
                    )
                    .set((
                        bookings::payment_status.eq(PaymentStatus::Confirmed.as_str()),
                        bookings::partner_booking_id.eq(Some(partner_booking_id)),
                        bookings::status.eq(STATUS_ORDER_BOOKED),
                        bookings::partner_error.eq(None::<String>),
                        bookings::updated_at.eq(diesel::dsl::now),
                    ))
                    .execute(conn)
                    .await?;

                    if updated > 0 {
                        diesel::delete(
                            partner_retries::table
                                .filter(partner_retries::booking_id.eq(booking_id)),
                        )
                        .execute(conn)
                        .await?;
                    }

                    Ok(updated)
                })
            })
            .await?;

        Ok(updated)
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
        let mut conn = self.pool.get().await?;
        let error = error.to_string();

        let updated = conn
            .transaction::<_, anyhow::Error, _>(|conn| {
                Box::pin(async move {
                    let updated = diesel::update(
                        bookings::table
                            .filter(bookings::id.eq(booking_id))
                            .filter(bookings::payment_status.eq(from.as_str())),
                    )
                    .set((
                        bookings::payment_status.eq(PaymentStatus::PartnerFailed.as_str()),
                        bookings::partner_error.eq(Some(error.clone())),
                        bookings::updated_at.eq(diesel::dsl::now),
                    ))
                    .execute(conn)
                    .await?;

                    if updated > 0 {
                        // An existing entry keeps its attempt count; never
                        // double-queue a booking.
                        let entry = NewPartnerRetry {
                            booking_id,
                            attempts: 0,
                            max_attempts,
                            next_retry_at: first_retry_at,
                            last_error: error,
                        };
                        diesel::insert_into(partner_retries::table)
                            .values(&entry)
                            .on_conflict(partner_retries::booking_id)
                            .do_nothing()
                            .execute(conn)
                            .await?;
                    }

                    Ok(updated)
                })
            })
            .await?;

        Ok(updated)
    }

    async fn bump_retry(
        &self,
        booking_id: Uuid,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.pool.get().await?;

        diesel::update(partner_retries::table.filter(partner_retries::booking_id.eq(booking_id)))
            .set((
                partner_retries::attempts.eq(partner_retries::attempts + 1),
                partner_retries::last_error.eq(error),
                partner_retries::next_retry_at.eq(next_retry_at),
                partner_retries::updated_at.eq(diesel::dsl::now),
            ))
            .execute(&mut conn)
            .await?;

        Ok(())
    }

    async fn delete_retry(&self, booking_id: Uuid) -> Result<()> {
        let mut conn = self.pool.get().await?;

        diesel::delete(partner_retries::table.filter(partner_retries::booking_id.eq(booking_id)))
            .execute(&mut conn)
            .await?;

        Ok(())
    }
}

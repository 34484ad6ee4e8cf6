use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;

use crate::schema::reconciler_leases;
use crate::store::DbPool;

pub const RECONCILER_LEASE: &str = "reconciler";

/// Store-backed, time-bounded lease. At most one holder at a time; a crashed
/// holder frees the lease by letting it expire.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn acquire(
        &self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool>;

    async fn release(&self, name: &str, holder: &str, now: DateTime<Utc>) -> Result<()>;
}

pub struct PgLeaseStore {
    pool: DbPool,
}

impl PgLeaseStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeaseStore for PgLeaseStore {
    async fn acquire(
        &self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool> {
        use diesel::query_dsl::methods::FilterDsl;

        let mut conn = self.pool.get().await?;
        let expires_at = now + ttl;

        // Upsert guarded on the existing row: the update only lands when the
        // lease has expired or we already hold it. Zero rows means another
        // live holder owns it.
        let claimed = diesel::insert_into(reconciler_leases::table)
            .values((
                reconciler_leases::name.eq(name),
                reconciler_leases::holder.eq(holder),
                reconciler_leases::expires_at.eq(expires_at),
            ))
            .on_conflict(reconciler_leases::name)
            .do_update()
            .set((
                reconciler_leases::holder.eq(holder),
                reconciler_leases::expires_at.eq(expires_at),
            ))
            .filter(
                reconciler_leases::expires_at
                    .lt(now)
                    .or(reconciler_leases::holder.eq(holder)),
            )
            .execute(&mut conn)
            .await?;

        Ok(claimed > 0)
    }

    async fn release(&self, name: &str, holder: &str, now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.pool.get().await?;

        diesel::update(
            reconciler_leases::table
                .filter(reconciler_leases::name.eq(name))
                .filter(reconciler_leases::holder.eq(holder)),
        )
        .set(reconciler_leases::expires_at.eq(now))
        .execute(&mut conn)
        .await?;

        Ok(())
    }
}

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use shared::{PartnerBookingRequest, PaymentStatus, UnknownStatus};
use uuid::Uuid;

#[derive(Debug, Clone, Queryable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::bookings)]
pub struct Booking {
    pub id: Uuid,
    pub user_id: Uuid,
    pub total_amount: BigDecimal,
    pub slot_date: NaiveDate,
    pub slot_time: String,
    pub payment_status: String,
    pub status: String,
    pub partner_booking_id: Option<String>,
    pub partner_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn payment_status(&self) -> Result<PaymentStatus, UnknownStatus> {
        PaymentStatus::parse(&self.payment_status)
    }

    pub fn partner_request(&self) -> PartnerBookingRequest {
        PartnerBookingRequest {
            booking_id: self.id,
            user_id: self.user_id,
            slot_date: self.slot_date,
            slot_time: self.slot_time.clone(),
            amount: self.total_amount.clone(),
        }
    }
}

#[derive(Debug, Clone, Queryable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::partner_retries)]
pub struct PartnerRetry {
    pub booking_id: Uuid,
    pub attempts: i32,
    pub max_attempts: i32,
    pub next_retry_at: DateTime<Utc>,
    pub last_error: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PartnerRetry {
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::partner_retries)]
pub struct NewPartnerRetry {
    pub booking_id: Uuid,
    pub attempts: i32,
    pub max_attempts: i32,
    pub next_retry_at: DateTime<Utc>,
    pub last_error: String,
}

use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Payment lifecycle of a booking. Every persisted value of
/// `bookings.payment_status` is the canonical string form of one variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Initiated,
    Authorized,
    Paid,
    PartnerFailed,
    Confirmed,
    Failed,
    Cancelled,
    Expired,
    Refunded,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid payment status transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: PaymentStatus,
    pub to: PaymentStatus,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown payment status: {0}")]
pub struct UnknownStatus(pub String);

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Initiated => "INITIATED",
            PaymentStatus::Authorized => "AUTHORIZED",
            PaymentStatus::Paid => "PAID",
            PaymentStatus::PartnerFailed => "PARTNER_FAILED",
            PaymentStatus::Confirmed => "CONFIRMED",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Cancelled => "CANCELLED",
            PaymentStatus::Expired => "EXPIRED",
            PaymentStatus::Refunded => "REFUNDED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, UnknownStatus> {
        match s {
            "INITIATED" => Ok(PaymentStatus::Initiated),
            "AUTHORIZED" => Ok(PaymentStatus::Authorized),
            "PAID" => Ok(PaymentStatus::Paid),
            "PARTNER_FAILED" => Ok(PaymentStatus::PartnerFailed),
            "CONFIRMED" => Ok(PaymentStatus::Confirmed),
            "FAILED" => Ok(PaymentStatus::Failed),
            "CANCELLED" => Ok(PaymentStatus::Cancelled),
            "EXPIRED" => Ok(PaymentStatus::Expired),
            "REFUNDED" => Ok(PaymentStatus::Refunded),
            other => Err(UnknownStatus(other.to_string())),
        }
    }

    /// States this status may legally move to. The single source of truth;
    /// no other module hard-codes a transition.
    pub fn allowed_transitions(&self) -> &'static [PaymentStatus] {
        match self {
            PaymentStatus::Initiated => &[
                PaymentStatus::Authorized,
                PaymentStatus::Failed,
                PaymentStatus::Expired,
                PaymentStatus::Paid,
            ],
            PaymentStatus::Authorized => {
                &[PaymentStatus::Confirmed, PaymentStatus::PartnerFailed]
            }
            PaymentStatus::Paid => &[PaymentStatus::Confirmed, PaymentStatus::PartnerFailed],
            PaymentStatus::PartnerFailed => {
                &[PaymentStatus::Confirmed, PaymentStatus::Refunded]
            }
            PaymentStatus::Confirmed
            | PaymentStatus::Failed
            | PaymentStatus::Cancelled
            | PaymentStatus::Expired
            | PaymentStatus::Refunded => &[],
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.allowed_transitions().is_empty()
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn can_transition(from: PaymentStatus, to: PaymentStatus) -> bool {
    from.allowed_transitions().contains(&to)
}

pub fn assert_transition(from: PaymentStatus, to: PaymentStatus) -> Result<(), InvalidTransition> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(InvalidTransition { from, to })
    }
}

/// Human-facing fulfillment label written on successful partner booking.
pub const STATUS_ORDER_BOOKED: &str = "Order Booked";

/// Delay before retry attempt N+1, indexed by the attempt count recorded so
/// far. Plateaus at the last entry.
pub const RETRY_BACKOFF_SECS: [i64; 3] = [60, 300, 900];

pub fn retry_backoff(attempts: i32) -> Duration {
    let idx = attempts.clamp(0, RETRY_BACKOFF_SECS.len() as i32 - 1) as usize;
    Duration::seconds(RETRY_BACKOFF_SECS[idx])
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartnerBookingRequest {
    pub booking_id: Uuid,
    pub user_id: Uuid,
    pub slot_date: NaiveDate,
    pub slot_time: String,
    pub amount: BigDecimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartnerBookingConfirmation {
    pub partner_booking_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterAlert {
    pub booking_id: Uuid,
    pub attempts: i32,
    pub last_error: String,
    pub raised_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [PaymentStatus; 9] = [
        PaymentStatus::Initiated,
        PaymentStatus::Authorized,
        PaymentStatus::Paid,
        PaymentStatus::PartnerFailed,
        PaymentStatus::Confirmed,
        PaymentStatus::Failed,
        PaymentStatus::Cancelled,
        PaymentStatus::Expired,
        PaymentStatus::Refunded,
    ];

    #[test]
    fn status_strings_round_trip() {
        for status in ALL {
            assert_eq!(PaymentStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(PaymentStatus::parse("BOGUS").is_err());
    }

    #[test]
    fn transition_table_matches_allow_list() {
        use PaymentStatus::*;

        let allowed: &[(PaymentStatus, PaymentStatus)] = &[
            (Initiated, Authorized),
            (Initiated, Failed),
            (Initiated, Expired),
            (Initiated, Paid),
            (Authorized, Confirmed),
            (Authorized, PartnerFailed),
            (Paid, Confirmed),
            (Paid, PartnerFailed),
            (PartnerFailed, Confirmed),
            (PartnerFailed, Refunded),
        ];

        for from in ALL {
            for to in ALL {
                let expected = allowed.contains(&(from, to));
                assert_eq!(
                    can_transition(from, to),
                    expected,
                    "{from} -> {to} should be {expected}"
                );
            }
        }
    }

    #[test]
    fn terminal_states_admit_nothing() {
        use PaymentStatus::*;

        for status in [Confirmed, Failed, Cancelled, Expired, Refunded] {
            assert!(status.is_terminal());
            for to in ALL {
                assert!(assert_transition(status, to).is_err());
            }
        }
        for status in [Initiated, Authorized, Paid, PartnerFailed] {
            assert!(!status.is_terminal());
        }
    }

    #[test]
    fn assert_transition_reports_the_pair() {
        let err = assert_transition(PaymentStatus::Confirmed, PaymentStatus::Refunded)
            .unwrap_err();
        assert_eq!(err.from, PaymentStatus::Confirmed);
        assert_eq!(err.to, PaymentStatus::Refunded);
    }

    #[test]
    fn backoff_is_monotone_and_plateaus() {
        assert_eq!(retry_backoff(0), Duration::seconds(60));
        assert_eq!(retry_backoff(1), Duration::seconds(300));
        assert_eq!(retry_backoff(2), Duration::seconds(900));
        assert_eq!(retry_backoff(3), Duration::seconds(900));
        assert_eq!(retry_backoff(10), Duration::seconds(900));
        assert_eq!(retry_backoff(-1), Duration::seconds(60));
    }
}

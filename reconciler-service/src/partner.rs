use async_trait::async_trait;
use shared::PartnerBookingConfirmation;
use std::time::Duration;

use crate::models::Booking;

#[derive(Debug, thiserror::Error)]
pub enum PartnerError {
    #[error("partner api request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("partner api rejected booking ({status}): {body}")]
    Rejected { status: u16, body: String },
}

/// Fulfillment partner's booking-creation API. Creation is made idempotent on
/// the partner side by a deterministic key derived from the booking id, so a
/// retry after a lost response cannot create a second partner booking.
#[async_trait]
pub trait PartnerGateway: Send + Sync {
    async fn create_booking(
        &self,
        booking: &Booking,
    ) -> Result<PartnerBookingConfirmation, PartnerError>;
}

pub struct HttpPartnerGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPartnerGateway {
    pub fn new(base_url: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client, base_url })
    }
}

#[async_trait]
impl PartnerGateway for HttpPartnerGateway {
    async fn create_booking(
        &self,
        booking: &Booking,
    ) -> Result<PartnerBookingConfirmation, PartnerError> {
        let response = self
            .client
            .post(format!("{}/v1/bookings", self.base_url))
            .header("Idempotency-Key", format!("booking-{}", booking.id))
            .json(&booking.partner_request())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PartnerError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json::<PartnerBookingConfirmation>().await?)
    }
}

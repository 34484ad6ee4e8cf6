use anyhow::Result;
use async_trait::async_trait;
use reqwest::StatusCode;
use shared::DeadLetterAlert;
use std::time::Duration;
use tracing::error;
use uuid::Uuid;

use crate::models::Booking;

/// Releases any wallet hold or promo reservation tied to an expired booking.
/// Best-effort: "nothing to roll back" is success.
#[async_trait]
pub trait RollbackHandler: Send + Sync {
    async fn rollback_reserved(&self, booking: &Booking) -> Result<()>;
}

#[async_trait]
pub trait CartService: Send + Sync {
    async fn clear_cart(&self, user_id: Uuid) -> Result<()>;
}

/// Fire-and-forget operator notification. Delivery failure must never block
/// the dead-letter transition, so implementations swallow their own errors.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn booking_dead_lettered(&self, alert: DeadLetterAlert);
}

/// Client for the core application's internal endpoints, which own the
/// wallet/promo ledgers and the cart.
pub struct CoreAppClient {
    client: reqwest::Client,
    base_url: String,
}

impl CoreAppClient {
    pub fn new(base_url: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, base_url })
    }
}

#[async_trait]
impl RollbackHandler for CoreAppClient {
    async fn rollback_reserved(&self, booking: &Booking) -> Result<()> {
        let response = self
            .client
            .post(format!(
                "{}/internal/bookings/{}/release-holds",
                self.base_url, booking.id
            ))
            .send()
            .await?;

        // Nothing reserved for this booking.
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }

        response.error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl CartService for CoreAppClient {
    async fn clear_cart(&self, user_id: Uuid) -> Result<()> {
        self.client
            .delete(format!("{}/internal/carts/{}", self.base_url, user_id))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

pub struct WebhookAlerts {
    client: reqwest::Client,
    webhook_url: Option<String>,
}

impl WebhookAlerts {
    pub fn new(webhook_url: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            webhook_url,
        })
    }
}

#[async_trait]
impl AlertSink for WebhookAlerts {
    async fn booking_dead_lettered(&self, alert: DeadLetterAlert) {
        error!(
            "DEAD LETTER: booking {} exhausted {} partner attempts, last error: {}",
            alert.booking_id, alert.attempts, alert.last_error
        );

        let Some(url) = &self.webhook_url else {
            return;
        };

        let payload = serde_json::json!({
            "kind": "booking_dead_lettered",
            "booking_id": alert.booking_id,
            "attempts": alert.attempts,
            "last_error": alert.last_error,
            "raised_at": alert.raised_at,
        });

        if let Err(e) = self.client.post(url).json(&payload).send().await {
            error!("failed to deliver dead-letter alert for booking {}: {}", alert.booking_id, e);
        }
    }
}

use async_trait::async_trait;
use tracing::info;

use crate::domain::{FundingRequestedEvent, OrderCompletedEvent};
use crate::error::Result;
use crate::persistence::NotificationSink;

/// Notification sink that only logs.
///
/// The real push transport is an external collaborator; deployments without
/// one (and every test) use this sink. Notifications are best-effort by
/// contract, so a log line is a valid delivery.
#[derive(Default)]
pub struct LoggingNotificationSink;

impl LoggingNotificationSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NotificationSink for LoggingNotificationSink {
    async fn notify_funding_request(&self, event: &FundingRequestedEvent) -> Result<()> {
        info!(
            "Funding requested: {} {} on {}",
            event.amount, event.reserve_ticker, event.exchange_name
        );
        Ok(())
    }

    async fn notify_order_completed(&self, event: &OrderCompletedEvent) -> Result<()> {
        info!(
            "Order {} completed for payment {}: {}/{} filled on {}",
            event.order_id,
            event.payment_id,
            event.filled_quote_qty,
            event.requested_quote_qty,
            event.exchange_name
        );
        Ok(())
    }
}

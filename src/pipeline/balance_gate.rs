//! Balance admission gate
//!
//! Decides whether an exchange holds enough of its reserve asset before an
//! order is committed. Shortfalls fail the admission check and trigger a
//! funding request; low balances pass but request funds in the background.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::BalanceGateConfig;
use crate::domain::FundingRequestedEvent;
use crate::error::{CoinvestError, Result};
use crate::exchange::{Balance, ExchangeRegistry};
use crate::persistence::{cache_get, cache_set, CacheStore};
use crate::pipeline::funding::FundingHandle;
use crate::resilience::{ResilienceExecutor, ResiliencePolicy};
use crate::validation::{validate_amount, validate_exchange_name, validate_ticker};

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AdmissionDecision {
    /// Balance comfortably covers the required amount
    Granted,
    /// Balance covers the amount but sits below the low-balance floor;
    /// a background funding request was queued
    GrantedLowBalance,
    /// Balance does not cover the amount; a funding request for the
    /// shortfall plus buffer was queued
    Insufficient { shortfall: Decimal },
}

impl AdmissionDecision {
    pub fn is_granted(&self) -> bool {
        !matches!(self, AdmissionDecision::Insufficient { .. })
    }
}

pub struct BalanceAdmissionGate {
    registry: Arc<ExchangeRegistry>,
    cache: Arc<dyn CacheStore>,
    funding: FundingHandle,
    executor: Arc<ResilienceExecutor>,
    config: BalanceGateConfig,
    balance_policy: ResiliencePolicy,
    /// Bumped when a fill consumes balance; stale cached decisions for the
    /// (exchange, ticker) pair become unreachable under the new epoch.
    decision_epochs: DashMap<String, AtomicU64>,
}

impl BalanceAdmissionGate {
    pub fn new(
        registry: Arc<ExchangeRegistry>,
        cache: Arc<dyn CacheStore>,
        funding: FundingHandle,
        executor: Arc<ResilienceExecutor>,
        config: BalanceGateConfig,
    ) -> Self {
        Self {
            registry,
            cache,
            funding,
            executor,
            config,
            balance_policy: ResiliencePolicy::exchange_api("exchange.get_balance"),
            decision_epochs: DashMap::new(),
        }
    }

    /// Check whether `exchange_name` holds enough `reserve_ticker` to cover
    /// `required`.
    pub async fn check(
        &self,
        exchange_name: &str,
        reserve_ticker: &str,
        required: Decimal,
    ) -> Result<AdmissionDecision> {
        // Validation failures are terminal, so no I/O happens before them.
        validate_exchange_name(exchange_name)?;
        validate_ticker(reserve_ticker)?;
        validate_amount(required, "required")?;

        let epoch = self.epoch(exchange_name, reserve_ticker);
        let decision_key = Self::decision_key(exchange_name, reserve_ticker, required, epoch);
        if let Some(decision) =
            cache_get::<AdmissionDecision>(self.cache.as_ref(), &decision_key).await
        {
            debug!(
                "Admission decision for {} {} on {} served from cache",
                required, reserve_ticker, exchange_name
            );
            return Ok(decision);
        }

        let available = self.available_balance(exchange_name, reserve_ticker).await?;
        let buffer = required * self.config.safety_buffer_pct;

        if available < required {
            let shortfall = required - available;
            warn!(
                "Insufficient {} on {}: required {}, available {} (shortfall {})",
                reserve_ticker, exchange_name, required, available, shortfall
            );

            // Request enough to cover the gap and the safety buffer; the
            // request must be on the queue before the failure is returned.
            self.funding
                .request(FundingRequestedEvent {
                    exchange_name: exchange_name.to_string(),
                    reserve_ticker: reserve_ticker.to_string(),
                    amount: shortfall + buffer,
                    requested_at: Utc::now(),
                })
                .await;

            let decision = AdmissionDecision::Insufficient { shortfall };
            cache_set(
                self.cache.as_ref(),
                &decision_key,
                &decision,
                Duration::from_secs(self.config.insufficient_ttl_secs),
            )
            .await;
            return Ok(decision);
        }

        if available < required * self.config.low_balance_factor {
            debug!(
                "Low {} balance on {}: available {} below {}x of {}",
                reserve_ticker,
                exchange_name,
                available,
                self.config.low_balance_factor,
                required
            );
            // Top up in the background so future checks stay above the floor
            self.funding.request_background(FundingRequestedEvent {
                exchange_name: exchange_name.to_string(),
                reserve_ticker: reserve_ticker.to_string(),
                amount: required,
                requested_at: Utc::now(),
            });
            return Ok(AdmissionDecision::GrantedLowBalance);
        }

        let decision = AdmissionDecision::Granted;
        cache_set(
            self.cache.as_ref(),
            &decision_key,
            &decision,
            Duration::from_secs(self.config.granted_ttl_secs),
        )
        .await;
        Ok(decision)
    }

    /// Available balance, cached briefly so allocation loops do not hammer
    /// the exchange.
    async fn available_balance(&self, exchange_name: &str, ticker: &str) -> Result<Decimal> {
        let key = format!("balance:{exchange_name}:{ticker}");
        if let Some(available) = cache_get::<Decimal>(self.cache.as_ref(), &key).await {
            return Ok(available);
        }

        let client = self.registry.get(exchange_name)?;
        let ticker_owned = ticker.to_string();
        let balance: Balance = self
            .executor
            .execute(&self.balance_policy, || {
                let client = client.clone();
                let ticker = ticker_owned.clone();
                async move { client.get_balance(&ticker).await }
            })
            .await
            .map_err(CoinvestError::from)?;

        cache_set(
            self.cache.as_ref(),
            &key,
            &balance.available,
            Duration::from_secs(self.config.balance_ttl_secs),
        )
        .await;
        Ok(balance.available)
    }

    /// Invalidate the cached balance and admission decisions for an
    /// exchange, e.g. after a fill consumed part of the balance.
    pub async fn invalidate_balance(&self, exchange_name: &str, ticker: &str) {
        self.cache
            .invalidate(&format!("balance:{exchange_name}:{ticker}"))
            .await;
        self.decision_epochs
            .entry(Self::epoch_key(exchange_name, ticker))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    fn epoch(&self, exchange_name: &str, ticker: &str) -> u64 {
        self.decision_epochs
            .get(&Self::epoch_key(exchange_name, ticker))
            .map(|e| e.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn epoch_key(exchange_name: &str, ticker: &str) -> String {
        format!("{exchange_name}:{ticker}")
    }

    fn decision_key(exchange_name: &str, ticker: &str, required: Decimal, epoch: u64) -> String {
        let rounded = required.round_dp_with_strategy(0, RoundingStrategy::AwayFromZero);
        format!("admission:{exchange_name}:{ticker}:{rounded}:{epoch}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn decision_key_rounds_amount() {
        assert_eq!(
            BalanceAdmissionGate::decision_key("binance", "EUR", dec!(49.7), 0),
            BalanceAdmissionGate::decision_key("binance", "EUR", dec!(50), 0),
        );
        assert_ne!(
            BalanceAdmissionGate::decision_key("binance", "EUR", dec!(50), 0),
            BalanceAdmissionGate::decision_key("binance", "EUR", dec!(80), 0),
        );
        assert_ne!(
            BalanceAdmissionGate::decision_key("binance", "EUR", dec!(50), 0),
            BalanceAdmissionGate::decision_key("binance", "EUR", dec!(50), 1),
        );
    }

    #[test]
    fn insufficient_is_not_granted() {
        assert!(AdmissionDecision::Granted.is_granted());
        assert!(AdmissionDecision::GrantedLowBalance.is_granted());
        assert!(!AdmissionDecision::Insufficient {
            shortfall: dec!(10)
        }
        .is_granted());
    }
}

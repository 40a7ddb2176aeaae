use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A percentage of a payment's net amount earmarked for a specific asset.
///
/// Belongs to a subscription; the sum of a subscription's allocation percents
/// is expected to be at most 100 but is not enforced here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    pub asset_id: Uuid,
    /// Exchange ticker of the asset (e.g. "BTC")
    pub ticker: String,
    /// Name of the exchange configured for this asset
    pub exchange_name: String,
    /// Share of the payment in percent, expected in (0, 100]
    pub percent: Decimal,
}

impl Allocation {
    /// Quote quantity this allocation targets for a given net payment amount.
    ///
    /// Rounded to 2 decimal places toward zero so the sum of targets never
    /// exceeds the net amount.
    pub fn target_quantity(&self, net_amount: Decimal) -> Decimal {
        (net_amount * self.percent / Decimal::from(100))
            .round_dp_with_strategy(2, RoundingStrategy::ToZero)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn allocation(percent: Decimal) -> Allocation {
        Allocation {
            asset_id: Uuid::new_v4(),
            ticker: "BTC".to_string(),
            exchange_name: "binance".to_string(),
            percent,
        }
    }

    #[test]
    fn target_rounds_toward_zero() {
        // 99.99 * 33.33% = 33.326667 -> 33.32, never 33.33
        assert_eq!(allocation(dec!(33.33)).target_quantity(dec!(99.99)), dec!(33.32));
        assert_eq!(allocation(dec!(60)).target_quantity(dec!(100)), dec!(60.00));
        assert_eq!(allocation(dec!(40)).target_quantity(dec!(100)), dec!(40.00));
    }

    #[test]
    fn targets_never_exceed_net_amount() {
        let allocations = [
            allocation(dec!(33.33)),
            allocation(dec!(33.33)),
            allocation(dec!(33.34)),
        ];
        let net = dec!(10.01);
        let total: Decimal = allocations.iter().map(|a| a.target_quantity(net)).sum();
        assert!(total <= net, "sum {} exceeds net {}", total, net);
    }
}

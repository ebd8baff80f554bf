//! Deterministic rate computation.
//!
//! For fixed inputs and a fixed rate table the output is bit-identical.
//! All arithmetic stays in full-precision decimal; nothing here rounds.

use crate::config::PricingConfig;
use crate::domain::{RateCard, TokenAmount};
use crate::error::{BrokerError, Result};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;

/// One pricing request against a concrete GPU allocation.
#[derive(Debug, Clone)]
pub struct PriceRequest {
    pub gpu_model: String,
    pub requested_vram_mb: u64,
    pub total_vram_mb: u64,
    pub estimated_power_w: u32,
    pub duration_hours: Decimal,
    /// Per-provider base-rate overrides, keyed by GPU model.
    pub provider_rates: Option<HashMap<String, Decimal>>,
    /// Percentage off every rate component.
    pub user_discount_percent: Option<Decimal>,
}

/// The engine's answer. Rates are the frozen inputs to a session.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceQuote {
    pub gpu_model: String,
    pub base_hourly: Decimal,
    pub vram_hourly: Decimal,
    pub power_hourly: Decimal,
    pub total_hourly: Decimal,
    pub total_cost: TokenAmount,
    pub platform_fee: TokenAmount,
    pub provider_earnings: TokenAmount,
    pub vram_percentage: Decimal,
    pub computed_at: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    /// Per-unit rates to freeze into the session record.
    pub rate_card: RateCard,
}

pub struct PricingEngine {
    config: PricingConfig,
}

impl PricingEngine {
    pub fn new(config: PricingConfig) -> Self {
        Self { config }
    }

    pub fn quote(&self, request: &PriceRequest) -> Result<PriceQuote> {
        self.validate(request)?;

        let base_rate = request
            .provider_rates
            .as_ref()
            .and_then(|rates| rates.get(&request.gpu_model).copied())
            .or_else(|| self.config.base_rates.get(&request.gpu_model).copied())
            .ok_or_else(|| {
                BrokerError::validation(
                    "gpu_model",
                    format!("'{}' is not in the rate table", request.gpu_model),
                )
            })?;

        let discount_factor = match request.user_discount_percent {
            Some(percent) => (dec!(100) - percent) / dec!(100),
            None => Decimal::ONE,
        };

        let base_hourly = base_rate * discount_factor;
        let vram_per_gb_hour = self.config.vram_rate_per_gb * discount_factor;
        let power_per_kw_hour = self.config.power_rate_per_kw * discount_factor;

        let vram_gb = Decimal::from(request.requested_vram_mb) / dec!(1024);
        let power_kw = Decimal::from(request.estimated_power_w) / dec!(1000);

        let vram_hourly = vram_per_gb_hour * vram_gb;
        let power_hourly = power_per_kw_hour * power_kw;
        let total_hourly = base_hourly + vram_hourly + power_hourly;

        let total_cost = TokenAmount::from_decimal(total_hourly * request.duration_hours);
        let platform_fee =
            total_cost.multiply(self.config.platform_fee_percent / dec!(100));
        let provider_earnings = total_cost.saturating_sub(platform_fee);

        let vram_percentage = Decimal::from(request.requested_vram_mb)
            / Decimal::from(request.total_vram_mb)
            * dec!(100);

        let computed_at = Utc::now();
        Ok(PriceQuote {
            gpu_model: request.gpu_model.clone(),
            base_hourly,
            vram_hourly,
            power_hourly,
            total_hourly,
            total_cost,
            platform_fee,
            provider_earnings,
            vram_percentage,
            computed_at,
            valid_until: computed_at
                + Duration::seconds(self.config.quote_validity_seconds as i64),
            rate_card: RateCard {
                base_hourly,
                vram_per_gb_hour,
                power_per_kw_hour,
                platform_fee_percent: self.config.platform_fee_percent,
            },
        })
    }

    fn validate(&self, request: &PriceRequest) -> Result<()> {
        if request.total_vram_mb == 0 {
            return Err(BrokerError::validation("total_vram_mb", "must be positive"));
        }
        if request.requested_vram_mb > request.total_vram_mb {
            return Err(BrokerError::validation(
                "requested_vram_mb",
                format!(
                    "{} MB exceeds device capacity of {} MB",
                    request.requested_vram_mb, request.total_vram_mb
                ),
            ));
        }
        if request.estimated_power_w == 0 {
            return Err(BrokerError::validation(
                "estimated_power_w",
                "must be positive",
            ));
        }
        if request.duration_hours <= Decimal::ZERO {
            return Err(BrokerError::validation("duration_hours", "must be positive"));
        }
        if let Some(percent) = request.user_discount_percent {
            if percent < Decimal::ZERO || percent > dec!(100) {
                return Err(BrokerError::validation(
                    "user_discount_percent",
                    "must be within 0..=100",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use pretty_assertions::assert_eq;

    fn engine() -> PricingEngine {
        PricingEngine::new(BrokerConfig::default().pricing)
    }

    fn request() -> PriceRequest {
        PriceRequest {
            gpu_model: "RTX 4090".to_string(),
            requested_vram_mb: 24_576,
            total_vram_mb: 24_576,
            estimated_power_w: 450,
            duration_hours: Decimal::ONE,
            provider_rates: None,
            user_discount_percent: None,
        }
    }

    #[test]
    fn test_one_hour_quote_composition() {
        // base 0.5 + vram 0.02*24 + power 1.0*0.45 = 1.43
        let quote = engine().quote(&request()).unwrap();
        assert_eq!(quote.base_hourly, dec!(0.5));
        assert_eq!(quote.vram_hourly, dec!(0.48));
        assert_eq!(quote.power_hourly, dec!(0.450));
        assert_eq!(quote.total_hourly, dec!(1.430));
        assert_eq!(quote.total_cost.as_decimal(), dec!(1.430));
        assert_eq!(quote.platform_fee.as_decimal(), dec!(0.07150));
        assert_eq!(quote.provider_earnings.as_decimal(), dec!(1.35850));
        assert_eq!(quote.vram_percentage, dec!(100));
    }

    #[test]
    fn test_quotes_are_deterministic() {
        let engine = engine();
        let a = engine.quote(&request()).unwrap();
        let b = engine.quote(&request()).unwrap();
        assert_eq!(a.total_hourly, b.total_hourly);
        assert_eq!(a.total_cost, b.total_cost);
        assert_eq!(a.rate_card, b.rate_card);
    }

    #[test]
    fn test_provider_override_replaces_base_rate() {
        let mut req = request();
        req.provider_rates = Some(HashMap::from([("RTX 4090".to_string(), dec!(0.4))]));
        let quote = engine().quote(&req).unwrap();
        assert_eq!(quote.base_hourly, dec!(0.4));
        assert_eq!(quote.total_hourly, dec!(1.330));
    }

    #[test]
    fn test_discount_applies_to_every_component() {
        let mut req = request();
        req.user_discount_percent = Some(dec!(10));
        let quote = engine().quote(&req).unwrap();
        assert_eq!(quote.total_hourly, dec!(1.430) * dec!(0.9));
        assert_eq!(quote.rate_card.base_hourly, dec!(0.45));
    }

    #[test]
    fn test_partial_vram_scales_vram_component() {
        let mut req = request();
        req.requested_vram_mb = 12_288;
        let quote = engine().quote(&req).unwrap();
        assert_eq!(quote.vram_hourly, dec!(0.24));
        assert_eq!(quote.vram_percentage, dec!(50));
    }

    #[test]
    fn test_validation_failures() {
        let engine = engine();

        let mut unknown = request();
        unknown.gpu_model = "Voodoo2".to_string();
        assert!(engine.quote(&unknown).is_err());

        let mut oversubscribed = request();
        oversubscribed.requested_vram_mb = 32_768;
        assert!(engine.quote(&oversubscribed).is_err());

        let mut no_power = request();
        no_power.estimated_power_w = 0;
        assert!(engine.quote(&no_power).is_err());

        let mut no_duration = request();
        no_duration.duration_hours = Decimal::ZERO;
        assert!(engine.quote(&no_duration).is_err());
    }
}

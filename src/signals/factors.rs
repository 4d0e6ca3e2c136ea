use std::sync::Arc;

use async_trait::async_trait;

use super::{FactorCalculator, FactorInputs, FactorReading};
use crate::aggregator::{Aggregation, AMOUNT_FIELD};
use crate::config::Config;
use crate::core::{EntityKey, GeoPoint};
use crate::error::FactorError;

pub const AMOUNT: &str = "amount";
pub const VELOCITY: &str = "velocity";
pub const DEVICE: &str = "device";
pub const LOCATION: &str = "location";
pub const TIME: &str = "time";
pub const FRAUD_HISTORY: &str = "fraud_history";

/// Every factor the scorer expects a weight for.
pub const FACTOR_NAMES: [&str; 6] = [AMOUNT, VELOCITY, DEVICE, LOCATION, TIME, FRAUD_HISTORY];

/// Return all calculators configured from `config`.
pub fn default_calculators(config: &Config) -> Vec<Arc<dyn FactorCalculator>> {
    let f = &config.factors;
    vec![
        Arc::new(AmountRisk),
        Arc::new(VelocityRisk {
            window_seconds: f.velocity_window_seconds,
            ceiling: f.velocity_ceiling,
        }),
        Arc::new(DeviceRisk),
        Arc::new(LocationRisk {
            radius_km: f.location_radius_km,
        }),
        Arc::new(TimeRisk {
            min_history: f.time_min_history,
            unusual_start: f.unusual_hour_start,
            unusual_end: f.unusual_hour_end,
            default_utc_offset_minutes: config.engine.default_utc_offset_minutes,
        }),
        Arc::new(FraudHistoryRisk),
    ]
}

// --- Individual factors ---

/// Amount relative to the user's historical max and average.
/// No history: 0.4, an unknown baseline rather than a safe one.
pub struct AmountRisk;

#[async_trait]
impl FactorCalculator for AmountRisk {
    fn name(&self) -> &'static str {
        AMOUNT
    }
    fn default_value(&self) -> f64 {
        0.4
    }
    async fn compute(&self, inputs: &FactorInputs) -> Result<FactorReading, FactorError> {
        let amount = inputs.context.amount;
        let history = inputs.history.get().await?;
        if history.transaction_count == 0 || history.max_amount <= 0.0 {
            return Ok(FactorReading::new(0.4, "no amount history"));
        }
        let reading = if amount > 2.0 * history.max_amount {
            FactorReading::new(
                0.8,
                format!("{amount:.2} exceeds twice the historical max {:.2}", history.max_amount),
            )
        } else if history.avg_amount > 0.0 && amount > 3.0 * history.avg_amount {
            FactorReading::new(
                0.6,
                format!("{amount:.2} exceeds three times the average {:.2}", history.avg_amount),
            )
        } else {
            FactorReading::new(0.2, format!("{amount:.2} within historical range"))
        };
        Ok(reading)
    }
}

/// Amount moved in the trailing window against a ceiling.
pub struct VelocityRisk {
    pub window_seconds: u64,
    pub ceiling: f64,
}

#[async_trait]
impl FactorCalculator for VelocityRisk {
    fn name(&self) -> &'static str {
        VELOCITY
    }
    fn default_value(&self) -> f64 {
        0.5
    }
    async fn compute(&self, inputs: &FactorInputs) -> Result<FactorReading, FactorError> {
        let ctx = &inputs.context;
        let sum = inputs.aggregator.query(
            &EntityKey::user(&ctx.user_id),
            AMOUNT_FIELD,
            &Aggregation::Sum,
            self.window_seconds,
            ctx.timestamp,
        )?;
        let value = if sum > self.ceiling {
            0.9
        } else if sum > self.ceiling / 2.0 {
            0.7
        } else {
            sum / self.ceiling
        };
        Ok(FactorReading::new(
            value,
            format!("{sum:.2} moved in {}s (ceiling {:.2})", self.window_seconds, self.ceiling),
        ))
    }
}

/// Unseen device fingerprint for this user.
pub struct DeviceRisk;

#[async_trait]
impl FactorCalculator for DeviceRisk {
    fn name(&self) -> &'static str {
        DEVICE
    }
    fn default_value(&self) -> f64 {
        0.5
    }
    async fn compute(&self, inputs: &FactorInputs) -> Result<FactorReading, FactorError> {
        let ctx = &inputs.context;
        let fingerprint = ctx.device_fingerprint.as_str();
        if inputs
            .aggregator
            .knows_device(&EntityKey::user(&ctx.user_id), fingerprint, ctx.timestamp)
        {
            return Ok(FactorReading::new(0.1, "device seen recently"));
        }
        let history = inputs.history.get().await?;
        if history.known_devices.iter().any(|d| d == fingerprint) {
            Ok(FactorReading::new(0.1, "device known from history"))
        } else {
            Ok(FactorReading::new(0.7, format!("new device {fingerprint}")))
        }
    }
}

/// Distance from the nearest place the user has transacted from.
pub struct LocationRisk {
    pub radius_km: f64,
}

#[async_trait]
impl FactorCalculator for LocationRisk {
    fn name(&self) -> &'static str {
        LOCATION
    }
    fn default_value(&self) -> f64 {
        0.5
    }
    async fn compute(&self, inputs: &FactorInputs) -> Result<FactorReading, FactorError> {
        let ctx = &inputs.context;
        let Some(point) = ctx.location else {
            return Ok(FactorReading::new(0.5, "no location reported"));
        };
        let history = inputs.history.get().await?;
        let mut known: Vec<GeoPoint> = history.known_locations.clone();
        known.extend(
            inputs
                .aggregator
                .recent_locations(&EntityKey::user(&ctx.user_id), ctx.timestamp),
        );

        let nearest = known
            .iter()
            .map(|k| point.distance_km(k))
            .min_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let reading = match nearest {
            None => FactorReading::new(0.3, "first recorded location"),
            Some(d) if d > self.radius_km => {
                FactorReading::new(0.8, format!("{d:.1} km from nearest known location"))
            }
            Some(d) => FactorReading::new(
                0.1 + 0.7 * d / self.radius_km,
                format!("{d:.1} km from nearest known location"),
            ),
        };
        Ok(reading)
    }
}

/// Local hour against the user's own activity histogram.
pub struct TimeRisk {
    pub min_history: u64,
    pub unusual_start: u32,
    pub unusual_end: u32,
    pub default_utc_offset_minutes: i32,
}

#[async_trait]
impl FactorCalculator for TimeRisk {
    fn name(&self) -> &'static str {
        TIME
    }
    fn default_value(&self) -> f64 {
        0.5
    }
    async fn compute(&self, inputs: &FactorInputs) -> Result<FactorReading, FactorError> {
        let hour = inputs.context.local_hour(self.default_utc_offset_minutes);
        let history = inputs.history.get().await?;
        let total: u64 = history.hourly_activity.iter().sum();

        if total < self.min_history {
            let unusual = (self.unusual_start..self.unusual_end).contains(&hour);
            let value = if unusual { 0.7 } else { 0.2 };
            let why = if unusual { "unusual hour" } else { "ordinary hour" };
            return Ok(FactorReading::new(
                value,
                format!("{hour:02}:00 local, {why}, {total} txs of history"),
            ));
        }

        let max = history.hourly_activity.iter().copied().max().unwrap_or(0).max(1);
        let share = history.hourly_activity[hour as usize] as f64 / max as f64;
        Ok(FactorReading::new(
            0.1 + 0.8 * (1.0 - share),
            format!("{hour:02}:00 local, {:.0}% of the busiest hour", share * 100.0),
        ))
    }
}

/// Confirmed fraud events in the store's lookback window.
pub struct FraudHistoryRisk;

#[async_trait]
impl FactorCalculator for FraudHistoryRisk {
    fn name(&self) -> &'static str {
        FRAUD_HISTORY
    }
    fn default_value(&self) -> f64 {
        0.5
    }
    async fn compute(&self, inputs: &FactorInputs) -> Result<FactorReading, FactorError> {
        let history = inputs.history.get().await?;
        let events = history.fraud_event_count;
        let value = if events >= 5 {
            1.0
        } else {
            0.2 + 0.16 * events as f64
        };
        Ok(FactorReading::new(value, format!("{events} confirmed fraud events")))
    }
}

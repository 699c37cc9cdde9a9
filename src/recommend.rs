//! Rule-based recommendation generator.
//!
//! Rules are evaluated in a fixed order and the first match wins; triggers
//! are never combined. Rows that match nothing are tagged `normal`.

use crate::models::{
    Priority, Recommendation, RecommendationBody, RecommendationInput, RecommendationTag,
};

/// Anomaly tag the inference service emits for a bad power factor.
pub const POWER_FACTOR_ANOMALY: &str = "power_factor_abnormal";

/// Measured power factor below this (and above zero) counts as abnormal.
pub const LOW_POWER_FACTOR: f64 = 0.8;

/// Actual usage above predicted × this ratio is a spike.
pub const SPIKE_RATIO: f64 = 1.2;

pub const LOW_OCCUPANCY: i32 = 5;
pub const HIGH_ENERGY: f64 = 30.0;

/// Comfort ceiling in °C.
pub const MAX_COMFORT_TEMPERATURE: f64 = 26.0;

/// Pick the recommendation for one joined sensor/prediction row.
pub fn evaluate(input: &RecommendationInput) -> RecommendationBody {
    // ---
    let pf_anomaly = input
        .anomaly
        .as_deref()
        .is_some_and(|tags| tags.contains(POWER_FACTOR_ANOMALY));
    let pf_low = input.power_factor > 0.0 && input.power_factor < LOW_POWER_FACTOR;

    // A zero prediction is treated as "no prediction".
    let spike = input
        .predicted_energy
        .filter(|p| *p != 0.0)
        .is_some_and(|p| input.energy > p * SPIKE_RATIO);

    if pf_anomaly || pf_low {
        RecommendationBody {
            description: "Optimize power factor: Consider adding power factor correction capacitors.",
            priority: Priority::High,
            tag: RecommendationTag::PowerFactor,
        }
    } else if spike {
        RecommendationBody {
            description: "Reduce energy usage: Schedule high-energy equipment during off-peak hours.",
            priority: Priority::Medium,
            tag: RecommendationTag::EnergySpike,
        }
    } else if input.occupancy < LOW_OCCUPANCY && input.energy > HIGH_ENERGY {
        RecommendationBody {
            description: "Reduce HVAC and lighting: Low occupancy detected with high usage.",
            priority: Priority::Medium,
            tag: RecommendationTag::OccupancyMismatch,
        }
    } else if input.temperature > MAX_COMFORT_TEMPERATURE {
        RecommendationBody {
            description: "Adjust HVAC: Temperature exceeds 26°C, consider cooling optimization.",
            priority: Priority::Low,
            tag: RecommendationTag::TemperatureControl,
        }
    } else {
        RecommendationBody {
            description: "No immediate action required: Conditions within optimal range.",
            priority: Priority::Low,
            tag: RecommendationTag::Normal,
        }
    }
}

/// Evaluate a row and shape it as a `recommendations` row.
pub fn recommendation_for(input: &RecommendationInput) -> (Recommendation, RecommendationTag) {
    // ---
    let body = evaluate(input);
    let tag = body.tag;
    let recommendation = Recommendation {
        timestamp: input.timestamp,
        building_id: input.building_id,
        predicted_energy: input.predicted_energy.unwrap_or(0.0),
        recommendation: serde_json::json!(body),
    };
    (recommendation, tag)
}

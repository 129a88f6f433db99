//! Optimizer and validator tuning knobs

use serde::{Deserialize, Serialize};

/// Weighted multi-objective coefficients. Fleet size dominates, then
/// deadhead, then comfort terms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectiveWeights {
    pub buses: f64,
    pub deadhead_km: f64,
    pub overtime_minutes: f64,
    pub time_shift_minutes: f64,
    pub load_imbalance: f64,
    pub fuel_cost: f64,
    pub co2_emissions: f64,
}

impl Default for ObjectiveWeights {
    fn default() -> Self {
        Self {
            buses: 1000.0,
            deadhead_km: 10.0,
            overtime_minutes: 50.0,
            time_shift_minutes: 5.0,
            load_imbalance: 20.0,
            fuel_cost: 0.15,
            co2_emissions: 0.01,
        }
    }
}

/// Named weight presets selectable per job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObjectivePreset {
    MinimizeBuses,
    MinimizeCost,
    MinimizeEmissions,
    Balanced,
}

impl ObjectivePreset {
    pub fn weights(&self) -> ObjectiveWeights {
        let defaults = ObjectiveWeights::default();
        match self {
            ObjectivePreset::MinimizeBuses => ObjectiveWeights {
                buses: defaults.buses,
                deadhead_km: 0.0,
                overtime_minutes: 0.0,
                time_shift_minutes: 0.0,
                load_imbalance: 0.0,
                fuel_cost: 0.0,
                co2_emissions: 0.0,
            },
            ObjectivePreset::MinimizeCost => ObjectiveWeights {
                buses: defaults.buses,
                deadhead_km: defaults.deadhead_km,
                overtime_minutes: 0.0,
                time_shift_minutes: 0.0,
                load_imbalance: 0.0,
                fuel_cost: defaults.fuel_cost,
                co2_emissions: 0.0,
            },
            ObjectivePreset::MinimizeEmissions => ObjectiveWeights {
                buses: 0.0,
                deadhead_km: 0.0,
                overtime_minutes: 0.0,
                time_shift_minutes: 0.0,
                load_imbalance: 0.0,
                fuel_cost: defaults.fuel_cost,
                co2_emissions: defaults.co2_emissions,
            },
            ObjectivePreset::Balanced => defaults,
        }
    }
}

/// Travel-time perturbation distribution for robustness validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PerturbationDistribution {
    Lognormal,
    Normal,
    Uniform,
}

impl Default for PerturbationDistribution {
    fn default() -> Self {
        Self::Lognormal
    }
}

/// Monte Carlo validation options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonteCarloOptions {
    /// Number of simulations, clamped to [100, 10000]
    pub simulations: u32,
    pub distribution: PerturbationDistribution,
    /// Relative uncertainty sigma
    pub sigma: f64,
    pub seed: Option<u64>,
}

impl Default for MonteCarloOptions {
    fn default() -> Self {
        Self {
            simulations: 1_000,
            distribution: PerturbationDistribution::Lognormal,
            sigma: 0.20,
            seed: None,
        }
    }
}

impl MonteCarloOptions {
    pub fn clamped_simulations(&self) -> u32 {
        self.simulations.clamp(100, 10_000)
    }
}

/// Chain construction strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConstructionStrategy {
    /// Sort by anchor time, cheapest feasible insertion
    Greedy,
    /// Regret-k insertion (k = `regret_k`)
    Regret,
}

impl Default for ConstructionStrategy {
    fn default() -> Self {
        Self::Greedy
    }
}

/// Per-job optimizer options. All fields have server defaults so an empty
/// `options` object is a valid submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OptimizerOptions {
    /// Maximum minutes a start may be advanced before its natural start
    pub max_time_shift_minutes: i32,
    /// Extra buffer required on every transition
    pub transition_buffer_minutes: i32,
    /// Seats per bus; `None` means unlimited
    pub bus_seats: Option<u32>,
    /// Transitions longer than this are spatially incompatible
    pub max_reasonable_travel_minutes: i32,
    pub construction: ConstructionStrategy,
    pub regret_k: u32,
    pub lns_iteration_budget: u32,
    pub lns_time_budget_seconds: u64,
    pub lns_patience: u32,
    pub ilp_max_pairs: usize,
    pub ilp_time_limit_seconds: u64,
    /// Weight preset; explicit `weights` wins when both are present
    pub preset: Option<ObjectivePreset>,
    pub weights: Option<ObjectiveWeights>,
    /// Deterministic seed for the stochastic search
    pub seed: Option<u64>,
    /// Run the Monte Carlo validator on the final schedule
    pub validate: Option<MonteCarloOptions>,
    /// Restrict the pool to routes running on this day code
    pub day: Option<String>,
}

impl Default for OptimizerOptions {
    fn default() -> Self {
        Self {
            max_time_shift_minutes: 15,
            transition_buffer_minutes: 0,
            bus_seats: None,
            max_reasonable_travel_minutes: 120,
            construction: ConstructionStrategy::Greedy,
            regret_k: 2,
            lns_iteration_budget: 2_000,
            lns_time_budget_seconds: 30,
            lns_patience: 200,
            ilp_max_pairs: 5_000,
            ilp_time_limit_seconds: 10,
            preset: None,
            weights: None,
            seed: None,
            validate: None,
            day: None,
        }
    }
}

impl OptimizerOptions {
    /// Resolve the effective objective weights
    pub fn effective_weights(&self) -> ObjectiveWeights {
        if let Some(weights) = &self.weights {
            return weights.clone();
        }
        self.preset.map(|p| p.weights()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_weights_match_documented_values() {
        let w = ObjectiveWeights::default();
        assert_eq!(w.buses, 1000.0);
        assert_eq!(w.deadhead_km, 10.0);
        assert_eq!(w.overtime_minutes, 50.0);
        assert_eq!(w.time_shift_minutes, 5.0);
        assert_eq!(w.load_imbalance, 20.0);
        assert_eq!(w.fuel_cost, 0.15);
        assert_eq!(w.co2_emissions, 0.01);
    }

    #[test]
    fn test_minimize_buses_preset_zeroes_everything_else() {
        let w = ObjectivePreset::MinimizeBuses.weights();
        assert_eq!(w.buses, 1000.0);
        assert_eq!(w.deadhead_km, 0.0);
        assert_eq!(w.fuel_cost, 0.0);
    }

    #[test]
    fn test_explicit_weights_win_over_preset() {
        let custom = ObjectiveWeights {
            buses: 1.0,
            ..Default::default()
        };
        let options = OptimizerOptions {
            preset: Some(ObjectivePreset::MinimizeEmissions),
            weights: Some(custom.clone()),
            ..Default::default()
        };
        assert_eq!(options.effective_weights(), custom);
    }

    #[test]
    fn test_empty_options_object_deserializes_with_defaults() {
        let options: OptimizerOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options.max_time_shift_minutes, 15);
        assert_eq!(options.lns_iteration_budget, 2_000);
        assert_eq!(options.ilp_max_pairs, 5_000);
        assert!(options.bus_seats.is_none());
    }

    #[test]
    fn test_monte_carlo_simulations_clamped() {
        let low = MonteCarloOptions {
            simulations: 10,
            ..Default::default()
        };
        let high = MonteCarloOptions {
            simulations: 50_000,
            ..Default::default()
        };
        assert_eq!(low.clamped_simulations(), 100);
        assert_eq!(high.clamped_simulations(), 10_000);
    }

    #[test]
    fn test_preset_parses_screaming_snake_case() {
        let preset: ObjectivePreset = serde_json::from_str(r#""MINIMIZE_BUSES""#).unwrap();
        assert_eq!(preset, ObjectivePreset::MinimizeBuses);
    }
}

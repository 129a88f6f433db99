//! Weighted multi-objective scoring of a candidate schedule
//!
//! Pure and deterministic: the same duties and weights always produce the
//! same score, and no I/O happens here.

use super::ScheduleContext;
use crate::types::schedule::diff_minutes;
use crate::types::{DutyItem, ObjectiveWeights};

/// Bus fuel burn per km
const FUEL_LITERS_PER_KM: f64 = 0.35;
/// Diesel price per liter
const FUEL_PRICE_PER_LITER: f64 = 1.45;
/// CO₂ emitted per km
const CO2_KG_PER_KM: f64 = 1.3;
/// Duty span beyond this counts as overtime
const STANDARD_DUTY_MINUTES: i32 = 480;

/// Per-term breakdown of a schedule's score
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreBreakdown {
    pub buses: u32,
    pub deadhead_km: f64,
    pub overtime_minutes: i32,
    pub time_shift_minutes: i32,
    pub load_imbalance: f64,
    pub fuel_cost: f64,
    pub co2_kg: f64,
    pub total: f64,
}

/// Scores duty sets under the configured objective weights
pub struct Evaluator<'a> {
    ctx: &'a ScheduleContext<'a>,
    weights: ObjectiveWeights,
    speed_kmh: f64,
}

impl<'a> Evaluator<'a> {
    pub fn new(ctx: &'a ScheduleContext<'a>) -> Self {
        Self {
            ctx,
            weights: ctx.options.effective_weights(),
            speed_kmh: crate::services::geo::DEFAULT_SPEED_KMH,
        }
    }

    /// Scalar objective value; lower is better
    pub fn score(&self, duties: &[Vec<DutyItem>]) -> f64 {
        self.breakdown(duties).total
    }

    /// Full per-term breakdown
    pub fn breakdown(&self, duties: &[Vec<DutyItem>]) -> ScoreBreakdown {
        let buses = duties.iter().filter(|d| !d.is_empty()).count() as u32;

        let deadhead_minutes: i32 = duties
            .iter()
            .flat_map(|d| d.iter())
            .map(|i| i.deadhead_minutes)
            .sum();
        let deadhead_km = minutes_to_km(deadhead_minutes, self.speed_kmh);

        let overtime_minutes: i32 = duties
            .iter()
            .filter(|d| !d.is_empty())
            .map(|d| {
                let span = diff_minutes(d[d.len() - 1].end_time, d[0].start_time);
                (span - STANDARD_DUTY_MINUTES).max(0)
            })
            .sum();

        let time_shift_minutes: i32 = duties
            .iter()
            .flat_map(|d| d.iter())
            .map(|i| i.time_shift_minutes)
            .sum();

        let load_imbalance = items_variance(duties);

        let service_minutes: i32 = duties
            .iter()
            .flat_map(|d| d.iter())
            .map(|i| self.ctx.duration(&i.route_id))
            .sum();
        let total_km = minutes_to_km(service_minutes + deadhead_minutes, self.speed_kmh);
        let fuel_cost = total_km * FUEL_LITERS_PER_KM * FUEL_PRICE_PER_LITER;
        let co2_kg = total_km * CO2_KG_PER_KM;

        let w = &self.weights;
        let total = w.buses * buses as f64
            + w.deadhead_km * deadhead_km
            + w.overtime_minutes * overtime_minutes as f64
            + w.time_shift_minutes * time_shift_minutes as f64
            + w.load_imbalance * load_imbalance
            + w.fuel_cost * fuel_cost
            + w.co2_emissions * co2_kg;

        ScoreBreakdown {
            buses,
            deadhead_km,
            overtime_minutes,
            time_shift_minutes,
            load_imbalance,
            fuel_cost,
            co2_kg,
            total,
        }
    }
}

fn minutes_to_km(minutes: i32, speed_kmh: f64) -> f64 {
    minutes.max(0) as f64 / 60.0 * speed_kmh
}

/// Population variance of items per bus
fn items_variance(duties: &[Vec<DutyItem>]) -> f64 {
    let counts: Vec<f64> = duties
        .iter()
        .filter(|d| !d.is_empty())
        .map(|d| d.len() as f64)
        .collect();
    if counts.is_empty() {
        return 0.0;
    }
    let mean = counts.iter().sum::<f64>() / counts.len() as f64;
    counts.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / counts.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::optimizer::schedule_sequence;
    use crate::services::optimizer::testutil::{ctx_fixture, entry_route};
    use crate::types::{ObjectivePreset, OptimizerOptions};

    fn duties_for(fixture: &crate::services::optimizer::testutil::CtxFixture) -> Vec<Vec<DutyItem>> {
        let ctx = fixture.ctx();
        vec![
            schedule_sequence(&["a".to_string()], &ctx).unwrap(),
            schedule_sequence(&["b".to_string()], &ctx).unwrap(),
        ]
    }

    fn fixture() -> crate::services::optimizer::testutil::CtxFixture {
        ctx_fixture(vec![
            entry_route("a", (8, 0), 40.00, -3.70),
            entry_route("b", (8, 0), 40.10, -3.80),
        ])
    }

    #[test]
    fn test_score_is_deterministic() {
        let fixture = fixture();
        let duties = duties_for(&fixture);
        let ctx = fixture.ctx();
        let evaluator = Evaluator::new(&ctx);

        assert_eq!(evaluator.score(&duties), evaluator.score(&duties));
    }

    #[test]
    fn test_bus_term_dominates_with_defaults() {
        let fixture = fixture();
        let duties = duties_for(&fixture);
        let merged = vec![duties[0].clone(), duties[1].clone()];
        let single = vec![duties
            .iter()
            .flat_map(|d| d.iter().cloned())
            .collect::<Vec<_>>()];

        let ctx = fixture.ctx();
        let evaluator = Evaluator::new(&ctx);
        // One bus fewer outweighs any realistic deadhead
        assert!(evaluator.score(&single) < evaluator.score(&merged));
    }

    #[test]
    fn test_minimize_buses_preset_ignores_deadhead() {
        let mut fixture = fixture();
        fixture.options = OptimizerOptions {
            preset: Some(ObjectivePreset::MinimizeBuses),
            ..Default::default()
        };
        let duties = duties_for(&fixture);
        let ctx = fixture.ctx();
        let evaluator = Evaluator::new(&ctx);

        let breakdown = evaluator.breakdown(&duties);
        assert_eq!(breakdown.total, 2.0 * 1000.0);
    }

    #[test]
    fn test_variance_zero_for_balanced_buses() {
        let fixture = fixture();
        let duties = duties_for(&fixture);
        assert_eq!(items_variance(&duties), 0.0);
    }

    #[test]
    fn test_variance_positive_for_imbalanced_buses() {
        let fixture = fixture();
        let duties = duties_for(&fixture);
        let imbalanced = vec![
            duties.iter().flat_map(|d| d.iter().cloned()).collect::<Vec<_>>(),
            vec![],
        ];
        // Empty duties are ignored; compare a 2-vs-0 split against 1-vs-1
        assert_eq!(items_variance(&imbalanced), 0.0);

        let mut three = duties.clone();
        three[0].extend(duties[1].iter().cloned());
        assert!(items_variance(&three) > 0.0);
    }

    #[test]
    fn test_empty_schedule_scores_zero() {
        let fixture = fixture();
        let ctx = fixture.ctx();
        let evaluator = Evaluator::new(&ctx);
        let breakdown = evaluator.breakdown(&[]);
        assert_eq!(breakdown.total, 0.0);
        assert_eq!(breakdown.buses, 0);
    }
}

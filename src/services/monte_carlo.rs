//! Monte Carlo robustness validation
//!
//! Perturbs every travel time the schedule depends on, replays the
//! timetable with its stated start times, and grades how often the whole
//! day survives without a violated transition.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, LogNormal, Normal, Uniform};

use crate::services::optimizer::ScheduleContext;
use crate::types::schedule::diff_minutes;
use crate::types::{
    DaySchedule, MonteCarloOptions, MonteCarloResult, PerturbationDistribution, RobustnessGrade,
};

/// 95 % z-score for the Wilson interval
const Z_95: f64 = 1.959_963_985;

/// A single inter-route transition extracted from the schedule
struct Transition {
    base_travel_minutes: f64,
    gap_minutes: f64,
}

enum Sampler {
    LogNormal(LogNormal<f64>),
    Normal(Normal<f64>),
    Uniform(Uniform<f64>),
}

impl Sampler {
    fn new(distribution: PerturbationDistribution, sigma: f64) -> Self {
        match distribution {
            PerturbationDistribution::Lognormal => {
                // mu = -sigma^2/2 keeps the multiplicative mean at 1
                let mu = -sigma * sigma / 2.0;
                Sampler::LogNormal(
                    LogNormal::new(mu, sigma).expect("sigma is validated non-negative"),
                )
            }
            PerturbationDistribution::Normal => Sampler::Normal(
                Normal::new(1.0, sigma).expect("sigma is validated non-negative"),
            ),
            PerturbationDistribution::Uniform => {
                // Half-width sigma*sqrt(3) gives standard deviation sigma
                let half_width = sigma * 3.0f64.sqrt();
                Sampler::Uniform(Uniform::new_inclusive(
                    (1.0 - half_width).max(0.0),
                    1.0 + half_width,
                ))
            }
        }
    }

    fn factor(&self, rng: &mut StdRng) -> f64 {
        let factor = match self {
            Sampler::LogNormal(d) => d.sample(rng),
            Sampler::Normal(d) => d.sample(rng),
            Sampler::Uniform(d) => d.sample(rng),
        };
        factor.max(0.0)
    }
}

/// Replay the schedule under perturbed travel times and grade the result
pub fn validate(
    schedule: &DaySchedule,
    ctx: &ScheduleContext,
    options: &MonteCarloOptions,
) -> MonteCarloResult {
    let simulations = options.clamped_simulations();
    let sigma = options.sigma.clamp(0.0, 5.0);
    let sampler = Sampler::new(options.distribution, sigma);

    let mut rng = match options.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let transitions = collect_transitions(schedule, ctx);

    let mut feasible: u32 = 0;
    let mut total_violations: u64 = 0;

    for _ in 0..simulations {
        let mut violations = 0u32;
        for transition in &transitions {
            let perturbed = transition.base_travel_minutes * sampler.factor(&mut rng);
            if perturbed > transition.gap_minutes {
                violations += 1;
            }
        }
        if violations == 0 {
            feasible += 1;
        }
        total_violations += violations as u64;
    }

    let rate = if simulations == 0 {
        1.0
    } else {
        feasible as f64 / simulations as f64
    };
    let grade = RobustnessGrade::from_rate(rate);

    MonteCarloResult {
        simulations,
        distribution: options.distribution,
        sigma,
        feasibility_rate: rate,
        confidence_interval: wilson_interval(feasible, simulations),
        mean_violations: if simulations == 0 {
            0.0
        } else {
            total_violations as f64 / simulations as f64
        },
        grade,
        recommendation: grade.recommendation().to_string(),
    }
}

fn collect_transitions(schedule: &DaySchedule, ctx: &ScheduleContext) -> Vec<Transition> {
    let mut transitions = Vec::new();
    for duty in &schedule.buses {
        for pair in duty.items.windows(2) {
            let from = ctx.route(&pair[0].route_id);
            let to = ctx.route(&pair[1].route_id);
            let base = ctx.matrix.get(from.last_stop(), to.first_stop());
            let gap = diff_minutes(pair[1].start_time, pair[0].end_time) as f64;
            transitions.push(Transition {
                base_travel_minutes: base,
                gap_minutes: gap,
            });
        }
    }
    transitions
}

/// Wilson score interval at 95 % confidence
fn wilson_interval(successes: u32, n: u32) -> (f64, f64) {
    if n == 0 {
        return (0.0, 1.0);
    }
    let n = n as f64;
    let p = successes as f64 / n;
    let z2 = Z_95 * Z_95;
    let denominator = 1.0 + z2 / n;
    let center = (p + z2 / (2.0 * n)) / denominator;
    let half = (Z_95 / denominator) * (p * (1.0 - p) / n + z2 / (4.0 * n * n)).sqrt();
    ((center - half).max(0.0), (center + half).min(1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::optimizer::testutil::{ctx_fixture, entry_route};
    use crate::services::optimizer::schedule_sequence;
    use crate::types::BusDuty;

    fn schedule_with_slack() -> (crate::services::optimizer::testutil::CtxFixture, DaySchedule) {
        let fixture = ctx_fixture(vec![
            entry_route("a", (8, 0), 40.00, -3.70),
            entry_route("b", (10, 0), 40.02, -3.71),
        ]);
        let ctx = fixture.ctx();
        let items = schedule_sequence(&["a".to_string(), "b".to_string()], &ctx).unwrap();
        let schedule = DaySchedule::new(
            "L",
            vec![BusDuty {
                bus_id: "bus-001".to_string(),
                items,
            }],
        );
        (fixture, schedule)
    }

    fn options(sims: u32, sigma: f64, seed: u64) -> MonteCarloOptions {
        MonteCarloOptions {
            simulations: sims,
            distribution: PerturbationDistribution::Lognormal,
            sigma,
            seed: Some(seed),
        }
    }

    #[test]
    fn test_zero_sigma_is_always_feasible() {
        let (fixture, schedule) = schedule_with_slack();
        let ctx = fixture.ctx();

        let result = validate(&schedule, &ctx, &options(10_000, 0.0, 1));

        assert_eq!(result.simulations, 10_000);
        assert_eq!(result.feasibility_rate, 1.0);
        assert_eq!(result.grade, RobustnessGrade::A);
        assert_eq!(result.mean_violations, 0.0);
    }

    #[test]
    fn test_slack_schedule_grades_a_under_noise() {
        let (fixture, schedule) = schedule_with_slack();
        let ctx = fixture.ctx();

        let result = validate(&schedule, &ctx, &options(1_000, 0.20, 42));

        assert!(result.feasibility_rate >= 0.95, "rate {}", result.feasibility_rate);
        assert_eq!(result.grade, RobustnessGrade::A);
    }

    #[test]
    fn test_fixed_seed_is_reproducible() {
        let (fixture, schedule) = schedule_with_slack();
        let ctx = fixture.ctx();

        let first = validate(&schedule, &ctx, &options(500, 0.3, 7));
        let second = validate(&schedule, &ctx, &options(500, 0.3, 7));

        assert_eq!(first.feasibility_rate, second.feasibility_rate);
        assert_eq!(first.mean_violations, second.mean_violations);
        assert_eq!(first.confidence_interval, second.confidence_interval);
    }

    #[test]
    fn test_tight_schedule_grades_poorly() {
        let (fixture, mut schedule) = schedule_with_slack();
        let ctx = fixture.ctx();

        // Remove all slack: the second item now starts exactly at the end
        // of the first plus the base travel time
        let base = {
            let from = ctx.route("a");
            let to = ctx.route("b");
            ctx.matrix.get(from.last_stop(), to.first_stop())
        };
        let first_end = schedule.buses[0].items[0].end_time;
        let items = &mut schedule.buses[0].items;
        items[1].start_time =
            crate::types::schedule::add_minutes(first_end, base.ceil() as i32);

        let result = validate(&schedule, &ctx, &options(2_000, 0.20, 42));

        // Roughly half of all lognormal draws exceed the median
        assert!(result.feasibility_rate < 0.85, "rate {}", result.feasibility_rate);
        assert_ne!(result.grade, RobustnessGrade::A);
        assert!(result.mean_violations > 0.0);
    }

    #[test]
    fn test_rate_always_within_unit_interval() {
        let (fixture, schedule) = schedule_with_slack();
        let ctx = fixture.ctx();

        for distribution in [
            PerturbationDistribution::Lognormal,
            PerturbationDistribution::Normal,
            PerturbationDistribution::Uniform,
        ] {
            let result = validate(
                &schedule,
                &ctx,
                &MonteCarloOptions {
                    simulations: 300,
                    distribution,
                    sigma: 0.5,
                    seed: Some(3),
                },
            );
            assert!((0.0..=1.0).contains(&result.feasibility_rate));
            let (lo, hi) = result.confidence_interval;
            assert!(lo <= result.feasibility_rate && result.feasibility_rate <= hi);
        }
    }

    #[test]
    fn test_simulation_count_clamped() {
        let (fixture, schedule) = schedule_with_slack();
        let ctx = fixture.ctx();

        let result = validate(&schedule, &ctx, &options(5, 0.0, 1));
        assert_eq!(result.simulations, 100);
    }

    #[test]
    fn test_wilson_interval_properties() {
        let (lo, hi) = wilson_interval(95, 100);
        assert!(lo > 0.85 && lo < 0.95);
        assert!(hi > 0.95 && hi < 1.0);

        let (lo, hi) = wilson_interval(0, 100);
        assert_eq!(lo, 0.0);
        assert!(hi > 0.0 && hi < 0.1);

        let (lo, hi) = wilson_interval(100, 100);
        assert!(lo > 0.9);
        assert_eq!(hi, 1.0);
    }

    #[test]
    fn test_empty_schedule_is_trivially_feasible() {
        let fixture = ctx_fixture(vec![]);
        let ctx = fixture.ctx();
        let schedule = DaySchedule::new("L", vec![]);

        let result = validate(&schedule, &ctx, &options(200, 0.5, 9));
        assert_eq!(result.feasibility_rate, 1.0);
        assert_eq!(result.grade, RobustnessGrade::A);
    }
}

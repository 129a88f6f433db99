//! Simulated-annealing refinement over neighborhood and LNS operators
//!
//! Operators are drawn from an adaptive weighted roulette; acceptance is
//! simulated annealing over the scalar objective. Runs are reproducible
//! for a fixed seed.

use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::evaluator::Evaluator;
use super::lns::{DestroyOperator, DestroyRate, DestroyRepair, RepairOperator};
use super::{schedule_sequence, ScheduleContext};
use crate::types::{DutyItem, JobError};

/// Geometric cooling factor per iteration
const COOLING_FACTOR: f64 = 0.995;
const MIN_TEMPERATURE: f64 = 1e-4;
/// Initial temperature as a fraction of the starting cost
const INITIAL_TEMPERATURE_RATIO: f64 = 0.05;

/// Roulette bookkeeping
const REWARD_NEW_BEST: f64 = 3.0;
const REWARD_ACCEPTED: f64 = 1.0;
const WEIGHT_DECAY: f64 = 0.9;
const WEIGHT_DECAY_EVERY: u32 = 50;
const WEIGHT_MIN: f64 = 0.1;
const WEIGHT_MAX: f64 = 10.0;

/// Cancellation and deadline plumbing threaded through the search
pub struct SearchControl {
    pub cancel: CancellationToken,
    /// Job-level hard deadline; distinct from the search's own budget
    pub deadline: Option<Instant>,
}

impl SearchControl {
    pub fn unbounded() -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    fn check(&self) -> Result<(), JobError> {
        if self.cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(JobError::Timeout);
            }
        }
        Ok(())
    }
}

/// Refined schedule and search statistics
#[derive(Debug)]
pub struct SearchOutcome {
    pub duties: Vec<Vec<String>>,
    pub score: f64,
    pub iterations: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Relocate,
    Swap,
    TwoOptChain,
    MergeChains,
    SplitChain,
    InterblockSwap,
    Lns(DestroyOperator),
}

const OPERATORS: [Operator; 11] = [
    Operator::Relocate,
    Operator::Swap,
    Operator::TwoOptChain,
    Operator::MergeChains,
    Operator::SplitChain,
    Operator::InterblockSwap,
    Operator::Lns(DestroyOperator::Random),
    Operator::Lns(DestroyOperator::Worst),
    Operator::Lns(DestroyOperator::Related),
    Operator::Lns(DestroyOperator::Cluster),
    Operator::Lns(DestroyOperator::Shaw),
];

const REPAIRS: [RepairOperator; 3] = [
    RepairOperator::Greedy,
    RepairOperator::Regret2,
    RepairOperator::Assignment,
];

/// Neighborhood search over full-day duties
pub struct LocalSearch<'a> {
    ctx: &'a ScheduleContext<'a>,
    evaluator: Evaluator<'a>,
    repairer: DestroyRepair<'a>,
}

impl<'a> LocalSearch<'a> {
    pub fn new(ctx: &'a ScheduleContext<'a>) -> Self {
        Self {
            ctx,
            evaluator: Evaluator::new(ctx),
            repairer: DestroyRepair::new(ctx),
        }
    }

    /// Refine an initial set of duties. `on_progress` receives a fraction
    /// in [0, 1] as the iteration budget is consumed.
    pub fn refine(
        &self,
        initial: Vec<Vec<String>>,
        control: &SearchControl,
        on_progress: &mut dyn FnMut(f32),
    ) -> Result<SearchOutcome, JobError> {
        let mut current: Vec<Vec<String>> =
            initial.into_iter().filter(|d| !d.is_empty()).collect();

        if current.is_empty() {
            return Ok(SearchOutcome {
                duties: current,
                score: 0.0,
                iterations: 0,
            });
        }

        let options = self.ctx.options;
        let mut rng = StdRng::seed_from_u64(options.seed.unwrap_or(0));

        let mut current_cost = self
            .cost(&current)
            .ok_or_else(|| JobError::internal("initial schedule does not retime"))?;
        let mut best = current.clone();
        let mut best_cost = current_cost;

        let mut temperature =
            (current_cost * INITIAL_TEMPERATURE_RATIO).max(MIN_TEMPERATURE);
        let mut weights = [1.0f64; OPERATORS.len()];
        let mut destroy_rate = DestroyRate::default();
        let mut stagnant: u32 = 0;
        let started = Instant::now();
        let budget = options.lns_iteration_budget;
        let mut iterations = 0;

        for iter in 0..budget {
            // Cancellation is polled every iteration, well under the
            // 100 ms requirement
            control.check()?;

            if started.elapsed().as_secs() >= options.lns_time_budget_seconds {
                debug!(iter, "local search time budget exhausted");
                break;
            }
            if stagnant >= options.lns_patience {
                debug!(iter, "local search early stop after stagnation");
                break;
            }

            if iter > 0 && iter % WEIGHT_DECAY_EVERY == 0 {
                for w in weights.iter_mut() {
                    *w = (*w * WEIGHT_DECAY).clamp(WEIGHT_MIN, WEIGHT_MAX);
                }
            }
            if iter % 50 == 0 {
                on_progress(iter as f32 / budget.max(1) as f32);
            }

            let op_index = roulette_pick(&weights, &mut rng);
            let neighbor = self.apply(
                OPERATORS[op_index],
                &current,
                destroy_rate.rate(),
                &mut rng,
            );
            iterations = iter + 1;

            let mut reward = 0.0;
            let mut improved_best = false;

            if let Some(candidate) = neighbor {
                if let Some(candidate_cost) = self.cost(&candidate) {
                    let delta = candidate_cost - current_cost;
                    let accept = delta <= 0.0
                        || rng.gen::<f64>() < (-delta / temperature).exp();
                    if accept {
                        current = candidate;
                        current_cost = candidate_cost;
                        reward = REWARD_ACCEPTED;
                        if current_cost < best_cost - 1e-9 {
                            best = current.clone();
                            best_cost = current_cost;
                            reward = REWARD_NEW_BEST;
                            improved_best = true;
                        }
                    }
                }
            }

            weights[op_index] = (weights[op_index] + reward).clamp(WEIGHT_MIN, WEIGHT_MAX);
            destroy_rate.record(improved_best);
            stagnant = if improved_best { 0 } else { stagnant + 1 };
            temperature = (temperature * COOLING_FACTOR).max(MIN_TEMPERATURE);
        }

        on_progress(1.0);
        debug!(
            iterations,
            best_cost,
            buses = best.len(),
            "local search finished"
        );

        Ok(SearchOutcome {
            duties: best,
            score: best_cost,
            iterations,
        })
    }

    fn cost(&self, duties: &[Vec<String>]) -> Option<f64> {
        let materialized = self.materialize(duties)?;
        Some(self.evaluator.score(&materialized))
    }

    fn materialize(&self, duties: &[Vec<String>]) -> Option<Vec<Vec<DutyItem>>> {
        duties
            .iter()
            .map(|d| schedule_sequence(d, self.ctx))
            .collect()
    }

    fn apply(
        &self,
        op: Operator,
        current: &[Vec<String>],
        destroy_rate: f64,
        rng: &mut StdRng,
    ) -> Option<Vec<Vec<String>>> {
        match op {
            Operator::Relocate => self.relocate(current, rng),
            Operator::Swap => self.swap(current, rng),
            Operator::TwoOptChain => self.two_opt(current, rng),
            Operator::MergeChains => self.merge(current, rng),
            Operator::SplitChain => self.split(current, rng),
            Operator::InterblockSwap => self.interblock_swap(current, rng),
            Operator::Lns(destroy_op) => {
                let total: usize = current.iter().map(|d| d.len()).sum();
                let count = ((total as f64 * destroy_rate).ceil() as usize).max(1);
                let (remaining, removed) =
                    self.repairer.destroy(current, destroy_op, count, rng);
                let repair = REPAIRS[rng.gen_range(0..REPAIRS.len())];
                Some(self.repairer.repair(remaining, removed, repair, rng))
            }
        }
    }

    /// Move one route from a random duty into another duty
    fn relocate(&self, current: &[Vec<String>], rng: &mut StdRng) -> Option<Vec<Vec<String>>> {
        if current.len() < 2 {
            return None;
        }
        let from = rng.gen_range(0..current.len());
        let to = {
            let mut to = rng.gen_range(0..current.len() - 1);
            if to >= from {
                to += 1;
            }
            to
        };
        let pos = rng.gen_range(0..current[from].len());

        let mut duties = current.to_vec();
        let id = duties[from].remove(pos);
        let eval = super::best_position_in(&duties[to], &id, self.ctx)?;
        duties[to].insert(eval.position, id);
        duties.retain(|d| !d.is_empty());
        self.validate(&duties)
    }

    /// Exchange two routes between two duties
    fn swap(&self, current: &[Vec<String>], rng: &mut StdRng) -> Option<Vec<Vec<String>>> {
        if current.len() < 2 {
            return None;
        }
        let a = rng.gen_range(0..current.len());
        let b = {
            let mut b = rng.gen_range(0..current.len() - 1);
            if b >= a {
                b += 1;
            }
            b
        };
        let pa = rng.gen_range(0..current[a].len());
        let pb = rng.gen_range(0..current[b].len());

        let mut duties = current.to_vec();
        let ra = duties[a][pa].clone();
        let rb = duties[b][pb].clone();
        duties[a][pa] = rb;
        duties[b][pb] = ra;
        self.validate(&duties)
    }

    /// Reverse a contiguous subsequence within one duty
    fn two_opt(&self, current: &[Vec<String>], rng: &mut StdRng) -> Option<Vec<Vec<String>>> {
        let candidates: Vec<usize> = current
            .iter()
            .enumerate()
            .filter(|(_, d)| d.len() >= 3)
            .map(|(i, _)| i)
            .collect();
        let duty_idx = *pick(&candidates, rng)?;

        let len = current[duty_idx].len();
        let i = rng.gen_range(0..len - 1);
        let j = rng.gen_range(i + 1..len);

        let mut duties = current.to_vec();
        duties[duty_idx][i..=j].reverse();
        self.validate(&duties)
    }

    /// Collapse two duties into one bus
    fn merge(&self, current: &[Vec<String>], rng: &mut StdRng) -> Option<Vec<Vec<String>>> {
        if current.len() < 2 {
            return None;
        }
        let a = rng.gen_range(0..current.len());
        let b = {
            let mut b = rng.gen_range(0..current.len() - 1);
            if b >= a {
                b += 1;
            }
            b
        };

        let mut duties = current.to_vec();
        let tail = duties[b].clone();
        duties[a].extend(tail);
        duties.remove(b);
        self.validate(&duties)
    }

    /// Break one duty into two at a random pivot
    fn split(&self, current: &[Vec<String>], rng: &mut StdRng) -> Option<Vec<Vec<String>>> {
        let candidates: Vec<usize> = current
            .iter()
            .enumerate()
            .filter(|(_, d)| d.len() >= 2)
            .map(|(i, _)| i)
            .collect();
        let duty_idx = *pick(&candidates, rng)?;

        let pivot = rng.gen_range(1..current[duty_idx].len());
        let mut duties = current.to_vec();
        let tail = duties[duty_idx].split_off(pivot);
        duties.push(tail);
        self.validate(&duties)
    }

    /// Exchange the exit tails of two mixed duties
    fn interblock_swap(&self, current: &[Vec<String>], rng: &mut StdRng) -> Option<Vec<Vec<String>>> {
        let mixed: Vec<(usize, usize)> = current
            .iter()
            .enumerate()
            .filter_map(|(i, d)| self.exit_boundary(d).map(|b| (i, b)))
            .collect();
        if mixed.len() < 2 {
            return None;
        }
        let x = rng.gen_range(0..mixed.len());
        let y = {
            let mut y = rng.gen_range(0..mixed.len() - 1);
            if y >= x {
                y += 1;
            }
            y
        };
        let (a, ba) = mixed[x];
        let (b, bb) = mixed[y];

        let mut duties = current.to_vec();
        let tail_a: Vec<String> = duties[a].split_off(ba);
        let tail_b: Vec<String> = duties[b].split_off(bb);
        duties[a].extend(tail_b);
        duties[b].extend(tail_a);
        self.validate(&duties)
    }

    /// Index of the first exit item in a duty that has both kinds
    fn exit_boundary(&self, duty: &[String]) -> Option<usize> {
        let first_exit = duty
            .iter()
            .position(|id| self.ctx.route(id).kind == crate::types::RouteKind::Exit)?;
        if first_exit == 0 {
            return None;
        }
        Some(first_exit)
    }

    fn validate(&self, duties: &[Vec<String>]) -> Option<Vec<Vec<String>>> {
        let cleaned: Vec<Vec<String>> = duties
            .iter()
            .filter(|d| !d.is_empty())
            .cloned()
            .collect();
        for duty in &cleaned {
            schedule_sequence(duty, self.ctx)?;
        }
        Some(cleaned)
    }
}

fn roulette_pick(weights: &[f64], rng: &mut StdRng) -> usize {
    let total: f64 = weights.iter().sum();
    let mut x = rng.gen::<f64>() * total;
    for (i, w) in weights.iter().enumerate() {
        x -= w;
        if x <= 0.0 {
            return i;
        }
    }
    weights.len() - 1
}

fn pick<'a, T>(items: &'a [T], rng: &mut StdRng) -> Option<&'a T> {
    if items.is_empty() {
        return None;
    }
    Some(&items[rng.gen_range(0..items.len())])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::optimizer::testutil::{ctx_fixture, entry_route, exit_route};
    use crate::services::optimizer::{BlockMatcher, ChainBuilder};
    use crate::types::RouteKind;

    fn initial_blocks(
        fixture: &crate::services::optimizer::testutil::CtxFixture,
    ) -> Vec<Vec<String>> {
        let ctx = fixture.ctx();
        let builder = ChainBuilder::new(&ctx);
        let entries = builder.build(RouteKind::Entry);
        let exits = builder.build(RouteKind::Exit);
        BlockMatcher::new(&ctx)
            .matchup(&entries, &exits)
            .into_iter()
            .map(|b| b.route_ids)
            .collect()
    }

    fn fixture() -> crate::services::optimizer::testutil::CtxFixture {
        let mut fixture = ctx_fixture(vec![
            entry_route("a", (8, 0), 40.00, -3.70),
            entry_route("b", (9, 0), 40.02, -3.71),
            entry_route("c", (8, 0), 40.30, -3.95),
            exit_route("x", (16, 0), 40.03, -3.72),
            exit_route("y", (16, 0), 40.31, -3.96),
        ]);
        // Short budgets keep tests quick
        fixture.options.lns_iteration_budget = 200;
        fixture.options.lns_patience = 100;
        fixture.options.seed = Some(42);
        fixture
    }

    #[test]
    fn test_refine_preserves_route_set() {
        let fixture = fixture();
        let ctx = fixture.ctx();
        let initial = initial_blocks(&fixture);
        let search = LocalSearch::new(&ctx);

        let outcome = search
            .refine(initial, &SearchControl::unbounded(), &mut |_| {})
            .unwrap();

        let mut all: Vec<String> = outcome.duties.into_iter().flatten().collect();
        all.sort();
        assert_eq!(all, vec!["a", "b", "c", "x", "y"]);
    }

    #[test]
    fn test_refine_never_worsens_initial_score() {
        let fixture = fixture();
        let ctx = fixture.ctx();
        let initial = initial_blocks(&fixture);
        let search = LocalSearch::new(&ctx);

        let initial_cost = search.cost(&initial).unwrap();
        let outcome = search
            .refine(initial, &SearchControl::unbounded(), &mut |_| {})
            .unwrap();

        assert!(outcome.score <= initial_cost + 1e-9);
    }

    #[test]
    fn test_refine_is_reproducible_with_fixed_seed() {
        let fixture = fixture();
        let ctx = fixture.ctx();
        let search = LocalSearch::new(&ctx);

        let first = search
            .refine(initial_blocks(&fixture), &SearchControl::unbounded(), &mut |_| {})
            .unwrap();
        let second = search
            .refine(initial_blocks(&fixture), &SearchControl::unbounded(), &mut |_| {})
            .unwrap();

        assert_eq!(first.duties, second.duties);
        assert_eq!(first.score, second.score);
    }

    #[test]
    fn test_cancelled_token_stops_search() {
        let fixture = fixture();
        let ctx = fixture.ctx();
        let search = LocalSearch::new(&ctx);

        let control = SearchControl::unbounded();
        control.cancel.cancel();

        let result = search.refine(initial_blocks(&fixture), &control, &mut |_| {});
        assert!(matches!(result, Err(JobError::Cancelled)));
    }

    #[test]
    fn test_expired_deadline_times_out() {
        let fixture = fixture();
        let ctx = fixture.ctx();
        let search = LocalSearch::new(&ctx);

        let control = SearchControl {
            cancel: CancellationToken::new(),
            deadline: Some(Instant::now()),
        };

        let result = search.refine(initial_blocks(&fixture), &control, &mut |_| {});
        assert!(matches!(result, Err(JobError::Timeout)));
    }

    #[test]
    fn test_empty_initial_is_returned_unchanged() {
        let fixture = fixture();
        let ctx = fixture.ctx();
        let search = LocalSearch::new(&ctx);

        let outcome = search
            .refine(vec![], &SearchControl::unbounded(), &mut |_| {})
            .unwrap();
        assert!(outcome.duties.is_empty());
        assert_eq!(outcome.score, 0.0);
    }

    #[test]
    fn test_progress_reaches_one() {
        let fixture = fixture();
        let ctx = fixture.ctx();
        let search = LocalSearch::new(&ctx);

        let mut last = 0.0f32;
        search
            .refine(initial_blocks(&fixture), &SearchControl::unbounded(), &mut |f| {
                assert!(f >= last);
                last = f;
            })
            .unwrap();
        assert_eq!(last, 1.0);
    }
}

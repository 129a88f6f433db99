//! Matching morning entry-chains with afternoon exit-chains into
//! full-day bus duties
//!
//! Formulated as a min-cost assignment over a padded square matrix:
//! real-real cells cost the resulting deadhead, dummy cells carry the
//! unassignment penalty M, infeasible pairs a cost no optimal matching
//! ever selects.

use std::time::{Duration, Instant};

use pathfinding::kuhn_munkres::{kuhn_munkres_min, Weights};
use tracing::{debug, warn};

use super::chains::Chain;
use super::ScheduleContext;
use crate::types::schedule::diff_minutes;

/// Unassignment penalty: leaving a chain unmatched keeps its own bus
const UNMATCHED_PENALTY: i64 = 100_000;

/// Cost of an infeasible pairing; never selected while dummies exist
const INFEASIBLE: i64 = 10_000_000;

/// Above this dimension the exact solver is skipped outright
const MAX_EXACT_DIM: usize = 2_000;

/// Minimum-cost row→column assignment over a square matrix
pub trait AssignmentSolver: Send + Sync {
    /// Returns the column assigned to each row, or `None` when the solver
    /// declines the instance (too large, deadline passed)
    fn solve(&self, cost: &[Vec<i64>], deadline: Instant) -> Option<Vec<usize>>;

    fn name(&self) -> &'static str;
}

/// Exact solver backed by the Kuhn-Munkres algorithm
pub struct KuhnMunkresSolver;

/// Square cost matrix implementing pathfinding's Weights for i64
struct CostWeights(Vec<Vec<i64>>);

impl Weights<i64> for CostWeights {
    fn rows(&self) -> usize {
        self.0.len()
    }

    fn columns(&self) -> usize {
        self.0.first().map_or(0, |r| r.len())
    }

    fn at(&self, row: usize, col: usize) -> i64 {
        self.0[row][col]
    }

    fn neg(&self) -> Self {
        CostWeights(
            self.0
                .iter()
                .map(|r| r.iter().map(|&x| x.saturating_neg()).collect())
                .collect(),
        )
    }
}

impl AssignmentSolver for KuhnMunkresSolver {
    fn solve(&self, cost: &[Vec<i64>], deadline: Instant) -> Option<Vec<usize>> {
        let n = cost.len();
        if n == 0 {
            return Some(vec![]);
        }
        if n > MAX_EXACT_DIM || Instant::now() >= deadline {
            return None;
        }

        let started = Instant::now();
        let (_, assignment) = kuhn_munkres_min(&CostWeights(cost.to_vec()));
        let elapsed = started.elapsed();
        if started + elapsed > deadline {
            warn!(
                dim = n,
                elapsed_ms = elapsed.as_millis() as u64,
                "exact matching exceeded its time budget"
            );
        }
        Some(assignment)
    }

    fn name(&self) -> &'static str {
        "kuhn-munkres"
    }
}

/// Greedy minimum-weight matching used when the exact solver declines
pub struct GreedySolver;

impl AssignmentSolver for GreedySolver {
    fn solve(&self, cost: &[Vec<i64>], _deadline: Instant) -> Option<Vec<usize>> {
        let n = cost.len();
        let mut assignment = vec![usize::MAX; n];
        let mut col_taken = vec![false; n];

        // Cheapest cells first; ties resolved by (row, col) for determinism
        let mut cells: Vec<(i64, usize, usize)> = Vec::with_capacity(n * n);
        for (i, row) in cost.iter().enumerate() {
            for (j, &c) in row.iter().enumerate() {
                cells.push((c, i, j));
            }
        }
        cells.sort_unstable();

        let mut assigned = 0;
        for (_, i, j) in cells {
            if assignment[i] != usize::MAX || col_taken[j] {
                continue;
            }
            assignment[i] = j;
            col_taken[j] = true;
            assigned += 1;
            if assigned == n {
                break;
            }
        }
        Some(assignment)
    }

    fn name(&self) -> &'static str {
        "greedy"
    }
}

/// One matched full-day duty: the route sequence for a single bus
#[derive(Debug, Clone)]
pub struct DayBlock {
    pub route_ids: Vec<String>,
}

/// Pairs entry chains with exit chains so one bus serves both
pub struct BlockMatcher<'a> {
    ctx: &'a ScheduleContext<'a>,
}

impl<'a> BlockMatcher<'a> {
    pub fn new(ctx: &'a ScheduleContext<'a>) -> Self {
        Self { ctx }
    }

    /// Match chains into full-day blocks minimizing buses, then deadhead
    pub fn matchup(&self, entries: &[Chain], exits: &[Chain]) -> Vec<DayBlock> {
        if entries.is_empty() && exits.is_empty() {
            return vec![];
        }

        let ne = entries.len();
        let nx = exits.len();

        let cost = self.build_cost_matrix(entries, exits);

        let deadline =
            Instant::now() + Duration::from_secs(self.ctx.options.ilp_time_limit_seconds);
        let exact = KuhnMunkresSolver;
        let fallback = GreedySolver;

        let use_exact = ne * nx <= self.ctx.options.ilp_max_pairs;
        let assignment = if use_exact {
            match exact.solve(&cost, deadline) {
                Some(assignment) => {
                    debug!(entries = ne, exits = nx, solver = exact.name(), "blocks matched");
                    assignment
                }
                None => {
                    debug!(entries = ne, exits = nx, "exact solver declined, using greedy");
                    fallback.solve(&cost, deadline).expect("greedy always solves")
                }
            }
        } else {
            debug!(
                pairs = ne * nx,
                limit = self.ctx.options.ilp_max_pairs,
                "pair count over limit, using greedy matching"
            );
            fallback.solve(&cost, deadline).expect("greedy always solves")
        };

        self.blocks_from_assignment(entries, exits, &cost, &assignment)
    }

    fn build_cost_matrix(&self, entries: &[Chain], exits: &[Chain]) -> Vec<Vec<i64>> {
        let ne = entries.len();
        let nx = exits.len();
        let n = ne + nx;
        let mut cost = vec![vec![0i64; n]; n];

        for i in 0..n {
            for j in 0..n {
                cost[i][j] = match (i < ne, j < nx) {
                    (true, true) => self
                        .pair_cost(&entries[i], &exits[j])
                        .unwrap_or(INFEASIBLE),
                    (true, false) | (false, true) => UNMATCHED_PENALTY,
                    (false, false) => 0,
                };
            }
        }

        cost
    }

    /// Deadhead cost of serving `exit` after `entry` on one bus, or
    /// `None` when the pair is infeasible
    fn pair_cost(&self, entry: &Chain, exit: &Chain) -> Option<i64> {
        let entry_last = entry.items.last()?;
        let exit_first = exit.items.first()?;

        let entry_route = self.ctx.route(&entry_last.route_id);
        let exit_route = self.ctx.route(&exit_first.route_id);

        let travel = self
            .ctx
            .travel_minutes(entry_route.last_stop(), exit_route.first_stop());
        if travel > self.ctx.options.max_reasonable_travel_minutes {
            return None;
        }

        let gap = diff_minutes(exit_first.start_time, entry_last.end_time);
        if gap < travel + self.ctx.options.transition_buffer_minutes {
            return None;
        }

        if let Some(seats) = self.ctx.options.bus_seats {
            let demand = self.chain_demand(entry).max(self.chain_demand(exit));
            if demand > seats {
                return None;
            }
        }

        Some(travel as i64)
    }

    fn chain_demand(&self, chain: &Chain) -> u32 {
        chain
            .items
            .iter()
            .map(|i| self.ctx.route(&i.route_id).demand())
            .max()
            .unwrap_or(0)
    }

    fn blocks_from_assignment(
        &self,
        entries: &[Chain],
        exits: &[Chain],
        cost: &[Vec<i64>],
        assignment: &[usize],
    ) -> Vec<DayBlock> {
        let ne = entries.len();
        let nx = exits.len();
        let mut matched_exits = vec![false; nx];
        let mut blocks: Vec<DayBlock> = Vec::new();

        for (i, entry) in entries.iter().enumerate() {
            let j = assignment.get(i).copied().unwrap_or(usize::MAX);
            let paired = j < nx && cost[i][j] < UNMATCHED_PENALTY;
            if paired {
                matched_exits[j] = true;
                let mut route_ids = entry.route_ids();
                route_ids.extend(exits[j].route_ids());
                blocks.push(DayBlock { route_ids });
            } else {
                blocks.push(DayBlock {
                    route_ids: entry.route_ids(),
                });
            }
        }

        for (j, exit) in exits.iter().enumerate() {
            if !matched_exits[j] {
                blocks.push(DayBlock {
                    route_ids: exit.route_ids(),
                });
            }
        }

        blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::optimizer::testutil::{ctx_fixture, entry_route, exit_route};
    use crate::services::optimizer::ChainBuilder;
    use crate::types::RouteKind;

    fn far_future_deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[test]
    fn test_greedy_solver_prefers_cheapest_cells() {
        let cost = vec![
            vec![5, 1],
            vec![2, 9],
        ];
        let assignment = GreedySolver.solve(&cost, far_future_deadline()).unwrap();
        assert_eq!(assignment, vec![1, 0]);
    }

    #[test]
    fn test_exact_solver_finds_minimum_cost() {
        // Greedy would grab (0,0)=1 then be forced into (1,1)=10 (total 11);
        // the optimum is (0,1)+(1,0) = 2+2 = 4
        let cost = vec![
            vec![1, 2],
            vec![2, 10],
        ];
        let assignment = KuhnMunkresSolver.solve(&cost, far_future_deadline()).unwrap();
        assert_eq!(assignment, vec![1, 0]);
    }

    #[test]
    fn test_exact_solver_declines_past_deadline() {
        let cost = vec![vec![1i64; 4]; 4];
        let past = Instant::now() - Duration::from_secs(1);
        assert!(KuhnMunkresSolver.solve(&cost, past).is_none());
    }

    #[test]
    fn test_chainable_entry_and_exit_share_a_bus() {
        let routes = vec![
            entry_route("e1", (8, 30), 40.00, -3.70),
            exit_route("x1", (16, 0), 40.02, -3.71),
        ];
        let fixture = ctx_fixture(routes);
        let ctx = fixture.ctx();
        let builder = ChainBuilder::new(&ctx);
        let entries = builder.build(RouteKind::Entry);
        let exits = builder.build(RouteKind::Exit);

        let blocks = BlockMatcher::new(&ctx).matchup(&entries, &exits);

        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].route_ids, vec!["e1", "x1"]);
    }

    #[test]
    fn test_unreachable_exit_keeps_its_own_bus() {
        let routes = vec![
            entry_route("e1", (8, 30), 40.00, -3.70),
            // Far away: pairing deadhead exceeds the reasonable-travel cap
            exit_route("x1", (16, 0), 41.50, -3.70),
        ];
        let fixture = ctx_fixture(routes);
        let ctx = fixture.ctx();
        let builder = ChainBuilder::new(&ctx);
        let entries = builder.build(RouteKind::Entry);
        let exits = builder.build(RouteKind::Exit);

        let blocks = BlockMatcher::new(&ctx).matchup(&entries, &exits);

        assert_eq!(blocks.len(), 2);
    }

    #[test]
    fn test_matcher_minimizes_total_deadhead_across_pairs() {
        // Two entries and two exits; the crosswise pairing is cheaper
        let routes = vec![
            entry_route("e1", (8, 30), 40.00, -3.70),
            entry_route("e2", (8, 30), 40.20, -3.85),
            exit_route("x1", (16, 0), 40.21, -3.86),
            exit_route("x2", (16, 0), 40.01, -3.71),
        ];
        let fixture = ctx_fixture(routes);
        let ctx = fixture.ctx();
        let builder = ChainBuilder::new(&ctx);
        let entries = builder.build(RouteKind::Entry);
        let exits = builder.build(RouteKind::Exit);

        let blocks = BlockMatcher::new(&ctx).matchup(&entries, &exits);

        assert_eq!(blocks.len(), 2);
        for block in &blocks {
            assert_eq!(block.route_ids.len(), 2);
            // e1 pairs with the nearby x2, e2 with x1
            if block.route_ids[0] == "e1" {
                assert_eq!(block.route_ids[1], "x2");
            } else {
                assert_eq!(block.route_ids, vec!["e2", "x1"]);
            }
        }
    }

    #[test]
    fn test_empty_inputs_yield_no_blocks() {
        let fixture = ctx_fixture(vec![]);
        let ctx = fixture.ctx();
        let blocks = BlockMatcher::new(&ctx).matchup(&[], &[]);
        assert!(blocks.is_empty());
    }
}

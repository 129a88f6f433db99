//! Large-neighborhood destroy and repair operators

use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;

use super::blocks::{AssignmentSolver, GreedySolver, KuhnMunkresSolver};
use super::{best_position_in, schedule_sequence, ScheduleContext};
use crate::services::geo;
use crate::types::schedule::time_to_minutes;

/// Cost of opening a fresh bus for a repaired route
const NEW_BUS_COST: i64 = 10_000;
const INFEASIBLE: i64 = 10_000_000;

/// How a destroy step selects routes for removal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyOperator {
    Random,
    /// Highest marginal cost (deadhead + shift) first
    Worst,
    /// Geographically closest to a random seed route
    Related,
    /// Nearest to the centroid of a random duty
    Cluster,
    /// Mixed distance and anchor-time similarity
    Shaw,
}

/// How removed routes are put back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairOperator {
    Greedy,
    Regret2,
    /// Assignment subproblem over removed routes and open duties
    Assignment,
}

/// Destroy-repair machinery shared by the local search
pub struct DestroyRepair<'a> {
    ctx: &'a ScheduleContext<'a>,
}

impl<'a> DestroyRepair<'a> {
    pub fn new(ctx: &'a ScheduleContext<'a>) -> Self {
        Self { ctx }
    }

    /// Remove `count` routes from the duties, returning the surviving
    /// duties (no empties) and the removed route ids
    pub fn destroy(
        &self,
        duties: &[Vec<String>],
        op: DestroyOperator,
        count: usize,
        rng: &mut StdRng,
    ) -> (Vec<Vec<String>>, Vec<String>) {
        let all: Vec<String> = duties.iter().flatten().cloned().collect();
        if all.is_empty() {
            return (vec![], vec![]);
        }
        let count = count.clamp(1, all.len());

        let removed: Vec<String> = match op {
            DestroyOperator::Random => {
                let mut shuffled = all.clone();
                shuffled.shuffle(rng);
                shuffled.into_iter().take(count).collect()
            }
            DestroyOperator::Worst => self.worst_routes(duties, count),
            DestroyOperator::Related => {
                let seed = all[rng.gen_range(0..all.len())].clone();
                self.nearest_to(&all, &seed, count, 0.0)
            }
            DestroyOperator::Cluster => {
                let duty = &duties[rng.gen_range(0..duties.len())];
                let centroid = self.centroid(duty);
                self.nearest_to_point(&all, centroid, count)
            }
            DestroyOperator::Shaw => {
                let seed = all[rng.gen_range(0..all.len())].clone();
                // Distance plus anchor-time proximity
                self.nearest_to(&all, &seed, count, 0.5)
            }
        };

        let duties: Vec<Vec<String>> = duties
            .iter()
            .map(|d| {
                d.iter()
                    .filter(|id| !removed.contains(id))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .filter(|d: &Vec<String>| !d.is_empty())
            .collect();

        (duties, removed)
    }

    /// Reinsert the removed routes. Always succeeds: a route that fits
    /// nowhere opens a new duty.
    pub fn repair(
        &self,
        mut duties: Vec<Vec<String>>,
        mut removed: Vec<String>,
        op: RepairOperator,
        rng: &mut StdRng,
    ) -> Vec<Vec<String>> {
        // Anchor order keeps repairs deterministic for a fixed removal set
        removed.sort_by_key(|id| {
            (
                self.ctx.route(id).anchor_time,
                id.clone(),
            )
        });

        match op {
            RepairOperator::Greedy => {
                for id in removed {
                    self.insert_cheapest(&mut duties, &id);
                }
            }
            RepairOperator::Regret2 => self.repair_regret2(&mut duties, removed),
            RepairOperator::Assignment => {
                if !self.repair_assignment(&mut duties, &removed, rng) {
                    for id in removed {
                        self.insert_cheapest(&mut duties, &id);
                    }
                }
            }
        }

        duties
    }

    fn insert_cheapest(&self, duties: &mut Vec<Vec<String>>, id: &str) {
        let mut best: Option<(i32, i32, usize, Vec<String>)> = None;
        for (idx, duty) in duties.iter().enumerate() {
            if let Some(eval) = best_position_in(duty, id, self.ctx) {
                let mut ids = duty.clone();
                ids.insert(eval.position, id.to_string());
                let key = (eval.delta_deadhead, eval.total_shift, idx);
                if best
                    .as_ref()
                    .map(|(d, s, i, _)| key < (*d, *s, *i))
                    .unwrap_or(true)
                {
                    best = Some((eval.delta_deadhead, eval.total_shift, idx, ids));
                }
            }
        }
        match best {
            Some((_, _, idx, ids)) => duties[idx] = ids,
            None => duties.push(vec![id.to_string()]),
        }
    }

    fn repair_regret2(&self, duties: &mut Vec<Vec<String>>, mut removed: Vec<String>) {
        while !removed.is_empty() {
            let mut pick: Option<(usize, i64, Option<(usize, Vec<String>)>)> = None;

            for (r_idx, id) in removed.iter().enumerate() {
                let mut evals: Vec<(i32, i32, usize, Vec<String>)> = Vec::new();
                for (idx, duty) in duties.iter().enumerate() {
                    if let Some(eval) = best_position_in(duty, id, self.ctx) {
                        let mut ids = duty.clone();
                        ids.insert(eval.position, id.to_string());
                        evals.push((eval.delta_deadhead, eval.total_shift, idx, ids));
                    }
                }
                evals.sort_by_key(|(d, s, i, _)| (*d, *s, *i));

                let (regret, target) = match evals.len() {
                    0 => (i64::MAX, None),
                    1 => (i64::MAX / 2, evals.into_iter().next().map(|(_, _, i, ids)| (i, ids))),
                    _ => {
                        let regret = (evals[1].0 - evals[0].0) as i64;
                        let first = evals.into_iter().next().map(|(_, _, i, ids)| (i, ids));
                        (regret, first)
                    }
                };

                if pick.as_ref().map(|(_, r, _)| regret > *r).unwrap_or(true) {
                    pick = Some((r_idx, regret, target));
                }
            }

            let (r_idx, _, target) = pick.expect("removed is non-empty");
            let id = removed.remove(r_idx);
            match target {
                Some((idx, ids)) => duties[idx] = ids,
                None => duties.push(vec![id]),
            }
        }
    }

    /// One-shot assignment of removed routes to duties; at most one route
    /// per duty per solve, remainder opens new buses. Returns false when
    /// the solver declines.
    fn repair_assignment(
        &self,
        duties: &mut Vec<Vec<String>>,
        removed: &[String],
        _rng: &mut StdRng,
    ) -> bool {
        let m = removed.len();
        let d = duties.len();
        if m == 0 {
            return true;
        }
        let n = m + d;

        // rows: removed routes plus dummies; cols: duties plus new buses
        let mut cost = vec![vec![0i64; n]; n];
        let mut placements: Vec<Vec<Option<Vec<String>>>> = vec![vec![None; d]; m];

        for (i, id) in removed.iter().enumerate() {
            for (j, duty) in duties.iter().enumerate() {
                cost[i][j] = match best_position_in(duty, id, self.ctx) {
                    Some(eval) => {
                        let mut ids = duty.clone();
                        ids.insert(eval.position, id.clone());
                        placements[i][j] = Some(ids);
                        eval.delta_deadhead as i64
                    }
                    None => INFEASIBLE,
                };
            }
            for j in d..n {
                cost[i][j] = NEW_BUS_COST;
            }
        }
        for row in cost.iter_mut().take(n).skip(m) {
            for (j, cell) in row.iter_mut().enumerate() {
                *cell = if j < d { 0 } else { NEW_BUS_COST / 2 };
            }
        }

        let deadline =
            Instant::now() + Duration::from_secs(self.ctx.options.ilp_time_limit_seconds);
        let assignment = match KuhnMunkresSolver.solve(&cost, deadline) {
            Some(a) => a,
            None => match GreedySolver.solve(&cost, deadline) {
                Some(a) => a,
                None => return false,
            },
        };

        for (i, id) in removed.iter().enumerate() {
            let j = assignment[i];
            if j < d && cost[i][j] < NEW_BUS_COST {
                if let Some(ids) = placements[i][j].take() {
                    duties[j] = ids;
                    continue;
                }
            }
            duties.push(vec![id.clone()]);
        }
        true
    }

    /// Routes with the highest own cost (deadhead plus shift), ties by id
    fn worst_routes(&self, duties: &[Vec<String>], count: usize) -> Vec<String> {
        let mut scored: Vec<(i32, String)> = Vec::new();
        for duty in duties {
            if let Some(items) = schedule_sequence(duty, self.ctx) {
                for item in items {
                    scored.push((
                        item.deadhead_minutes + item.time_shift_minutes,
                        item.route_id,
                    ));
                }
            }
        }
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        scored.into_iter().take(count).map(|(_, id)| id).collect()
    }

    /// The `count` routes most similar to the seed route. `time_weight`
    /// mixes anchor proximity into the distance measure (shaw removal).
    fn nearest_to(
        &self,
        all: &[String],
        seed_id: &str,
        count: usize,
        time_weight: f64,
    ) -> Vec<String> {
        let seed = self.ctx.route(seed_id);
        let seed_pos = seed.first_stop().coordinates();
        let seed_anchor = time_to_minutes(seed.anchor_time);

        let mut scored: Vec<(f64, String)> = all
            .iter()
            .map(|id| {
                let route = self.ctx.route(id);
                let km = geo::haversine_distance(&seed_pos, &route.first_stop().coordinates());
                let anchor_gap =
                    (time_to_minutes(route.anchor_time) - seed_anchor).abs() as f64;
                (km + time_weight * anchor_gap / 60.0, id.clone())
            })
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        scored.into_iter().take(count).map(|(_, id)| id).collect()
    }

    fn nearest_to_point(
        &self,
        all: &[String],
        point: crate::types::Coordinates,
        count: usize,
    ) -> Vec<String> {
        let mut scored: Vec<(f64, String)> = all
            .iter()
            .map(|id| {
                let route = self.ctx.route(id);
                let km = geo::haversine_distance(&point, &route.first_stop().coordinates());
                (km, id.clone())
            })
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        scored.into_iter().take(count).map(|(_, id)| id).collect()
    }

    fn centroid(&self, duty: &[String]) -> crate::types::Coordinates {
        let mut lat = 0.0;
        let mut lng = 0.0;
        let mut n = 0usize;
        for id in duty {
            let stop = self.ctx.route(id).first_stop();
            lat += stop.lat;
            lng += stop.lng;
            n += 1;
        }
        let n = n.max(1) as f64;
        crate::types::Coordinates {
            lat: lat / n,
            lng: lng / n,
        }
    }
}

/// Adaptive removal fraction: widens after stalls, narrows when the
/// search keeps improving. Clamped to [0.1, 0.5].
#[derive(Debug, Clone)]
pub struct DestroyRate {
    rate: f64,
    non_improving: u32,
    improving: u32,
}

impl Default for DestroyRate {
    fn default() -> Self {
        Self {
            rate: 0.30,
            non_improving: 0,
            improving: 0,
        }
    }
}

impl DestroyRate {
    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn record(&mut self, improved: bool) {
        if improved {
            self.improving += 1;
            self.non_improving = 0;
            if self.improving >= 3 {
                self.rate = (self.rate - 0.05).max(0.1);
                self.improving = 0;
            }
        } else {
            self.non_improving += 1;
            self.improving = 0;
            if self.non_improving >= 10 {
                self.rate = (self.rate + 0.05).min(0.5);
                self.non_improving = 0;
            }
        }
    }
}

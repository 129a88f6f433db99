//! Route-to-bus scheduling engine
//!
//! Pipeline: travel matrix → chain construction → block matching → local
//! search, scored by the weighted evaluator. The orchestrator emits
//! progress through the injected sink and honors cancellation at every
//! phase boundary.

pub mod blocks;
pub mod chains;
pub mod evaluator;
pub mod feasibility;
pub mod lns;
pub mod local_search;

pub use blocks::{AssignmentSolver, BlockMatcher, DayBlock, GreedySolver, KuhnMunkresSolver};
pub use chains::{Chain, ChainBuilder};
pub use evaluator::Evaluator;
pub use feasibility::{FeasibilityChecker, FeasibilityFail, FeasibilityOk};
pub use local_search::{LocalSearch, SearchControl, SearchOutcome};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::services::monte_carlo;
use crate::services::progress::ProgressSink;
use crate::services::travel_time::{TravelTimeMatrix, TravelTimeProvider};
use crate::types::schedule::{add_minutes, diff_minutes, time_to_minutes};
use crate::types::{
    BusDuty, DaySchedule, DutyItem, JobError, JobWarning, MonteCarloResult, OptimizeJobRequest,
    OptimizeResult, OptimizerOptions, OptimizerPhase, ProgressEvent, Route, RouteKind,
};

/// Validated route pool with precomputed service durations
pub struct RoutePool {
    routes: Vec<Route>,
    by_id: HashMap<String, usize>,
    durations: Vec<i32>,
}

impl RoutePool {
    /// Build the pool, deriving each route's duration from the travel
    /// times between its consecutive stops
    pub fn new(routes: Vec<Route>, matrix: &TravelTimeMatrix) -> Self {
        let durations = routes
            .iter()
            .map(|route| {
                route
                    .stops
                    .windows(2)
                    .map(|w| matrix.get(&w[0], &w[1]))
                    .sum::<f64>()
                    .ceil() as i32
            })
            .collect();
        let by_id = routes
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id.clone(), i))
            .collect();
        Self {
            routes,
            by_id,
            durations,
        }
    }

    pub fn get(&self, id: &str) -> Option<&Route> {
        self.by_id.get(id).map(|&i| &self.routes[i])
    }

    pub fn duration(&self, id: &str) -> i32 {
        self.by_id.get(id).map(|&i| self.durations[i]).unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Shared read-only view used by every optimizer component
pub struct ScheduleContext<'a> {
    pub pool: &'a RoutePool,
    pub matrix: &'a TravelTimeMatrix,
    pub options: &'a OptimizerOptions,
}

impl ScheduleContext<'_> {
    /// Route lookup; ids are validated at submit time
    pub fn route(&self, id: &str) -> &Route {
        self.pool.get(id).expect("route id was validated")
    }

    pub fn duration(&self, id: &str) -> i32 {
        self.pool.duration(id)
    }

    /// Rounded-up travel minutes between two stops
    pub fn travel_minutes(&self, from: &crate::types::Stop, to: &crate::types::Stop) -> i32 {
        self.matrix.get(from, to).ceil() as i32
    }

    /// The unshifted start: anchor minus duration for entries, the anchor
    /// itself for exits
    pub fn natural_start(&self, route: &Route) -> NaiveTime {
        match route.kind {
            RouteKind::Entry => add_minutes(route.anchor_time, -self.duration(&route.id)),
            RouteKind::Exit => route.anchor_time,
        }
    }
}

/// Compute canonical times for a route sequence on one bus, or `None`
/// when no feasible timing exists.
///
/// Forward pass places every item at its earliest feasible start (so
/// feasibility is decided exactly); the backward pass then pushes starts
/// as late as their successors allow, minimizing time-shift.
pub fn schedule_sequence(ids: &[String], ctx: &ScheduleContext) -> Option<Vec<DutyItem>> {
    if ids.is_empty() {
        return Some(vec![]);
    }
    let checker = FeasibilityChecker::new(ctx);
    let mut items: Vec<DutyItem> = Vec::with_capacity(ids.len());

    for id in ids {
        let route = ctx.pool.get(id)?;
        let (lo, hi) = checker.start_window(route);
        let duration = ctx.duration(id);

        let (start, deadhead) = match items.last() {
            None => (lo, 0),
            Some(prev) => {
                let earliest = checker.earliest_start_after(prev, route);
                let start = if earliest > lo { earliest } else { lo };
                if start > hi {
                    return None;
                }
                let ok = checker.can_follow(prev, route, start).ok()?;
                (start, ok.travel_minutes)
            }
        };

        items.push(DutyItem {
            route_id: id.clone(),
            kind: route.kind,
            start_time: start,
            end_time: add_minutes(start, duration),
            time_shift_minutes: diff_minutes(ctx.natural_start(route), start).max(0),
            deadhead_minutes: deadhead,
        });
    }

    // Tighten: move each start as late as its window and successor allow
    for i in (0..items.len()).rev() {
        let route = ctx.pool.get(&items[i].route_id)?;
        let (_, hi) = checker.start_window(route);
        let duration = ctx.duration(&items[i].route_id);

        let limit = if i + 1 < items.len() {
            let next = &items[i + 1];
            let next_route = ctx.pool.get(&next.route_id)?;
            let travel = ctx.travel_minutes(route.last_stop(), next_route.first_stop());
            add_minutes(
                next.start_time,
                -(travel + ctx.options.transition_buffer_minutes + duration),
            )
        } else {
            hi
        };

        let start = hi.min(limit);
        if start > items[i].start_time {
            items[i].start_time = start;
            items[i].end_time = add_minutes(start, duration);
            items[i].time_shift_minutes =
                diff_minutes(ctx.natural_start(route), start).max(0);
        }
    }

    Some(items)
}

/// Best feasible position for one route inside one duty
pub(crate) struct PositionEval {
    pub position: usize,
    pub delta_deadhead: i32,
    pub total_shift: i32,
    pub items: Vec<DutyItem>,
}

pub(crate) fn best_position_in(
    ids: &[String],
    insert_id: &str,
    ctx: &ScheduleContext,
) -> Option<PositionEval> {
    let base_deadhead: i32 = schedule_sequence(ids, ctx)?
        .iter()
        .map(|i| i.deadhead_minutes)
        .sum();

    let mut best: Option<PositionEval> = None;
    for position in 0..=ids.len() {
        let mut candidate_ids = ids.to_vec();
        candidate_ids.insert(position, insert_id.to_string());

        let Some(items) = schedule_sequence(&candidate_ids, ctx) else {
            continue;
        };

        let delta_deadhead =
            items.iter().map(|i| i.deadhead_minutes).sum::<i32>() - base_deadhead;
        let total_shift: i32 = items.iter().map(|i| i.time_shift_minutes).sum();

        let replace = match &best {
            None => true,
            Some(b) => {
                (delta_deadhead, total_shift, position)
                    < (b.delta_deadhead, b.total_shift, b.position)
            }
        };
        if replace {
            best = Some(PositionEval {
                position,
                delta_deadhead,
                total_shift,
                items,
            });
        }
    }

    best
}

/// Everything a single optimization run needs from the outside
pub struct OptimizeEnv {
    pub job_id: Uuid,
    pub provider: Arc<dyn TravelTimeProvider>,
    pub sink: Arc<dyn ProgressSink>,
    pub cancel: CancellationToken,
    /// Job-level hard deadline
    pub deadline: Option<Instant>,
    /// Fallback estimator parameters
    pub detour_factor: f64,
    pub speed_kmh: f64,
}

impl OptimizeEnv {
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

    fn emit(&self, phase: OptimizerPhase, message: &str) {
        self.sink.publish(ProgressEvent::progress(
            self.job_id,
            phase,
            phase.base_progress(),
            message,
        ));
    }
}

/// Run the full optimization pipeline for one job
pub async fn run_optimization(
    request: OptimizeJobRequest,
    env: OptimizeEnv,
) -> Result<OptimizeResult, JobError> {
    env.check()?;
    env.emit(OptimizerPhase::Starting, "optimization accepted");

    env.emit(OptimizerPhase::Loading, "validating routes");
    let routes = load_routes(request.routes, &request.options)?;
    let options = request.options;

    env.check()?;
    env.emit(
        OptimizerPhase::Preprocessing,
        &format!("{} routes in pool", routes.len()),
    );

    env.check()?;
    env.emit(OptimizerPhase::TravelMatrix, "fetching travel times");
    let matrix = build_matrix(&routes, &env).await?;
    let mut warnings: Vec<JobWarning> = Vec::new();
    if let Some(warning) = matrix.provider_warning() {
        warnings.push(JobWarning::new("PROVIDER_UNAVAILABLE", warning));
    }

    let pool = RoutePool::new(routes, &matrix);
    ensure_anchors_fit(&pool)?;

    let day_key = options.day.clone().unwrap_or_else(|| "all".to_string());
    let job_id = env.job_id;
    let sink = Arc::clone(&env.sink);
    let cancel = env.cancel.clone();
    let deadline = env.deadline;

    env.check()?;
    type PipelineOutput = (DaySchedule, f64, Option<MonteCarloResult>);
    let handle = tokio::task::spawn_blocking(move || -> Result<PipelineOutput, JobError> {
        let ctx = ScheduleContext {
            pool: &pool,
            matrix: &matrix,
            options: &options,
        };
        let control = SearchControl {
            cancel: cancel.clone(),
            deadline,
        };

        control_check(&control)?;
        emit_progress(&sink, job_id, OptimizerPhase::BuildingChains, 35, "building chains");
        let builder = ChainBuilder::new(&ctx);
        let entry_chains = builder.build(RouteKind::Entry);
        control_check(&control)?;
        let exit_chains = builder.build(RouteKind::Exit);

        control_check(&control)?;
        emit_progress(&sink, job_id, OptimizerPhase::MatchingBlocks, 60, "matching blocks");
        let blocks = BlockMatcher::new(&ctx).matchup(&entry_chains, &exit_chains);
        // Cancellation checkpoint right after the assignment solve
        control_check(&control)?;

        emit_progress(&sink, job_id, OptimizerPhase::LocalSearch, 80, "refining schedule");
        let initial: Vec<Vec<String>> = blocks.into_iter().map(|b| b.route_ids).collect();
        let search_sink = Arc::clone(&sink);
        let outcome = LocalSearch::new(&ctx).refine(initial, &control, &mut |fraction| {
            let progress = 80 + (fraction * 10.0) as u8;
            emit_progress(
                &search_sink,
                job_id,
                OptimizerPhase::LocalSearch,
                progress.min(89),
                "refining schedule",
            );
        })?;

        control_check(&control)?;
        emit_progress(&sink, job_id, OptimizerPhase::Finalizing, 90, "assigning buses");
        let buses = materialize_duties(&outcome.duties, &ctx)?;

        control_check(&control)?;
        emit_progress(
            &sink,
            job_id,
            OptimizerPhase::CalculatingStats,
            95,
            "calculating statistics",
        );
        let items: Vec<Vec<DutyItem>> = buses.iter().map(|b| b.items.clone()).collect();
        let score = Evaluator::new(&ctx).score(&items);
        let schedule = DaySchedule::new(day_key, buses);

        let validation = match &options.validate {
            Some(mc_options) => Some(monte_carlo::validate(&schedule, &ctx, mc_options)),
            None => None,
        };

        Ok((schedule, score, validation))
    });

    let (schedule, score, validation) = handle
        .await
        .map_err(|e| JobError::internal(format!("optimizer task panicked: {}", e)))??;

    info!(
        job_id = %env.job_id,
        buses = schedule.stats.bus_count,
        score,
        "optimization finished"
    );

    Ok(OptimizeResult {
        schedule,
        score,
        validation,
        warnings,
    })
}

fn control_check(control: &SearchControl) -> Result<(), JobError> {
    if control.cancel.is_cancelled() {
        return Err(JobError::Cancelled);
    }
    if let Some(deadline) = control.deadline {
        if Instant::now() >= deadline {
            return Err(JobError::Timeout);
        }
    }
    Ok(())
}

fn emit_progress(
    sink: &Arc<dyn ProgressSink>,
    job_id: Uuid,
    phase: OptimizerPhase,
    progress: u8,
    message: &str,
) {
    sink.publish(ProgressEvent::progress(job_id, phase, progress, message));
}

/// Validate submitted routes and apply the day filter
fn load_routes(routes: Vec<Route>, options: &OptimizerOptions) -> Result<Vec<Route>, JobError> {
    let mut seen = HashSet::new();
    for route in &routes {
        route
            .validate()
            .map_err(|e| JobError::InvalidInput(e.to_string()))?;
        if !seen.insert(route.id.clone()) {
            return Err(JobError::InvalidInput(format!(
                "duplicate route id '{}'",
                route.id
            )));
        }
    }

    let filtered: Vec<Route> = match &options.day {
        Some(day) => {
            if !crate::types::route::DAY_CODES.contains(&day.as_str()) {
                return Err(JobError::InvalidInput(format!("unknown day code '{}'", day)));
            }
            routes.into_iter().filter(|r| r.runs_on(day)).collect()
        }
        None => routes,
    };

    debug!(routes = filtered.len(), "route pool loaded");
    Ok(filtered)
}

/// Prefetch every travel-time pair the optimizer can touch
async fn build_matrix(routes: &[Route], env: &OptimizeEnv) -> Result<TravelTimeMatrix, JobError> {
    let mut matrix = TravelTimeMatrix::new(env.detour_factor, env.speed_kmh);

    let mut pairs: Vec<(&crate::types::Stop, &crate::types::Stop)> = Vec::new();
    for route in routes {
        for w in route.stops.windows(2) {
            pairs.push((&w[0], &w[1]));
        }
    }
    for a in routes {
        for b in routes {
            if a.id != b.id {
                pairs.push((a.last_stop(), b.first_stop()));
            }
        }
    }

    matrix
        .prefetch(env.provider.as_ref(), &pairs)
        .await
        .map_err(|e| JobError::ProviderUnavailable(e.to_string()))?;

    Ok(matrix)
}

/// A route whose duration exceeds its anchor window can never run
fn ensure_anchors_fit(pool: &RoutePool) -> Result<(), JobError> {
    for route in pool.iter() {
        if route.kind == RouteKind::Entry {
            let duration = pool.duration(&route.id);
            let anchor_minutes = time_to_minutes(route.anchor_time);
            if duration > anchor_minutes {
                return Err(JobError::Infeasible(format!(
                    "route '{}' duration {} min exceeds its anchor window",
                    route.id, duration
                )));
            }
        }
    }
    Ok(())
}

/// Sort refined duties and assign stable bus identifiers
fn materialize_duties(
    duties: &[Vec<String>],
    ctx: &ScheduleContext,
) -> Result<Vec<BusDuty>, JobError> {
    let mut materialized: Vec<Vec<DutyItem>> = Vec::with_capacity(duties.len());
    for duty in duties {
        let items = schedule_sequence(duty, ctx)
            .ok_or_else(|| JobError::internal("refined duty failed to retime"))?;
        if !items.is_empty() {
            materialized.push(items);
        }
    }

    materialized.sort_by(|a, b| {
        a[0].start_time
            .cmp(&b[0].start_time)
            .then_with(|| a[0].route_id.cmp(&b[0].route_id))
    });

    Ok(materialized
        .into_iter()
        .enumerate()
        .map(|(i, items)| BusDuty {
            bus_id: format!("bus-{:03}", i + 1),
            items,
        })
        .collect())
}

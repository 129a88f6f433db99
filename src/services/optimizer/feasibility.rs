//! Pairwise feasibility rules for chaining routes on one bus

use chrono::NaiveTime;

use super::ScheduleContext;
use crate::types::schedule::{add_minutes, diff_minutes};
use crate::types::{DutyItem, Route, RouteKind};

/// Successful feasibility check with the numbers the builder needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeasibilityOk {
    /// Deadhead travel from the previous item's last stop
    pub travel_minutes: i32,
    /// Minutes the start is advanced before the natural start
    pub time_shift: i32,
}

/// Why route B cannot follow item A. Rules are evaluated in order; the
/// first failure wins.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum FeasibilityFail {
    #[error("insufficient transition time: needs {required} min, has {available} min")]
    InsufficientTransitionTime { required: i32, available: i32 },
    #[error("anchor window violation: start {start} outside [{earliest}, {latest}]")]
    AnchorWindowViolation {
        start: NaiveTime,
        earliest: NaiveTime,
        latest: NaiveTime,
    },
    #[error("capacity exceeded: demand {demand} over {seats} seats")]
    CapacityExceeded { demand: u32, seats: u32 },
    #[error("unreachable pair: {travel_minutes} min exceeds {limit} min")]
    UnreachablePair { travel_minutes: i32, limit: i32 },
}

/// Decides whether route B can follow duty item A on the same bus
pub struct FeasibilityChecker<'a> {
    ctx: &'a ScheduleContext<'a>,
}

impl<'a> FeasibilityChecker<'a> {
    pub fn new(ctx: &'a ScheduleContext<'a>) -> Self {
        Self { ctx }
    }

    /// Earliest start for route B after item A: A's end plus deadhead
    /// travel plus the global transition buffer
    pub fn earliest_start_after(&self, a: &DutyItem, b: &Route) -> NaiveTime {
        let a_route = self.ctx.route(&a.route_id);
        let travel = self.ctx.travel_minutes(a_route.last_stop(), b.first_stop());
        add_minutes(
            a.end_time,
            travel + self.ctx.options.transition_buffer_minutes,
        )
    }

    /// Allowed start window for route B, ignoring any predecessor.
    /// Entries may be shifted up to `max_time_shift_minutes` earlier than
    /// the natural start; exits always start exactly at their anchor.
    pub fn start_window(&self, b: &Route) -> (NaiveTime, NaiveTime) {
        let natural = self.ctx.natural_start(b);
        match b.kind {
            RouteKind::Entry => (
                add_minutes(natural, -self.ctx.options.max_time_shift_minutes),
                natural,
            ),
            RouteKind::Exit => (natural, natural),
        }
    }

    /// `canFollow(a, b, startTimeB)` — rules in order, first failure wins:
    /// temporal order, anchor window, capacity, deadhead sanity.
    pub fn can_follow(
        &self,
        a: &DutyItem,
        b: &Route,
        start_b: NaiveTime,
    ) -> Result<FeasibilityOk, FeasibilityFail> {
        let a_route = self.ctx.route(&a.route_id);
        let travel = self.ctx.travel_minutes(a_route.last_stop(), b.first_stop());
        let buffer = self.ctx.options.transition_buffer_minutes;

        // 1. Temporal order
        let available = diff_minutes(start_b, a.end_time);
        let required = travel + buffer;
        if available < required {
            return Err(FeasibilityFail::InsufficientTransitionTime {
                required,
                available,
            });
        }

        // 2. Anchor window
        let (earliest, latest) = self.start_window(b);
        if start_b < earliest || start_b > latest {
            return Err(FeasibilityFail::AnchorWindowViolation {
                start: start_b,
                earliest,
                latest,
            });
        }

        // 3. Capacity
        if let Some(seats) = self.ctx.options.bus_seats {
            let demand = b.demand().max(a_route.demand());
            if demand > seats {
                return Err(FeasibilityFail::CapacityExceeded { demand, seats });
            }
        }

        // 4. Deadhead sanity
        let limit = self.ctx.options.max_reasonable_travel_minutes;
        if travel > limit {
            return Err(FeasibilityFail::UnreachablePair {
                travel_minutes: travel,
                limit,
            });
        }

        Ok(FeasibilityOk {
            travel_minutes: travel,
            time_shift: diff_minutes(self.ctx.natural_start(b), start_b).max(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::optimizer::testutil::{ctx_fixture, entry_route, exit_route, CtxFixture};
    use crate::types::schedule::minutes_to_time;

    fn item_for(fixture: &CtxFixture, route: &Route) -> DutyItem {
        let ctx = fixture.ctx();
        let start = ctx.natural_start(route);
        DutyItem {
            route_id: route.id.clone(),
            kind: route.kind,
            start_time: start,
            end_time: add_minutes(start, ctx.duration(&route.id)),
            time_shift_minutes: 0,
            deadhead_minutes: 0,
        }
    }

    #[test]
    fn test_temporal_order_violation_wins_first() {
        // Two entries anchored at the same minute cannot follow each other
        let a = entry_route("a", (8, 0), 40.0, -3.70);
        let b = entry_route("b", (8, 0), 40.05, -3.72);
        let fixture = ctx_fixture(vec![a.clone(), b.clone()]);
        let ctx = fixture.ctx();
        let checker = FeasibilityChecker::new(&ctx);

        let item = item_for(&fixture, ctx.route("a"));
        let start = ctx.natural_start(ctx.route("b"));
        let result = checker.can_follow(&item, ctx.route("b"), start);

        assert!(matches!(
            result,
            Err(FeasibilityFail::InsufficientTransitionTime { .. })
        ));
    }

    #[test]
    fn test_entry_start_later_than_natural_rejected() {
        let a = entry_route("a", (7, 0), 40.0, -3.70);
        let b = entry_route("b", (9, 0), 40.01, -3.70);
        let fixture = ctx_fixture(vec![a.clone(), b.clone()]);
        let ctx = fixture.ctx();
        let checker = FeasibilityChecker::new(&ctx);

        let item = item_for(&fixture, ctx.route("a"));
        let late = add_minutes(ctx.natural_start(ctx.route("b")), 5);
        let result = checker.can_follow(&item, ctx.route("b"), late);

        assert!(matches!(
            result,
            Err(FeasibilityFail::AnchorWindowViolation { .. })
        ));
    }

    #[test]
    fn test_entry_shift_beyond_cap_rejected() {
        let a = entry_route("a", (6, 30), 40.0, -3.70);
        let b = entry_route("b", (9, 0), 40.01, -3.70);
        let fixture = ctx_fixture(vec![a.clone(), b.clone()]);
        let ctx = fixture.ctx();
        let checker = FeasibilityChecker::new(&ctx);

        let item = item_for(&fixture, ctx.route("a"));
        // 20 minutes earlier than natural with a 15 minute cap
        let early = add_minutes(ctx.natural_start(ctx.route("b")), -20);
        let result = checker.can_follow(&item, ctx.route("b"), early);

        assert!(matches!(
            result,
            Err(FeasibilityFail::AnchorWindowViolation { .. })
        ));
    }

    #[test]
    fn test_capacity_uses_max_of_both_routes() {
        let mut a = entry_route("a", (7, 0), 40.0, -3.70);
        a.capacity = 30;
        let mut b = entry_route("b", (9, 0), 40.01, -3.70);
        b.capacity = 48;
        let mut fixture = ctx_fixture(vec![a.clone(), b.clone()]);
        fixture.options.bus_seats = Some(45);
        let ctx = fixture.ctx();
        let checker = FeasibilityChecker::new(&ctx);

        let item = item_for(&fixture, ctx.route("a"));
        let start = ctx.natural_start(ctx.route("b"));
        let result = checker.can_follow(&item, ctx.route("b"), start);

        assert_eq!(
            result,
            Err(FeasibilityFail::CapacityExceeded {
                demand: 48,
                seats: 45
            })
        );
    }

    #[test]
    fn test_unreachable_pair_beyond_limit() {
        let a = entry_route("a", (7, 0), 40.0, -3.70);
        // ~80 km straight line: beyond the 120 minute cap but still
        // reachable before the anchor, so rule 1 passes first
        let b = entry_route("b", (13, 0), 40.73, -3.70);
        let fixture = ctx_fixture(vec![a.clone(), b.clone()]);
        let ctx = fixture.ctx();
        let checker = FeasibilityChecker::new(&ctx);

        let item = item_for(&fixture, ctx.route("a"));
        let start = ctx.natural_start(ctx.route("b"));
        let result = checker.can_follow(&item, ctx.route("b"), start);

        assert!(matches!(
            result,
            Err(FeasibilityFail::UnreachablePair { .. })
        ));
    }

    #[test]
    fn test_feasible_follow_reports_travel_and_shift() {
        let a = entry_route("a", (7, 0), 40.0, -3.70);
        let b = entry_route("b", (9, 0), 40.02, -3.71);
        let fixture = ctx_fixture(vec![a.clone(), b.clone()]);
        let ctx = fixture.ctx();
        let checker = FeasibilityChecker::new(&ctx);

        let item = item_for(&fixture, ctx.route("a"));
        let natural = ctx.natural_start(ctx.route("b"));
        let ok = checker
            .can_follow(&item, ctx.route("b"), natural)
            .expect("should be feasible");

        assert!(ok.travel_minutes >= 0);
        assert_eq!(ok.time_shift, 0);

        let shifted = checker
            .can_follow(&item, ctx.route("b"), add_minutes(natural, -10))
            .expect("shift within cap is feasible");
        assert_eq!(shifted.time_shift, 10);
    }

    #[test]
    fn test_exit_must_start_exactly_at_anchor() {
        let a = entry_route("a", (8, 0), 40.0, -3.70);
        let b = exit_route("x", (16, 0), 40.01, -3.70);
        let fixture = ctx_fixture(vec![a.clone(), b.clone()]);
        let ctx = fixture.ctx();
        let checker = FeasibilityChecker::new(&ctx);

        let item = item_for(&fixture, ctx.route("a"));
        let anchor = minutes_to_time(16 * 60);
        assert!(checker.can_follow(&item, ctx.route("x"), anchor).is_ok());
        assert!(checker
            .can_follow(&item, ctx.route("x"), add_minutes(anchor, -5))
            .is_err());
    }
}

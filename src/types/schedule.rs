//! Bus duties and the daily timetable

use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

use super::route::RouteKind;

/// Convert NaiveTime to minutes since midnight
pub fn time_to_minutes(time: NaiveTime) -> i32 {
    time.hour() as i32 * 60 + time.minute() as i32
}

/// Convert minutes since midnight to NaiveTime, clamped to the day
pub fn minutes_to_time(minutes: i32) -> NaiveTime {
    let clamped = minutes.clamp(0, 24 * 60 - 1);
    NaiveTime::from_hms_opt((clamped / 60) as u32, (clamped % 60) as u32, 0)
        .unwrap_or_else(|| NaiveTime::from_hms_opt(23, 59, 0).expect("valid time"))
}

/// Add (or subtract) minutes to a time, clamped to the day
pub fn add_minutes(time: NaiveTime, minutes: i32) -> NaiveTime {
    minutes_to_time(time_to_minutes(time) + minutes)
}

/// Signed difference `a - b` in minutes
pub fn diff_minutes(a: NaiveTime, b: NaiveTime) -> i32 {
    time_to_minutes(a) - time_to_minutes(b)
}

/// A single execution of one route by one bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DutyItem {
    pub route_id: String,
    pub kind: RouteKind,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    /// Minutes the start was advanced earlier than the route's natural start
    #[serde(default)]
    pub time_shift_minutes: i32,
    /// Non-service travel from the previous item on the same bus (0 if first)
    #[serde(default)]
    pub deadhead_minutes: i32,
}

/// One bus's work for the day: duty items strictly ordered by start time
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusDuty {
    pub bus_id: String,
    pub items: Vec<DutyItem>,
}

impl BusDuty {
    pub fn first_item(&self) -> &DutyItem {
        &self.items[0]
    }

    pub fn last_item(&self) -> &DutyItem {
        &self.items[self.items.len() - 1]
    }

    /// Minutes between the first departure and the last arrival
    pub fn span_minutes(&self) -> i32 {
        if self.items.is_empty() {
            return 0;
        }
        diff_minutes(self.last_item().end_time, self.first_item().start_time)
    }

    pub fn total_deadhead_minutes(&self) -> i32 {
        self.items.iter().map(|i| i.deadhead_minutes).sum()
    }

    pub fn total_shift_minutes(&self) -> i32 {
        self.items.iter().map(|i| i.time_shift_minutes).sum()
    }
}

/// Aggregate statistics over the duties of one day
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleStats {
    pub bus_count: u32,
    pub entry_count: u32,
    pub exit_count: u32,
    pub items_per_bus_mean: f64,
    pub items_per_bus_median: f64,
    pub items_per_bus_min: u32,
    pub items_per_bus_max: u32,
    /// max − min items per bus
    pub items_per_bus_spread: u32,
    pub total_deadhead_minutes: i32,
    pub total_shift_minutes: i32,
}

/// The timetable for one day
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaySchedule {
    pub day: String,
    pub buses: Vec<BusDuty>,
    pub stats: ScheduleStats,
}

impl DaySchedule {
    pub fn new(day: impl Into<String>, buses: Vec<BusDuty>) -> Self {
        let stats = compute_stats(&buses);
        Self {
            day: day.into(),
            buses,
            stats,
        }
    }

    /// Recompute aggregate statistics after the duties changed
    pub fn refresh_stats(&mut self) {
        self.stats = compute_stats(&self.buses);
    }
}

fn compute_stats(buses: &[BusDuty]) -> ScheduleStats {
    if buses.is_empty() {
        return ScheduleStats::default();
    }

    let mut counts: Vec<u32> = buses.iter().map(|b| b.items.len() as u32).collect();
    counts.sort_unstable();

    let total: u32 = counts.iter().sum();
    let n = counts.len();
    let median = if n % 2 == 1 {
        counts[n / 2] as f64
    } else {
        (counts[n / 2 - 1] + counts[n / 2]) as f64 / 2.0
    };

    let entry_count = buses
        .iter()
        .flat_map(|b| &b.items)
        .filter(|i| i.kind == RouteKind::Entry)
        .count() as u32;
    let exit_count = buses
        .iter()
        .flat_map(|b| &b.items)
        .filter(|i| i.kind == RouteKind::Exit)
        .count() as u32;

    ScheduleStats {
        bus_count: n as u32,
        entry_count,
        exit_count,
        items_per_bus_mean: total as f64 / n as f64,
        items_per_bus_median: median,
        items_per_bus_min: counts[0],
        items_per_bus_max: counts[n - 1],
        items_per_bus_spread: counts[n - 1] - counts[0],
        total_deadhead_minutes: buses.iter().map(|b| b.total_deadhead_minutes()).sum(),
        total_shift_minutes: buses.iter().map(|b| b.total_shift_minutes()).sum(),
    }
}

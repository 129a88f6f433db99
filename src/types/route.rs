//! School routes and stops

use serde::{Deserialize, Serialize};

/// Day codes a route may run on. Opaque alphabet — codes are stored and
/// echoed verbatim, never interpreted as weekday semantics.
pub const DAY_CODES: [&str; 5] = ["L", "M", "Mc", "X", "V"];

/// Coordinates
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

/// A geo-located stop within a route. Immutable input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stop {
    pub id: String,
    pub lat: f64,
    pub lng: f64,
    /// Position within the route's stop sequence
    pub sequence: u32,
    /// Passengers boarding at this stop
    #[serde(default)]
    pub boarding: u32,
    /// Marks the school stop the anchor time refers to
    #[serde(default)]
    pub is_school: bool,
}

impl Stop {
    pub fn coordinates(&self) -> Coordinates {
        Coordinates {
            lat: self.lat,
            lng: self.lng,
        }
    }
}

/// Whether a route delivers pupils to school (entry) or home (exit)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RouteKind {
    /// Morning route — the anchor is the arrival time at school
    Entry,
    /// Afternoon route — the anchor is the departure time from school
    Exit,
}

impl RouteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteKind::Entry => "entry",
            RouteKind::Exit => "exit",
        }
    }
}

/// A pickup/dropoff route: an ordered stop sequence pinned to a school
/// anchor time. Stop order is fixed input; the optimizer never re-routes
/// within a route.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub id: String,
    pub name: String,
    pub school_id: String,
    pub school_name: String,
    pub kind: RouteKind,
    /// Ordered, non-empty stop sequence
    pub stops: Vec<Stop>,
    /// Arrival time at school (entry) or departure time (exit)
    pub anchor_time: chrono::NaiveTime,
    /// Declared peak passenger demand; the effective demand is the max of
    /// this and the peak boardings computed from the stop sequence
    #[serde(default)]
    pub capacity: u32,
    #[serde(default)]
    pub contract_id: Option<String>,
    /// Applicable day codes, subset of {L, M, Mc, X, V}
    #[serde(default)]
    pub days: Vec<String>,
}

/// Input validation failure for a submitted route
#[derive(Debug, thiserror::Error)]
pub enum RouteValidationError {
    #[error("route {0}: stop list is empty")]
    EmptyStops(String),
    #[error("route {0}: no stop is marked as the school stop")]
    MissingSchoolStop(String),
    #[error("route {0}: unknown day code '{1}'")]
    UnknownDayCode(String, String),
    #[error("route {0}: stop {1} has out-of-range coordinates")]
    BadCoordinates(String, String),
}

impl Route {
    pub fn first_stop(&self) -> &Stop {
        &self.stops[0]
    }

    pub fn last_stop(&self) -> &Stop {
        &self.stops[self.stops.len() - 1]
    }

    /// The stop the anchor time refers to
    pub fn school_stop(&self) -> Option<&Stop> {
        self.stops.iter().find(|s| s.is_school)
    }

    /// Peak simultaneous boardings along the stop sequence (running sum;
    /// passengers leave the bus only at the school stop)
    pub fn peak_boardings(&self) -> u32 {
        let mut on_board = 0u32;
        let mut peak = 0u32;
        for stop in &self.stops {
            on_board = on_board.saturating_add(stop.boarding);
            peak = peak.max(on_board);
            if stop.is_school {
                on_board = 0;
            }
        }
        peak
    }

    /// Effective passenger demand used for capacity checks
    pub fn demand(&self) -> u32 {
        self.capacity.max(self.peak_boardings())
    }

    /// Whether the route runs on the given day code
    pub fn runs_on(&self, day: &str) -> bool {
        self.days.iter().any(|d| d == day)
    }

    /// Validate a submitted route. First failure wins.
    pub fn validate(&self) -> Result<(), RouteValidationError> {
        if self.stops.is_empty() {
            return Err(RouteValidationError::EmptyStops(self.id.clone()));
        }
        if self.school_stop().is_none() {
            return Err(RouteValidationError::MissingSchoolStop(self.id.clone()));
        }
        for day in &self.days {
            if !DAY_CODES.contains(&day.as_str()) {
                return Err(RouteValidationError::UnknownDayCode(
                    self.id.clone(),
                    day.clone(),
                ));
            }
        }
        for stop in &self.stops {
            if !(-90.0..=90.0).contains(&stop.lat) || !(-180.0..=180.0).contains(&stop.lng) {
                return Err(RouteValidationError::BadCoordinates(
                    self.id.clone(),
                    stop.id.clone(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn make_stop(id: &str, seq: u32, boarding: u32, is_school: bool) -> Stop {
        Stop {
            id: id.to_string(),
            lat: 40.41,
            lng: -3.70,
            sequence: seq,
            boarding,
            is_school,
        }
    }

    fn make_route(id: &str) -> Route {
        Route {
            id: id.to_string(),
            name: format!("Route {}", id),
            school_id: "school-1".to_string(),
            school_name: "Test School".to_string(),
            kind: RouteKind::Entry,
            stops: vec![
                make_stop("s1", 0, 5, false),
                make_stop("s2", 1, 3, false),
                make_stop("s3", 2, 0, true),
            ],
            anchor_time: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            capacity: 0,
            contract_id: None,
            days: vec!["L".to_string(), "X".to_string()],
        }
    }

    #[test]
    fn test_peak_boardings_accumulates_until_school() {
        let route = make_route("r1");
        assert_eq!(route.peak_boardings(), 8);
    }

    #[test]
    fn test_demand_uses_declared_capacity_when_higher() {
        let mut route = make_route("r1");
        route.capacity = 20;
        assert_eq!(route.demand(), 20);
    }

    #[test]
    fn test_validate_rejects_empty_stops() {
        let mut route = make_route("r1");
        route.stops.clear();
        assert!(matches!(
            route.validate(),
            Err(RouteValidationError::EmptyStops(_))
        ));
    }

    #[test]
    fn test_validate_rejects_unknown_day_code() {
        let mut route = make_route("r1");
        route.days.push("Z".to_string());
        assert!(matches!(
            route.validate(),
            Err(RouteValidationError::UnknownDayCode(_, _))
        ));
    }

    #[test]
    fn test_validate_requires_school_stop() {
        let mut route = make_route("r1");
        for stop in &mut route.stops {
            stop.is_school = false;
        }
        assert!(matches!(
            route.validate(),
            Err(RouteValidationError::MissingSchoolStop(_))
        ));
    }

    #[test]
    fn test_day_codes_preserved_verbatim() {
        let route = make_route("r1");
        let json = serde_json::to_string(&route).unwrap();
        let parsed: Route = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.days, vec!["L", "X"]);
        assert!(parsed.runs_on("X"));
        assert!(!parsed.runs_on("V"));
    }

    #[test]
    fn test_route_deserializes_from_camel_case() {
        let json = r#"{
            "id": "r9",
            "name": "North loop",
            "schoolId": "sch-1",
            "schoolName": "Colegio Norte",
            "kind": "entry",
            "stops": [
                { "id": "a", "lat": 40.0, "lng": -3.0, "sequence": 0, "boarding": 4 },
                { "id": "b", "lat": 40.1, "lng": -3.1, "sequence": 1, "isSchool": true }
            ],
            "anchorTime": "08:00:00",
            "days": ["L"]
        }"#;
        let route: Route = serde_json::from_str(json).unwrap();
        assert_eq!(route.stops.len(), 2);
        assert!(route.stops[1].is_school);
        assert_eq!(route.peak_boardings(), 4);
        assert!(route.validate().is_ok());
    }
}

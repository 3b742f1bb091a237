//! Core domain model and wall-clock arithmetic for flightwatch.

use chrono::{Duration, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "flightwatch-core";

/// Wall-clock format used for every `HH:MM` field.
pub const CLOCK_FORMAT: &str = "%H:%M";

/// Card-like record as extracted by a source adapter. Every field is free text
/// and may be missing when the extractor could not find it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFlightCard {
    #[serde(default)]
    pub flight_number: Option<String>,
    #[serde(default)]
    pub status_text: Option<String>,
    #[serde(default)]
    pub origin_time: Option<String>,
    #[serde(default)]
    pub origin_city: Option<String>,
    #[serde(default)]
    pub destination_time: Option<String>,
    #[serde(default)]
    pub destination_city: Option<String>,
}

/// Closed status vocabulary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlightStatus {
    OnTime,
    Delayed,
    Early,
    InFlight,
    LeftGate,
    Arrived,
    Cancelled,
    #[default]
    Unknown,
}

impl FlightStatus {
    /// Ordered substring rules. Cancellation must win over everything else, so a
    /// "Cancelled - was delayed" card is cancelled, not delayed.
    pub fn classify(text: &str) -> Self {
        let lower = text.to_lowercase();
        if lower.contains("cancelled") || lower.contains("canceled") {
            Self::Cancelled
        } else if lower.contains("in flight") {
            Self::InFlight
        } else if lower.contains("left gate") {
            Self::LeftGate
        } else if lower.contains("arrived") || lower.contains("landed") {
            Self::Arrived
        } else if lower.contains("on time") {
            Self::OnTime
        } else if lower.contains("delayed") {
            Self::Delayed
        } else if lower.contains("early") {
            Self::Early
        } else {
            Self::Unknown
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::OnTime => "On Time",
            Self::Delayed => "Delayed",
            Self::Early => "Early",
            Self::InFlight => "In Flight",
            Self::LeftGate => "Left Gate",
            Self::Arrived => "Arrived",
            Self::Cancelled => "Cancelled",
            Self::Unknown => "Unknown",
        }
    }

    /// Statuses for which a live tracking link makes sense.
    pub fn is_airborne(self) -> bool {
        matches!(self, Self::InFlight | Self::LeftGate)
    }

    /// Statuses after which the flight will not arrive (again).
    pub fn is_final(self) -> bool {
        matches!(self, Self::Arrived | Self::Cancelled)
    }
}

/// Identity of one physical leg.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlightKey {
    pub flight_number: String,
    pub origin_time: String,
    pub destination_time: String,
}

impl std::fmt::Display for FlightKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}->{}",
            self.flight_number, self.origin_time, self.destination_time
        )
    }
}

/// Canonical flight record. Serialized field names are the snapshot file contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "FlightRecord")]
pub struct Flight {
    pub flight_number: String,
    /// Display text; raw source text when the status is unknown.
    #[serde(rename = "flight_status")]
    pub status_text: String,
    pub status: FlightStatus,
    pub origin_scheduled_time: String,
    #[serde(rename = "origin_time")]
    pub origin_actual_time: String,
    pub origin_city: String,
    pub destination_scheduled_time: String,
    #[serde(rename = "destination_time")]
    pub destination_actual_time: String,
    pub destination_city: String,
    #[serde(rename = "fin_number")]
    pub tail_number: Option<String>,
    #[serde(
        rename = "live_tracking_link",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub tracking_url: Option<String>,
}

/// Wire shape of a flight. Older snapshot files carry only `flight_status`.
#[derive(Debug, Deserialize)]
struct FlightRecord {
    flight_number: String,
    flight_status: String,
    #[serde(default)]
    status: Option<FlightStatus>,
    origin_scheduled_time: String,
    origin_time: String,
    origin_city: String,
    destination_scheduled_time: String,
    destination_time: String,
    destination_city: String,
    #[serde(default)]
    fin_number: Option<String>,
    #[serde(default)]
    live_tracking_link: Option<String>,
}

impl From<FlightRecord> for Flight {
    fn from(record: FlightRecord) -> Self {
        let status = record
            .status
            .unwrap_or_else(|| FlightStatus::classify(&record.flight_status));
        Self {
            flight_number: record.flight_number,
            status_text: record.flight_status,
            status,
            origin_scheduled_time: record.origin_scheduled_time,
            origin_actual_time: record.origin_time,
            origin_city: record.origin_city,
            destination_scheduled_time: record.destination_scheduled_time,
            destination_actual_time: record.destination_time,
            destination_city: record.destination_city,
            tail_number: record.fin_number,
            tracking_url: record.live_tracking_link,
        }
    }
}

impl Flight {
    pub fn key(&self) -> FlightKey {
        FlightKey {
            flight_number: self.flight_number.clone(),
            origin_time: self.origin_actual_time.clone(),
            destination_time: self.destination_actual_time.clone(),
        }
    }

    pub fn arrival_clock(&self) -> Option<NaiveTime> {
        parse_clock(&self.destination_actual_time)
    }

    /// Time until landing under the wraparound rule; `None` when the
    /// destination time is not a valid clock.
    pub fn time_until_arrival(&self, now: NaiveDateTime) -> Option<Duration> {
        self.arrival_clock().map(|clock| time_until(now, clock))
    }

    pub fn minutes_until_arrival(&self, now: NaiveDateTime) -> Option<i64> {
        self.time_until_arrival(now).map(whole_minutes_ceil)
    }

    pub fn set_status(&mut self, status: FlightStatus) {
        self.status = status;
        self.status_text = status.label().to_string();
    }
}

/// Result of one pipeline run, persisted wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(rename = "last_updated_at", with = "wall_clock_timestamp")]
    pub generated_at: NaiveDateTime,
    pub total_flights: usize,
    pub next_arrival_flight: Option<Flight>,
    pub flights: Vec<Flight>,
}

impl Snapshot {
    pub fn new(
        generated_at: NaiveDateTime,
        next_arrival_flight: Option<Flight>,
        flights: Vec<Flight>,
    ) -> Self {
        Self {
            generated_at,
            total_flights: flights.len(),
            next_arrival_flight,
            flights,
        }
    }

    pub fn empty(generated_at: NaiveDateTime) -> Self {
        Self::new(generated_at, None, Vec::new())
    }

    pub fn is_consistent(&self) -> bool {
        self.total_flights == self.flights.len()
    }
}

/// `last_updated_at` keeps the `YYYY-MM-DD HH:MM:SS` local text of the
/// original file format.
pub mod wall_clock_timestamp {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    pub fn serialize<S: Serializer>(value: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
        let text = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&text, FORMAT).map_err(serde::de::Error::custom)
    }
}

/// Strict `HH:MM` parse (surrounding whitespace allowed).
pub fn parse_clock(text: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(text.trim(), CLOCK_FORMAT).ok()
}

/// Finds the first `H:MM`/`HH:MM` clock inside free text and returns it
/// zero-padded, e.g. `"Sched. 9:05"` -> `"09:05"`.
pub fn extract_clock(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    for (colon, byte) in bytes.iter().enumerate() {
        if *byte != b':' {
            continue;
        }
        let mut start = colon;
        while start > 0 && colon - start < 2 && bytes[start - 1].is_ascii_digit() {
            start -= 1;
        }
        if start == colon || colon + 2 >= bytes.len() {
            continue;
        }
        if !(bytes[colon + 1].is_ascii_digit() && bytes[colon + 2].is_ascii_digit()) {
            continue;
        }
        let hours: u32 = text[start..colon].parse().ok()?;
        let minutes: u32 = text[colon + 1..colon + 3].parse().ok()?;
        if let Some(clock) = NaiveTime::from_hms_opt(hours, minutes, 0) {
            return Some(clock.format(CLOCK_FORMAT).to_string());
        }
    }
    None
}

/// The instant a wall-clock time refers to: today if not yet passed, else
/// tomorrow.
pub fn arrival_instant(now: NaiveDateTime, clock: NaiveTime) -> NaiveDateTime {
    let today = now.date().and_time(clock);
    if today < now {
        today + Duration::days(1)
    } else {
        today
    }
}

pub fn time_until(now: NaiveDateTime, clock: NaiveTime) -> Duration {
    arrival_instant(now, clock) - now
}

/// Rounds a wait up to whole minutes, so "in 5 minutes" never hides 5m59s.
pub fn whole_minutes_ceil(wait: Duration) -> i64 {
    let seconds = wait.num_seconds();
    seconds.div_euclid(60) + i64::from(seconds.rem_euclid(60) != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 4, 13)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn flight(number: &str, dest_time: &str) -> Flight {
        Flight {
            flight_number: number.into(),
            status_text: "On Time".into(),
            status: FlightStatus::OnTime,
            origin_scheduled_time: "13:00".into(),
            origin_actual_time: "13:00".into(),
            origin_city: "Montreal YUL".into(),
            destination_scheduled_time: dest_time.into(),
            destination_actual_time: dest_time.into(),
            destination_city: "Toronto YTZ".into(),
            tail_number: None,
            tracking_url: None,
        }
    }

    #[test]
    fn cancellation_wins_over_delay() {
        assert_eq!(
            FlightStatus::classify("Delayed - Cancelled"),
            FlightStatus::Cancelled
        );
        assert_eq!(FlightStatus::classify("CANCELED"), FlightStatus::Cancelled);
    }

    #[test]
    fn status_rules_cover_vocabulary() {
        assert_eq!(FlightStatus::classify("In Flight"), FlightStatus::InFlight);
        assert_eq!(FlightStatus::classify("Left gate"), FlightStatus::LeftGate);
        assert_eq!(FlightStatus::classify("Landed 14:02"), FlightStatus::Arrived);
        assert_eq!(FlightStatus::classify("On time"), FlightStatus::OnTime);
        assert_eq!(FlightStatus::classify("Delayed"), FlightStatus::Delayed);
        assert_eq!(FlightStatus::classify("Early"), FlightStatus::Early);
        assert_eq!(FlightStatus::classify("Boarding"), FlightStatus::Unknown);
    }

    #[test]
    fn clock_extraction_pads_and_skips_noise() {
        assert_eq!(extract_clock("Sched. 9:05").as_deref(), Some("09:05"));
        assert_eq!(extract_clock("14:35").as_deref(), Some("14:35"));
        assert_eq!(extract_clock("ratio 3:1 then 22:10").as_deref(), Some("22:10"));
        assert_eq!(extract_clock("25:99"), None);
        assert_eq!(extract_clock("--:--"), None);
        assert_eq!(extract_clock("12:"), None);
    }

    #[test]
    fn wraparound_past_midnight_is_positive() {
        let f = flight("AC123", "00:10");
        assert_eq!(f.minutes_until_arrival(at(23, 50)), Some(20));
    }

    #[test]
    fn exact_now_is_zero_not_tomorrow() {
        let f = flight("AC123", "14:00");
        assert_eq!(f.minutes_until_arrival(at(14, 0)), Some(0));
    }

    #[test]
    fn partial_minutes_round_up() {
        assert_eq!(whole_minutes_ceil(Duration::seconds(5 * 60 + 59)), 6);
        assert_eq!(whole_minutes_ceil(Duration::seconds(30)), 1);
        assert_eq!(whole_minutes_ceil(Duration::seconds(300)), 5);
        assert_eq!(whole_minutes_ceil(Duration::zero()), 0);
    }

    #[test]
    fn past_time_same_day_rolls_to_tomorrow() {
        let f = flight("AC123", "08:00");
        assert_eq!(f.minutes_until_arrival(at(9, 0)), Some(23 * 60));
    }

    #[test]
    fn snapshot_uses_original_field_names() {
        let snapshot = Snapshot::new(at(14, 2), Some(flight("AC123", "15:00")), vec![flight("AC123", "15:00")]);
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["last_updated_at"], "2025-04-13 14:02:00");
        assert_eq!(value["total_flights"], 1);
        assert_eq!(value["next_arrival_flight"]["flight_number"], "AC123");
        assert_eq!(value["flights"][0]["destination_time"], "15:00");
        assert_eq!(value["flights"][0]["status"], "on-time");
        assert!(value["flights"][0]["fin_number"].is_null());
        assert!(value["flights"][0].get("live_tracking_link").is_none());
    }

    #[test]
    fn legacy_flight_without_status_is_classified() {
        let json = r#"{
            "flight_number": "AC8712",
            "flight_status": "In Flight",
            "origin_scheduled_time": "13:00",
            "origin_time": "13:05",
            "origin_city": "Ottawa YOW",
            "destination_scheduled_time": "14:05",
            "destination_time": "14:10",
            "destination_city": "Toronto YTZ",
            "fin_number": "7723",
            "live_tracking_link": "https://www.flightradar24.com/JZA8712"
        }"#;
        let f: Flight = serde_json::from_str(json).unwrap();
        assert_eq!(f.status, FlightStatus::InFlight);
        assert_eq!(f.tail_number.as_deref(), Some("7723"));
        assert_eq!(f.destination_actual_time, "14:10");
    }
}

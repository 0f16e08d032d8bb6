//! Domain model, reference universe and query space for the USPA records pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "uspa-core";

pub const VACANCY_NAME: &str = "No existing record";

/// Added to the numeric value of an unbounded `+` class so it sorts right above its base.
pub const PLUS_CLASS_EPSILON: f64 = 0.01;

pub const DATASET_COLUMNS: [&str; 11] = [
    "Division",
    "Weight Class",
    "Lift",
    "Name",
    "Kilos",
    "Pounds",
    "Date",
    "Location",
    "Event",
    "Status",
    "HasRecord",
];

pub const STATES: [&str; 50] = [
    "alabama",
    "alaska",
    "arizona",
    "arkansas",
    "california",
    "colorado",
    "connecticut",
    "delaware",
    "florida",
    "georgia",
    "hawaii",
    "idaho",
    "illinois",
    "indiana",
    "iowa",
    "kansas",
    "kentucky",
    "louisiana",
    "maine",
    "maryland",
    "massachusetts",
    "michigan",
    "minnesota",
    "mississippi",
    "missouri",
    "montana",
    "nebraska",
    "nevada",
    "new-hampshire",
    "new-jersey",
    "new-mexico",
    "new-york",
    "north-carolina",
    "north-dakota",
    "ohio",
    "oklahoma",
    "oregon",
    "pennsylvania",
    "rhode-island",
    "south-carolina",
    "south-dakota",
    "tennessee",
    "texas",
    "utah",
    "vermont",
    "virginia",
    "washington",
    "west-virginia",
    "wisconsin",
    "wyoming",
];

pub const SPECIAL_LOCATIONS: [&str; 2] = ["national", "ipl-world"];

pub const STATUSES: [&str; 2] = ["drug-tested", "non-tested"];

pub const EVENTS: [&str; 10] = [
    "raw-powerlifting",
    "classic-powerlifting",
    "raw-bench-only",
    "raw-deadlift-only",
    "single-ply-powerlifting",
    "single-ply-bench-only",
    "single-ply-deadlift-only",
    "multi-ply-powerlifting",
    "multi-ply-bench-only",
    "multi-ply-deadlift-only",
];

const MEN_WEIGHT_CLASSES: [&str; 12] = [
    "52kg", "56kg", "60kg", "67.5kg", "75kg", "82.5kg", "90kg", "100kg", "110kg", "125kg",
    "140kg", "140+kg",
];

const WOMEN_WEIGHT_CLASSES: [&str; 12] = [
    "44kg", "48kg", "52kg", "56kg", "60kg", "67.5kg", "75kg", "82.5kg", "90kg", "100kg", "110kg",
    "110+kg",
];

const AGE_BRACKETS: [&str; 15] = [
    "OPEN",
    "JUNIOR 13-15",
    "JUNIOR 16-17",
    "JUNIOR 18-19",
    "JUNIOR 20-23",
    "SUBMASTER 35-39",
    "MASTER 40-44",
    "MASTER 45-49",
    "MASTER 50-54",
    "MASTER 55-59",
    "MASTER 60-64",
    "MASTER 65-69",
    "MASTER 70-74",
    "MASTER 75-79",
    "MASTER 80+",
];

/// All locations in enumeration order: the fifty states, then the special locations.
pub fn default_locations() -> Vec<String> {
    STATES
        .iter()
        .chain(SPECIAL_LOCATIONS.iter())
        .map(|s| s.to_string())
        .collect()
}

pub fn default_statuses() -> Vec<String> {
    STATUSES.iter().map(|s| s.to_string()).collect()
}

pub fn default_events() -> Vec<String> {
    EVENTS.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Query {
    pub location: String,
    pub status: String,
    pub event: String,
}

impl Query {
    pub fn new(
        location: impl Into<String>,
        status: impl Into<String>,
        event: impl Into<String>,
    ) -> Self {
        Self {
            location: location.into(),
            status: status.into(),
            event: event.into(),
        }
    }

    /// Stable single-line serialization used by the checkpoint file.
    pub fn checkpoint_key(&self) -> String {
        format!("{}|{}|{}", self.location, self.status, self.event)
    }

    pub fn from_checkpoint_key(line: &str) -> Option<Self> {
        let mut parts = line.trim().splitn(3, '|');
        let location = parts.next().filter(|s| !s.is_empty())?;
        let status = parts.next().filter(|s| !s.is_empty())?;
        let event = parts.next().filter(|s| !s.is_empty())?;
        Some(Self::new(location, status, event))
    }

    pub fn slug(&self) -> String {
        format!("{}__{}__{}", self.location, self.status, self.event)
    }

    pub fn records_url(&self, base_url: &str) -> String {
        format!(
            "{}?location={}&status={}&event={}",
            base_url, self.location, self.status, self.event
        )
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "location={} status={} event={}",
            self.location, self.status, self.event
        )
    }
}

/// Full cross-product of the given dimensions, location-major.
pub fn query_space(locations: &[String], statuses: &[String], events: &[String]) -> Vec<Query> {
    let mut out = Vec::with_capacity(locations.len() * statuses.len() * events.len());
    for location in locations {
        for status in statuses {
            for event in events {
                out.push(Query::new(location.as_str(), status.as_str(), event.as_str()));
            }
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Lift {
    Squat,
    Bench,
    Deadlift,
    Total,
    Other(String),
}

impl Lift {
    pub const ALL: [Lift; 4] = [Lift::Squat, Lift::Bench, Lift::Deadlift, Lift::Total];

    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "squat" => Lift::Squat,
            "bench" => Lift::Bench,
            "deadlift" => Lift::Deadlift,
            "total" => Lift::Total,
            _ => Lift::Other(trimmed.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Lift::Squat => "Squat",
            Lift::Bench => "Bench",
            Lift::Deadlift => "Deadlift",
            Lift::Total => "TOTAL",
            Lift::Other(s) => s.as_str(),
        }
    }

    /// Sort precedence; unrecognized lifts go last.
    pub fn precedence(&self) -> u8 {
        match self {
            Lift::Squat => 0,
            Lift::Bench => 1,
            Lift::Deadlift => 2,
            Lift::Total => 3,
            Lift::Other(_) => 4,
        }
    }

    pub fn for_event(event: &str) -> Vec<Lift> {
        let event = event.to_ascii_lowercase();
        if event.contains("bench-only") {
            vec![Lift::Bench]
        } else if event.contains("deadlift-only") {
            vec![Lift::Deadlift]
        } else {
            Lift::ALL.to_vec()
        }
    }
}

impl fmt::Display for Lift {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for Lift {
    fn from(value: String) -> Self {
        Lift::parse(&value)
    }
}

impl From<Lift> for String {
    fn from(value: Lift) -> Self {
        value.as_str().to_string()
    }
}

/// "60kg/132.2lb" -> "60kg". The result is the join key for weight classes.
pub fn normalize_weight_class(raw: &str) -> String {
    raw.split('/').next().unwrap_or(raw).trim().to_string()
}

/// Numeric kg value used for ordering. Unparseable classes sort last.
pub fn weight_class_sort_value(weight_class: &str) -> f64 {
    let kg = normalize_weight_class(weight_class).to_ascii_lowercase();
    let number = kg.trim_end_matches("kg").trim();
    let (number, unbounded) = match number.strip_suffix('+') {
        Some(base) => (base.trim(), true),
        None => (number, false),
    };
    match number.parse::<f64>() {
        Ok(value) if unbounded => value + PLUS_CLASS_EPSILON,
        Ok(value) => value,
        Err(_) => f64::INFINITY,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecordRow {
    pub division: String,
    pub weight_class: String,
    pub lift: Lift,
    pub name: String,
    pub kilos: Option<f64>,
    pub pounds: Option<f64>,
    pub date: Option<String>,
}

/// Canonical output row: a real record, a vacancy, or a standalone fetch failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedRecord {
    pub division: Option<String>,
    pub weight_class: Option<String>,
    pub lift: Option<Lift>,
    pub name: Option<String>,
    pub kilos: Option<f64>,
    pub pounds: Option<f64>,
    pub date: Option<String>,
    pub location: String,
    pub event: String,
    pub status: String,
    pub has_record: bool,
}

impl CompletedRecord {
    pub fn real(query: &Query, row: RawRecordRow) -> Self {
        Self {
            weight_class: Some(normalize_weight_class(&row.weight_class)),
            division: Some(row.division),
            lift: Some(row.lift),
            name: Some(row.name),
            kilos: row.kilos,
            pounds: row.pounds,
            date: row.date,
            location: query.location.clone(),
            event: query.event.clone(),
            status: query.status.clone(),
            has_record: true,
        }
    }

    pub fn vacancy(query: &Query, division: &str, weight_class: &str, lift: Lift) -> Self {
        Self {
            division: Some(division.to_string()),
            weight_class: Some(weight_class.to_string()),
            lift: Some(lift),
            name: Some(VACANCY_NAME.to_string()),
            kilos: None,
            pounds: None,
            date: None,
            location: query.location.clone(),
            event: query.event.clone(),
            status: query.status.clone(),
            has_record: false,
        }
    }

    pub fn fetch_failure(query: &Query) -> Self {
        Self {
            division: None,
            weight_class: None,
            lift: None,
            name: None,
            kilos: None,
            pounds: None,
            date: None,
            location: query.location.clone(),
            event: query.event.clone(),
            status: query.status.clone(),
            has_record: false,
        }
    }

    pub fn query(&self) -> Query {
        Query::new(&self.location, &self.status, &self.event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gender {
    Men,
    Women,
    Unisex,
}

impl Gender {
    /// Women marker first: "WOMEN" contains "MEN".
    pub fn infer(division: &str) -> Self {
        let upper = division.to_uppercase();
        if upper.contains("WOMEN") {
            Gender::Women
        } else if upper.contains("MEN") {
            Gender::Men
        } else {
            Gender::Unisex
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("{gender} weight classes: expected 12 entries, found {found}")]
    WeightClassCount { gender: &'static str, found: usize },
    #[error("{gender} weight classes must end in an unbounded '+' class")]
    MissingUnboundedClass { gender: &'static str },
    #[error("expected 30 divisions, found {0}")]
    DivisionCount(usize),
    #[error("duplicate division {0:?}")]
    DuplicateDivision(String),
    #[error("division {0:?} does not carry a gender marker")]
    UngenderedDivision(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainReference {
    pub men_weight_classes: Vec<String>,
    pub women_weight_classes: Vec<String>,
    pub divisions: Vec<String>,
}

impl Default for DomainReference {
    fn default() -> Self {
        Self::standard()
    }
}

impl DomainReference {
    pub fn standard() -> Self {
        let divisions = ["MEN", "WOMEN"]
            .iter()
            .flat_map(|gender| {
                AGE_BRACKETS
                    .iter()
                    .map(move |bracket| format!("{bracket} {gender}"))
            })
            .collect();
        Self {
            men_weight_classes: MEN_WEIGHT_CLASSES.iter().map(|s| s.to_string()).collect(),
            women_weight_classes: WOMEN_WEIGHT_CLASSES.iter().map(|s| s.to_string()).collect(),
            divisions,
        }
    }

    pub fn validate(&self) -> Result<(), ReferenceError> {
        for (gender, classes) in [
            ("men", &self.men_weight_classes),
            ("women", &self.women_weight_classes),
        ] {
            if classes.len() != 12 {
                return Err(ReferenceError::WeightClassCount {
                    gender,
                    found: classes.len(),
                });
            }
            if !classes.last().is_some_and(|c| c.contains('+')) {
                return Err(ReferenceError::MissingUnboundedClass { gender });
            }
        }

        if self.divisions.len() != 30 {
            return Err(ReferenceError::DivisionCount(self.divisions.len()));
        }
        let mut seen = std::collections::HashSet::new();
        for division in &self.divisions {
            if !seen.insert(division.to_uppercase()) {
                return Err(ReferenceError::DuplicateDivision(division.clone()));
            }
            if Gender::infer(division) == Gender::Unisex {
                return Err(ReferenceError::UngenderedDivision(division.clone()));
            }
        }
        Ok(())
    }

    pub fn is_known_division(&self, division: &str) -> bool {
        self.divisions
            .iter()
            .any(|known| known.eq_ignore_ascii_case(division.trim()))
    }

    /// Weight classes for a division by gender inference.
    ///
    /// Divisions without a gender marker get the union of both lists, without
    /// duplicates, ordered by kg value.
    pub fn weight_classes_for(&self, division: &str) -> Vec<String> {
        match Gender::infer(division) {
            Gender::Men => self.men_weight_classes.clone(),
            Gender::Women => self.women_weight_classes.clone(),
            Gender::Unisex => {
                let mut union = self.men_weight_classes.clone();
                for class in &self.women_weight_classes {
                    if !union.contains(class) {
                        union.push(class.clone());
                    }
                }
                union.sort_by(|a, b| {
                    weight_class_sort_value(a).total_cmp(&weight_class_sort_value(b))
                });
                union
            }
        }
    }
}

use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::geo::{Coordinate, Located};
use crate::geocoding::{GeocodeResult, Geocoder};
use crate::visits::{NewVisit, VisitMethod};

const E7: f64 = 1e7;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationPoint {
    pub coordinate: Coordinate,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub sample_stride: usize,
    pub pacing_every: usize,
    pub pacing_delay: Duration,
}

impl ImportOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            sample_stride: config.import_sample_stride.max(1),
            pacing_every: config.geocode_pacing_every.max(1),
            pacing_delay: Duration::from_millis(config.geocode_pacing_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportProgress {
    pub processed: usize,
    pub total: usize,
    pub detected: usize,
}

impl ImportProgress {
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        ((self.processed * 100) / self.total).min(100) as u8
    }
}

pub type ImportObserver = Arc<dyn Fn(ImportProgress) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportCandidate {
    pub lat: f64,
    pub lng: f64,
    pub timestamp: DateTime<Utc>,
    pub place: GeocodeResult,
}

impl ImportCandidate {
    pub fn key(&self) -> (&str, &str) {
        (self.place.city.as_str(), self.place.country.as_str())
    }

    pub fn to_new_visit(&self) -> NewVisit {
        NewVisit::from_place(
            self.coordinate(),
            self.place.clone(),
            VisitMethod::Imported,
            self.timestamp,
        )
    }
}

impl Located for ImportCandidate {
    fn coordinate(&self) -> Coordinate {
        Coordinate {
            lat: self.lat,
            lng: self.lng,
        }
    }
}

pub fn parse_location_history(bytes: &[u8]) -> AppResult<Vec<LocationPoint>> {
    let document: Value = serde_json::from_slice(bytes)
        .map_err(|err| AppError::Parse(format!("invalid location history JSON: {err}")))?;

    if let Some(locations) = document.get("locations").and_then(Value::as_array) {
        let points: Vec<LocationPoint> = locations.iter().filter_map(parse_raw_location).collect();
        debug!(
            target: "import",
            entries = locations.len(),
            points = points.len(),
            "parsed raw location history"
        );
        return Ok(points);
    }

    if let Some(objects) = document.get("timelineObjects").and_then(Value::as_array) {
        let points: Vec<LocationPoint> = objects.iter().filter_map(parse_place_visit).collect();
        debug!(
            target: "import",
            entries = objects.len(),
            points = points.len(),
            "parsed semantic location history"
        );
        return Ok(points);
    }

    Ok(Vec::new())
}

fn parse_raw_location(entry: &Value) -> Option<LocationPoint> {
    let coordinate = e7_coordinate(entry)?;
    let timestamp = entry
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(parse_rfc3339)
        .or_else(|| entry.get("timestampMs").and_then(parse_millis))
        .unwrap_or_else(Utc::now);
    Some(LocationPoint {
        coordinate,
        timestamp,
    })
}

fn parse_place_visit(object: &Value) -> Option<LocationPoint> {
    let visit = object.get("placeVisit")?;
    let coordinate = e7_coordinate(visit.get("location")?)?;
    let timestamp = visit
        .pointer("/duration/startTimestamp")
        .and_then(Value::as_str)
        .and_then(parse_rfc3339)
        .unwrap_or_else(Utc::now);
    Some(LocationPoint {
        coordinate,
        timestamp,
    })
}

fn e7_coordinate(value: &Value) -> Option<Coordinate> {
    let lat = value.get("latitudeE7").and_then(Value::as_f64)? / E7;
    let lng = value.get("longitudeE7").and_then(Value::as_f64)? / E7;
    Coordinate::new(lat, lng).ok()
}

fn parse_rfc3339(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|stamp| stamp.with_timezone(&Utc))
}

// Exports write the epoch milliseconds as a string; accept a number as well.
fn parse_millis(value: &Value) -> Option<DateTime<Utc>> {
    let millis = match value {
        Value::String(raw) => raw.trim().parse::<i64>().ok()?,
        Value::Number(number) => number.as_i64()?,
        _ => return None,
    };
    Utc.timestamp_millis_opt(millis).single()
}

pub fn sample_points(points: &[LocationPoint], stride: usize) -> Vec<LocationPoint> {
    let stride = stride.max(1);
    points
        .iter()
        .enumerate()
        .filter(|(index, _)| index % stride == 0)
        .map(|(_, point)| point.clone())
        .collect()
}

pub async fn detect_places(
    geocoder: &Geocoder,
    points: &[LocationPoint],
    options: &ImportOptions,
    observer: Option<ImportObserver>,
    cancel_flag: Option<Arc<AtomicBool>>,
) -> AppResult<Vec<ImportCandidate>> {
    let total = points.len();
    let pacing_every = options.pacing_every.max(1);
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut candidates = Vec::new();

    for (index, point) in points.iter().enumerate() {
        if let Some(flag) = &cancel_flag {
            if flag.load(Ordering::SeqCst) {
                info!(target: "import", processed = index, total, "place detection cancelled");
                return Err(AppError::Cancelled);
            }
        }

        let place = geocoder.reverse_geocode(point.coordinate).await;
        if seen.insert((place.city.clone(), place.country.clone())) {
            candidates.push(ImportCandidate {
                lat: point.coordinate.lat,
                lng: point.coordinate.lng,
                timestamp: point.timestamp,
                place,
            });
        }

        if index % pacing_every == 0 && !options.pacing_delay.is_zero() {
            tokio::time::sleep(options.pacing_delay).await;
        }

        if let Some(callback) = &observer {
            callback(ImportProgress {
                processed: index + 1,
                total,
                detected: candidates.len(),
            });
        }
    }

    info!(
        target: "import",
        sampled = total,
        detected = candidates.len(),
        "place detection finished"
    );
    Ok(candidates)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportSelection {
    candidates: Vec<ImportCandidate>,
    selected: BTreeSet<usize>,
}

impl ImportSelection {
    pub fn new(candidates: Vec<ImportCandidate>) -> Self {
        let selected = (0..candidates.len()).collect();
        Self {
            candidates,
            selected,
        }
    }

    pub fn candidates(&self) -> &[ImportCandidate] {
        &self.candidates
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn is_selected(&self, index: usize) -> bool {
        self.selected.contains(&index)
    }

    pub fn selected_count(&self) -> usize {
        self.selected.len()
    }

    pub fn toggle(&mut self, index: usize) -> Option<bool> {
        if index >= self.candidates.len() {
            return None;
        }
        if self.selected.remove(&index) {
            Some(false)
        } else {
            self.selected.insert(index);
            Some(true)
        }
    }

    pub fn toggle_all(&mut self) {
        if self.selected.len() == self.candidates.len() {
            self.selected.clear();
        } else {
            self.selected = (0..self.candidates.len()).collect();
        }
    }

    pub fn selected(&self) -> Vec<&ImportCandidate> {
        self.selected
            .iter()
            .filter_map(|index| self.candidates.get(*index))
            .collect()
    }
}

pub fn read_import_file(path: &Path) -> AppResult<Vec<u8>> {
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if !is_json {
        return Err(AppError::Parse(format!(
            "unsupported import file {}; expected a .json export",
            path.display()
        )));
    }
    Ok(std::fs::read(path)?)
}

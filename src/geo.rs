use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult};

pub const EARTH_RADIUS_KM: f64 = 6371.0;

pub const DEFAULT_DUPLICATE_THRESHOLD_DEG: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lng: f64) -> AppResult<Self> {
        if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
            return Err(AppError::Parse(format!("latitude out of range: {lat}")));
        }
        if !lng.is_finite() || !(-180.0..=180.0).contains(&lng) {
            return Err(AppError::Parse(format!("longitude out of range: {lng}")));
        }
        Ok(Self { lat, lng })
    }
}

pub trait Located {
    fn coordinate(&self) -> Coordinate;
}

impl Located for Coordinate {
    fn coordinate(&self) -> Coordinate {
        *self
    }
}

pub fn haversine_km(a: Coordinate, b: Coordinate) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();
    let h = (d_lat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_KM * c
}

pub fn haversine_m(a: Coordinate, b: Coordinate) -> f64 {
    haversine_km(a, b) * 1000.0
}

// per-axis box test, not a distance
pub fn is_duplicate_location<'a, T, I>(candidate: Coordinate, existing: I, threshold_deg: f64) -> bool
where
    T: Located + 'a,
    I: IntoIterator<Item = &'a T>,
{
    existing.into_iter().any(|point| {
        let other = point.coordinate();
        (candidate.lat - other.lat).abs() < threshold_deg
            && (candidate.lng - other.lng).abs() < threshold_deg
    })
}

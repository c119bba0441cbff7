use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult};
use crate::geo::{Coordinate, Located};
use crate::geocoding::GeocodeResult;

pub const VISITS_COLLECTION: &str = "visits";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VisitMethod {
    #[serde(rename = "GPS")]
    Gps,
    #[serde(rename = "IP")]
    Ip,
    Imported,
    #[serde(rename = "Auto-tracked")]
    AutoTracked,
}

impl VisitMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            VisitMethod::Gps => "GPS",
            VisitMethod::Ip => "IP",
            VisitMethod::Imported => "Imported",
            VisitMethod::AutoTracked => "Auto-tracked",
        }
    }

    pub fn parse(value: &str) -> AppResult<Self> {
        match value.trim() {
            "GPS" => Ok(VisitMethod::Gps),
            "IP" => Ok(VisitMethod::Ip),
            "Imported" => Ok(VisitMethod::Imported),
            "Auto-tracked" => Ok(VisitMethod::AutoTracked),
            other => Err(AppError::Parse(format!("unknown visit method: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewVisit {
    pub lat: f64,
    pub lng: f64,
    pub city: String,
    pub state: String,
    pub country: String,
    pub formatted: String,
    pub method: VisitMethod,
    pub timestamp: DateTime<Utc>,
}

impl NewVisit {
    pub fn from_place(
        coordinate: Coordinate,
        place: GeocodeResult,
        method: VisitMethod,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            lat: coordinate.lat,
            lng: coordinate.lng,
            city: place.city,
            state: place.state,
            country: place.country,
            formatted: place.formatted,
            method,
            timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Visit {
    pub id: String,
    pub user_id: String,
    pub lat: f64,
    pub lng: f64,
    pub city: String,
    pub state: String,
    pub country: String,
    pub formatted: String,
    pub method: VisitMethod,
    pub timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Visit {
    pub fn from_new(
        id: String,
        user_id: String,
        visit: NewVisit,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            user_id,
            lat: visit.lat,
            lng: visit.lng,
            city: visit.city,
            state: visit.state,
            country: visit.country,
            formatted: visit.formatted,
            method: visit.method,
            timestamp: visit.timestamp,
            created_at,
        }
    }
}

impl Located for Visit {
    fn coordinate(&self) -> Coordinate {
        Coordinate {
            lat: self.lat,
            lng: self.lng,
        }
    }
}

#[async_trait]
pub trait VisitStore: Send + Sync {
    async fn create_visit(&self, user_id: &str, visit: &NewVisit) -> AppResult<Visit>;

    async fn list_visits(&self, user_id: &str) -> AppResult<Vec<Visit>>;

    async fn delete_visit(&self, visit_id: &str) -> AppResult<()>;
}

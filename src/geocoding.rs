use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::geo::Coordinate;

pub const UNKNOWN: &str = "Unknown";
pub const UNKNOWN_LOCATION: &str = "Unknown location";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GeocodeResult {
    pub country: String,
    pub state: String,
    pub city: String,
    pub formatted: String,
}

impl GeocodeResult {
    pub fn unknown() -> Self {
        Self {
            country: UNKNOWN.into(),
            state: UNKNOWN.into(),
            city: UNKNOWN.into(),
            formatted: UNKNOWN_LOCATION.into(),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.country == UNKNOWN && self.city == UNKNOWN
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IpLocation {
    pub coordinate: Coordinate,
    pub place: GeocodeResult,
}

#[async_trait]
pub trait ReverseGeocoder: Send + Sync {
    async fn lookup(&self, coordinate: Coordinate) -> AppResult<GeocodeResult>;
}

#[async_trait]
pub trait IpLocator: Send + Sync {
    async fn locate(&self) -> AppResult<IpLocation>;
}

#[derive(Clone)]
pub struct Geocoder {
    reverse: Arc<dyn ReverseGeocoder>,
    ip: Arc<dyn IpLocator>,
}

impl Geocoder {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let http = config.http_client()?;

        let reverse: Arc<dyn ReverseGeocoder> = match config.opencage_api_key.clone() {
            Some(key) => Arc::new(OpenCageClient::new(
                http.clone(),
                config.opencage_api_url.clone(),
                key,
            )),
            None => {
                warn!(
                    target: "geocoding",
                    "OPENCAGE_API_KEY not set; reverse geocoding will report unknown places"
                );
                Arc::new(UnconfiguredGeocoder)
            }
        };
        let ip = Arc::new(IpApiClient::new(http, config.ip_geolocation_url.clone()));
        Ok(Self { reverse, ip })
    }

    pub fn from_parts(reverse: Arc<dyn ReverseGeocoder>, ip: Arc<dyn IpLocator>) -> Self {
        Self { reverse, ip }
    }

    pub async fn reverse_geocode(&self, coordinate: Coordinate) -> GeocodeResult {
        match self.reverse.lookup(coordinate).await {
            Ok(place) => place,
            Err(err) => {
                warn!(
                    target: "geocoding",
                    error = %err,
                    lat = coordinate.lat,
                    lng = coordinate.lng,
                    "reverse geocoding failed; using unknown place"
                );
                GeocodeResult::unknown()
            }
        }
    }

    pub async fn location_from_ip(&self) -> AppResult<IpLocation> {
        self.ip.locate().await.map_err(|err| {
            warn!(target: "geocoding", error = %err, "IP geolocation failed");
            err
        })
    }
}

struct UnconfiguredGeocoder;

#[async_trait]
impl ReverseGeocoder for UnconfiguredGeocoder {
    async fn lookup(&self, _coordinate: Coordinate) -> AppResult<GeocodeResult> {
        Err(AppError::Config("reverse geocoding API key missing".into()))
    }
}

pub struct OpenCageClient {
    http: Client,
    endpoint: String,
    api_key: SecretString,
}

impl OpenCageClient {
    pub fn new(http: Client, endpoint: String, api_key: SecretString) -> Self {
        Self {
            http,
            endpoint,
            api_key,
        }
    }
}

#[async_trait]
impl ReverseGeocoder for OpenCageClient {
    async fn lookup(&self, coordinate: Coordinate) -> AppResult<GeocodeResult> {
        #[derive(Deserialize)]
        struct Response {
            #[serde(default)]
            results: Vec<ResponseResult>,
        }

        #[derive(Deserialize)]
        struct ResponseResult {
            #[serde(default)]
            components: Components,
            formatted: Option<String>,
        }

        #[derive(Deserialize, Default)]
        struct Components {
            country: Option<String>,
            state: Option<String>,
            region: Option<String>,
            county: Option<String>,
            city: Option<String>,
            town: Option<String>,
            village: Option<String>,
            suburb: Option<String>,
        }

        let query = format!("{} {}", coordinate.lat, coordinate.lng);
        let response = self
            .http
            .get(&self.endpoint)
            .query(&[
                ("q", query.as_str()),
                ("key", self.api_key.expose_secret()),
                ("pretty", "1"),
            ])
            .send()
            .await?
            .error_for_status()?;

        let parsed: Response = response.json().await?;
        let first = parsed
            .results
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Service {
                service: "opencage",
                message: "no results found".into(),
            })?;

        let c = first.components;
        let place = GeocodeResult {
            country: first_present([c.country]).unwrap_or_else(|| UNKNOWN.into()),
            state: first_present([c.state, c.region, c.county]).unwrap_or_else(|| UNKNOWN.into()),
            city: first_present([c.city, c.town, c.village, c.suburb])
                .unwrap_or_else(|| UNKNOWN.into()),
            formatted: first_present([first.formatted])
                .unwrap_or_else(|| UNKNOWN_LOCATION.into()),
        };
        debug!(
            target: "geocoding",
            city = %place.city,
            country = %place.country,
            "reverse geocoded coordinate"
        );
        Ok(place)
    }
}

pub struct IpApiClient {
    http: Client,
    endpoint: String,
}

impl IpApiClient {
    pub fn new(http: Client, endpoint: String) -> Self {
        Self { http, endpoint }
    }
}

#[async_trait]
impl IpLocator for IpApiClient {
    async fn locate(&self) -> AppResult<IpLocation> {
        #[derive(Deserialize)]
        struct Response {
            #[serde(default)]
            error: bool,
            reason: Option<String>,
            latitude: Option<f64>,
            longitude: Option<f64>,
            city: Option<String>,
            region: Option<String>,
            country_name: Option<String>,
        }

        let response = self
            .http
            .get(&self.endpoint)
            .send()
            .await?
            .error_for_status()?;
        let parsed: Response = response.json().await?;

        if parsed.error {
            return Err(AppError::Service {
                service: "ipapi",
                message: parsed.reason.unwrap_or_else(|| "lookup rejected".into()),
            });
        }

        let (lat, lng) = match (parsed.latitude, parsed.longitude) {
            (Some(lat), Some(lng)) => (lat, lng),
            _ => {
                return Err(AppError::Parse(
                    "IP geolocation response missing coordinates".into(),
                ))
            }
        };
        let coordinate = Coordinate::new(lat, lng)?;

        let city = first_present([parsed.city]).unwrap_or_else(|| UNKNOWN.into());
        let state = first_present([parsed.region]).unwrap_or_else(|| UNKNOWN.into());
        let country = first_present([parsed.country_name]).unwrap_or_else(|| UNKNOWN.into());
        Ok(IpLocation {
            coordinate,
            place: GeocodeResult {
                formatted: format!("{city}, {state}, {country}"),
                country,
                state,
                city,
            },
        })
    }
}

fn first_present<const N: usize>(candidates: [Option<String>; N]) -> Option<String> {
    candidates
        .into_iter()
        .flatten()
        .find(|value| !value.trim().is_empty())
}

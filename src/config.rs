use std::time::Duration;
use std::{env, io};

use reqwest::Client;
use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

use crate::errors::AppResult;

const DEFAULT_OPENCAGE_API_URL: &str = "https://api.opencagedata.com/geocode/v1/json";
const DEFAULT_IP_GEOLOCATION_URL: &str = "https://ipapi.co/json/";
const DEFAULT_FIREBASE_AUTH_ENDPOINT: &str = "https://identitytoolkit.googleapis.com/v1";
const DEFAULT_FIREBASE_TOKEN_ENDPOINT: &str = "https://securetoken.googleapis.com/v1/token";
const DEFAULT_FIRESTORE_API_BASE: &str = "https://firestore.googleapis.com/v1";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub opencage_api_key: Option<SecretString>,
    pub opencage_api_url: String,
    pub ip_geolocation_url: String,
    pub firebase_api_key: Option<SecretString>,
    pub firebase_project_id: Option<String>,
    pub firebase_auth_endpoint: String,
    pub firebase_token_endpoint: String,
    pub firestore_api_base: String,
    pub database_file_name: String,
    pub http_timeout_secs: u64,
    pub duplicate_threshold_deg: f64,
    pub tracking_min_distance_m: f64,
    pub tracking_interval_ms: u64,
    pub import_sample_stride: usize,
    pub geocode_pacing_every: usize,
    pub geocode_pacing_delay_ms: u64,
    pub notice_capacity: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub opencage_api_url: String,
    pub ip_geolocation_url: String,
    pub firebase_project_id: Option<String>,
    pub database_file_name: String,
    pub duplicate_threshold_deg: f64,
    pub tracking_min_distance_m: f64,
    pub import_sample_stride: usize,
    pub has_opencage_key: bool,
    pub has_firebase_key: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            opencage_api_key: None,
            opencage_api_url: DEFAULT_OPENCAGE_API_URL.into(),
            ip_geolocation_url: DEFAULT_IP_GEOLOCATION_URL.into(),
            firebase_api_key: None,
            firebase_project_id: None,
            firebase_auth_endpoint: DEFAULT_FIREBASE_AUTH_ENDPOINT.into(),
            firebase_token_endpoint: DEFAULT_FIREBASE_TOKEN_ENDPOINT.into(),
            firestore_api_base: DEFAULT_FIRESTORE_API_BASE.into(),
            database_file_name: "mapme.db".into(),
            http_timeout_secs: 10,
            duplicate_threshold_deg: 0.01,
            tracking_min_distance_m: 1000.0,
            tracking_interval_ms: 300_000,
            import_sample_stride: 10,
            geocode_pacing_every: 5,
            geocode_pacing_delay_ms: 100,
            notice_capacity: 20,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let defaults = Self::default();
        Self {
            opencage_api_key: parse_secret("OPENCAGE_API_KEY"),
            opencage_api_url: parse_string("OPENCAGE_API_URL", &defaults.opencage_api_url),
            ip_geolocation_url: parse_string("IP_GEOLOCATION_URL", &defaults.ip_geolocation_url),
            firebase_api_key: parse_secret("FIREBASE_API_KEY"),
            firebase_project_id: env::var("FIREBASE_PROJECT_ID")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            firebase_auth_endpoint: parse_string(
                "FIREBASE_AUTH_ENDPOINT",
                &defaults.firebase_auth_endpoint,
            ),
            firebase_token_endpoint: parse_string(
                "FIREBASE_TOKEN_ENDPOINT",
                &defaults.firebase_token_endpoint,
            ),
            firestore_api_base: parse_string("FIRESTORE_API_BASE", &defaults.firestore_api_base),
            database_file_name: parse_string("DATABASE_FILE_NAME", &defaults.database_file_name),
            http_timeout_secs: parse_num("HTTP_TIMEOUT_SECS", defaults.http_timeout_secs).max(1),
            duplicate_threshold_deg: parse_positive(
                "DUPLICATE_THRESHOLD_DEG",
                defaults.duplicate_threshold_deg,
            ),
            tracking_min_distance_m: parse_num(
                "TRACKING_MIN_DISTANCE_M",
                defaults.tracking_min_distance_m,
            ),
            tracking_interval_ms: parse_num("TRACKING_INTERVAL_MS", defaults.tracking_interval_ms),
            import_sample_stride: parse_num("IMPORT_SAMPLE_STRIDE", defaults.import_sample_stride)
                .max(1),
            geocode_pacing_every: parse_num("GEOCODE_PACING_EVERY", defaults.geocode_pacing_every)
                .max(1),
            geocode_pacing_delay_ms: parse_num(
                "GEOCODE_PACING_DELAY_MS",
                defaults.geocode_pacing_delay_ms,
            ),
            notice_capacity: parse_num("NOTICE_CAPACITY", defaults.notice_capacity).max(1),
        }
    }

    pub fn http_client(&self) -> AppResult<Client> {
        Ok(Client::builder()
            .user_agent(concat!("mapme/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(self.http_timeout_secs))
            .build()?)
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            opencage_api_url: self.opencage_api_url.clone(),
            ip_geolocation_url: self.ip_geolocation_url.clone(),
            firebase_project_id: self.firebase_project_id.clone(),
            database_file_name: self.database_file_name.clone(),
            duplicate_threshold_deg: self.duplicate_threshold_deg,
            tracking_min_distance_m: self.tracking_min_distance_m,
            import_sample_stride: self.import_sample_stride,
            has_opencage_key: self.opencage_api_key.is_some(),
            has_firebase_key: self.firebase_api_key.is_some(),
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_num<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn parse_positive(key: &str, default: f64) -> f64 {
    let value = parse_num(key, default);
    if value.is_finite() && value > 0.0 {
        value
    } else {
        default
    }
}

fn parse_string(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_secret(key: &str) -> Option<SecretString> {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(SecretString::from)
}

#[cfg(test)]
pub(crate) fn test_config() -> AppConfig {
    AppConfig {
        database_file_name: "test.db".into(),
        http_timeout_secs: 5,
        geocode_pacing_delay_ms: 0,
        ..AppConfig::default()
    }
}

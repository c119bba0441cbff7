pub mod auth;
pub mod config;
pub mod errors;
pub mod firebase;
pub mod geo;
pub mod geocoding;
pub mod import;
pub mod notifications;
pub mod secrets;
pub mod settings;
pub mod shell;
pub mod stats;
pub mod storage;
pub mod tracking;
pub mod visits;

use std::path::Path;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::firebase::{FirebaseAuth, FirestoreVisits};
use crate::geocoding::Geocoder;
use crate::notifications::{LogNotificationSink, NotificationSink, Notifier};
use crate::settings::{settings_path, TrackingSettings};
use crate::storage::{open_local_store, LocalStore, SqliteKeyValueStore};
use crate::tracking::{ChannelPositionSource, LocationTracker, PositionSource};

pub use crate::config::AppConfig;
pub use crate::errors::{AppError, AppResult};
pub use crate::secrets::SecretVault;
pub use crate::shell::{AddVisitOutcome, ImportReport, ShellServices, StorageReport, TravelMap};

pub const VAULT_SERVICE_NAME: &str = "MapMe";

pub fn initialize(
    data_dir: impl AsRef<Path>,
    config: AppConfig,
    vault: SecretVault,
    positions: Arc<dyn PositionSource>,
    notifications: Arc<dyn NotificationSink>,
) -> AppResult<TravelMap> {
    init_tracing();
    let data_dir = data_dir.as_ref();
    std::fs::create_dir_all(data_dir)?;

    let LocalStore {
        connection,
        path,
        key_lifecycle,
        recovered,
    } = open_local_store(data_dir, &config.database_file_name, &vault)?;
    let local_state = Arc::new(SqliteKeyValueStore::new(Arc::new(Mutex::new(connection))));

    let settings_file = settings_path(data_dir);
    let settings = TrackingSettings::load(&settings_file, &config)?;
    let tracker = LocationTracker::new(
        positions.clone(),
        local_state,
        notifications,
        settings,
        settings_file,
    );

    let auth = Arc::new(FirebaseAuth::new(&config, vault)?);
    let visits = Arc::new(FirestoreVisits::new(&config, auth.clone())?);
    let geocoder = Geocoder::new(&config)?;
    let notifier = Notifier::new(&config);

    info!(
        target: "startup",
        data_dir = %data_dir.display(),
        key_lifecycle = key_lifecycle.as_str(),
        recovered,
        "mapme initialised"
    );

    let storage = StorageReport {
        database_path: path.to_string_lossy().to_string(),
        key_lifecycle: key_lifecycle.as_str().to_string(),
        recovered,
    };
    Ok(TravelMap::new(
        config,
        ShellServices {
            auth,
            visits,
            geocoder,
            positions,
            tracker,
            notifier,
            storage,
        },
    ))
}

pub fn initialize_from_env(data_dir: impl AsRef<Path>) -> AppResult<TravelMap> {
    initialize(
        data_dir,
        AppConfig::from_env(),
        SecretVault::new(VAULT_SERVICE_NAME),
        Arc::new(ChannelPositionSource::unavailable()),
        Arc::new(LogNotificationSink),
    )
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,mapme=debug"));
        // a host may have installed its own subscriber already
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init();
    });
}

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::{AuthProvider, AuthUser};
use crate::config::{AppConfig, PublicAppConfig};
use crate::errors::{AppError, AppResult};
use crate::geo::{is_duplicate_location, Coordinate};
use crate::geocoding::{GeocodeResult, Geocoder};
use crate::import::{
    detect_places, parse_location_history, read_import_file, sample_points, ImportObserver,
    ImportOptions, ImportSelection,
};
use crate::notifications::Notifier;
use crate::settings::{TrackingSettings, UpdateTrackingSettingsPayload};
use crate::stats::{self, TimelineEntry, TravelSummary};
use crate::tracking::{
    LocationTracker, PositionSource, TrackingCallback, TrackingStatus, TrackingUpdate,
    WatchOptions,
};
use crate::visits::{NewVisit, Visit, VisitMethod, VisitStore};

#[derive(Debug, Clone, PartialEq)]
pub enum AddVisitOutcome {
    Saved(Visit),
    Duplicate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub imported: usize,
    pub duplicates: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellTrackingStatus {
    #[serde(flatten)]
    pub tracker: TrackingStatus,
    pub auto_detected_count: usize,
    pub last_detected_place: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageReport {
    pub database_path: String,
    pub key_lifecycle: String,
    pub recovered: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellStatus {
    pub user: Option<AuthUser>,
    pub visit_count: usize,
    pub busy: bool,
    pub tracking: ShellTrackingStatus,
    pub storage: StorageReport,
    pub config: PublicAppConfig,
}

pub struct ShellServices {
    pub auth: Arc<dyn AuthProvider>,
    pub visits: Arc<dyn VisitStore>,
    pub geocoder: Geocoder,
    pub positions: Arc<dyn PositionSource>,
    pub tracker: LocationTracker,
    pub notifier: Notifier,
    pub storage: StorageReport,
}

#[derive(Default)]
struct ShellState {
    user: Option<AuthUser>,
    visits: Vec<Visit>,
    busy: bool,
    auto_detected: usize,
    last_detected: Option<String>,
}

struct ShellInner {
    config: AppConfig,
    auth: Arc<dyn AuthProvider>,
    store: Arc<dyn VisitStore>,
    geocoder: Geocoder,
    positions: Arc<dyn PositionSource>,
    tracker: LocationTracker,
    notifier: Notifier,
    storage: StorageReport,
    state: Mutex<ShellState>,
    record_guard: tokio::sync::Mutex<()>,
    pipeline: Mutex<Option<JoinHandle<()>>>,
    disposed: Arc<AtomicBool>,
}

#[derive(Clone)]
pub struct TravelMap {
    inner: Arc<ShellInner>,
}

struct BusyGuard<'a>(&'a Mutex<ShellState>);

impl<'a> BusyGuard<'a> {
    fn enter(state: &'a Mutex<ShellState>) -> Self {
        state.lock().busy = true;
        Self(state)
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().busy = false;
    }
}

impl TravelMap {
    pub fn new(config: AppConfig, services: ShellServices) -> Self {
        Self {
            inner: Arc::new(ShellInner {
                config,
                auth: services.auth,
                store: services.visits,
                geocoder: services.geocoder,
                positions: services.positions,
                tracker: services.tracker,
                notifier: services.notifier,
                storage: services.storage,
                state: Mutex::new(ShellState::default()),
                record_guard: tokio::sync::Mutex::new(()),
                pipeline: Mutex::new(None),
                disposed: Arc::new(AtomicBool::new(false)),
            }),
        }
    }

    pub fn notifier(&self) -> &Notifier {
        &self.inner.notifier
    }

    pub fn current_user(&self) -> Option<AuthUser> {
        self.inner.state.lock().user.clone()
    }

    pub fn subscribe_auth(&self) -> watch::Receiver<Option<AuthUser>> {
        self.inner.auth.subscribe()
    }

    pub async fn sign_up(&self, email: &str, password: &str) -> AppResult<AuthUser> {
        self.ensure_live()?;
        let user = match self.inner.auth.sign_up(email, password).await {
            Ok(user) => user,
            Err(err) => return Err(self.fail(err)),
        };
        self.ensure_live()?;
        self.set_user(Some(user.clone()));
        self.inner.notifier.success("Account created successfully!");
        Ok(user)
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> AppResult<AuthUser> {
        self.ensure_live()?;
        let user = match self.inner.auth.sign_in(email, password).await {
            Ok(user) => user,
            Err(err) => return Err(self.fail(err)),
        };
        self.ensure_live()?;
        self.set_user(Some(user.clone()));
        self.inner.notifier.success("Welcome back!");
        // a failed load already left a notice; the sign-in itself succeeded
        let _ = self.load_visits().await;
        Ok(user)
    }

    pub async fn restore_session(&self) -> AppResult<Option<AuthUser>> {
        self.ensure_live()?;
        let restored = match self.inner.auth.restore_session().await {
            Ok(restored) => restored,
            Err(err) => return Err(self.fail(err)),
        };
        self.ensure_live()?;
        let Some(user) = restored else {
            return Ok(None);
        };
        self.set_user(Some(user.clone()));
        let _ = self.load_visits().await;
        if let Err(err) = self.resume_tracking().await {
            debug!(target: "shell", error = %err, "tracking not resumed");
        }
        Ok(Some(user))
    }

    pub async fn sign_out(&self) -> AppResult<()> {
        if let Err(err) = self.inner.tracker.stop() {
            warn!(target: "shell", error = %err, "failed to stop tracking during sign-out");
        }
        self.abort_pipeline();
        if let Err(err) = self.inner.tracker.clear_tracking_data() {
            warn!(target: "shell", error = %err, "failed to clear tracking data");
        }
        if let Err(err) = self.inner.auth.sign_out().await {
            return Err(self.fail(err));
        }
        {
            let mut state = self.inner.state.lock();
            *state = ShellState::default();
        }
        self.inner.notifier.info("Signed out");
        Ok(())
    }

    pub async fn load_visits(&self) -> AppResult<Vec<Visit>> {
        let user = self.require_user()?;
        let loaded = match self.inner.store.list_visits(&user.uid).await {
            Ok(visits) => visits,
            Err(err) => {
                self.inner
                    .notifier
                    .error(format!("Failed to load your places: {}", err.user_message()));
                return Err(err);
            }
        };
        self.ensure_live()?;
        let mut state = self.inner.state.lock();
        if state.user.as_ref().map(|u| u.uid.as_str()) != Some(user.uid.as_str()) {
            return Err(AppError::Auth("signed-in user changed while loading".into()));
        }
        state.visits = loaded.clone();
        info!(target: "shell", count = loaded.len(), "visits loaded");
        Ok(loaded)
    }

    pub fn visits(&self) -> Vec<Visit> {
        self.inner.state.lock().visits.clone()
    }

    pub async fn delete_visit(&self, visit_id: &str) -> AppResult<()> {
        self.require_user()?;
        if let Err(err) = self.inner.store.delete_visit(visit_id).await {
            self.inner
                .notifier
                .error(format!("Failed to delete location: {}", err.user_message()));
            return Err(err);
        }
        self.ensure_live()?;
        self.inner
            .state
            .lock()
            .visits
            .retain(|visit| visit.id != visit_id);
        self.inner.notifier.success("Location deleted");
        Ok(())
    }

    pub async fn add_current_location(&self) -> AppResult<AddVisitOutcome> {
        self.require_user()?;
        let _busy = BusyGuard::enter(&self.inner.state);

        let fix = if self.inner.positions.is_available() {
            self.inner
                .positions
                .current_position(WatchOptions::default())
                .await
        } else {
            Err(AppError::Unavailable("geolocation".into()))
        };
        self.ensure_live()?;

        match fix {
            Ok(fix) => self.record_location(fix.coordinate, VisitMethod::Gps, None).await,
            Err(gps_err) => {
                warn!(target: "shell", error = %gps_err, "GPS unavailable; falling back to IP lookup");
                if matches!(gps_err, AppError::PermissionDenied(_)) {
                    self.inner
                        .notifier
                        .info("Location access denied. Using approximate location instead.");
                }
                let located = self.inner.geocoder.location_from_ip().await;
                self.ensure_live()?;
                match located {
                    Ok(location) => {
                        self.record_location(location.coordinate, VisitMethod::Ip, Some(location.place))
                            .await
                    }
                    Err(err) => {
                        self.inner
                            .notifier
                            .error("Unable to determine your location. Please try again.");
                        Err(err)
                    }
                }
            }
        }
    }

    pub async fn record_location(
        &self,
        coordinate: Coordinate,
        method: VisitMethod,
        preset: Option<GeocodeResult>,
    ) -> AppResult<AddVisitOutcome> {
        let user = self.require_user()?;
        let _serial = self.inner.record_guard.lock().await;
        self.ensure_live()?;

        if self.is_known_location(coordinate) {
            debug!(target: "shell", lat = coordinate.lat, lng = coordinate.lng, "duplicate location");
            if method != VisitMethod::AutoTracked {
                self.inner
                    .notifier
                    .info("You've already visited this location!");
            }
            return Ok(AddVisitOutcome::Duplicate);
        }

        let place = match preset {
            Some(place) => place,
            None => {
                let place = self.inner.geocoder.reverse_geocode(coordinate).await;
                self.ensure_live()?;
                place
            }
        };

        let new_visit = NewVisit::from_place(coordinate, place, method, Utc::now());
        let saved = match self.inner.store.create_visit(&user.uid, &new_visit).await {
            Ok(saved) => saved,
            Err(err) => {
                self.inner
                    .notifier
                    .error(format!("Failed to save location: {}", err.user_message()));
                return Err(err);
            }
        };
        self.ensure_live()?;

        self.prepend_visit(&user, saved.clone());
        self.inner.notifier.success(format!(
            "Added {}, {}!",
            saved.city, saved.country
        ));
        info!(target: "shell", id = %saved.id, method = method.as_str(), "visit recorded");
        Ok(AddVisitOutcome::Saved(saved))
    }

    pub async fn start_tracking(&self) -> AppResult<bool> {
        self.require_user()?;
        let (callback, updates) = self.tracking_channel();
        match self.inner.tracker.start(callback).await {
            Ok(true) => {
                self.spawn_pipeline(updates);
                self.inner
                    .notifier
                    .success("Auto-tracking enabled. Places will be saved as you travel.");
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(err) => {
                let message = match &err {
                    AppError::Unavailable(_) => {
                        "Location tracking is not supported on this device".to_string()
                    }
                    other => format!("Failed to start tracking: {}", other.user_message()),
                };
                self.inner.notifier.error(message);
                Err(err)
            }
        }
    }

    pub fn stop_tracking(&self) -> AppResult<bool> {
        let stopped = match self.inner.tracker.stop() {
            Ok(stopped) => stopped,
            Err(err) => return Err(self.fail(err)),
        };
        self.abort_pipeline();
        if stopped {
            self.inner.notifier.info("Auto-tracking disabled");
        }
        Ok(stopped)
    }

    pub async fn resume_tracking(&self) -> AppResult<bool> {
        self.require_user()?;
        let (callback, updates) = self.tracking_channel();
        match self.inner.tracker.resume(callback).await {
            Ok(true) => {
                self.spawn_pipeline(updates);
                self.inner.notifier.info("Auto-tracking resumed");
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(err) => Err(self.fail(err)),
        }
    }

    pub fn tracking_status(&self) -> ShellTrackingStatus {
        let tracker = self.inner.tracker.status();
        let state = self.inner.state.lock();
        ShellTrackingStatus {
            tracker,
            auto_detected_count: state.auto_detected,
            last_detected_place: state.last_detected.clone(),
        }
    }

    pub fn update_tracking_settings(
        &self,
        payload: &UpdateTrackingSettingsPayload,
    ) -> AppResult<TrackingSettings> {
        self.inner
            .tracker
            .update_settings(payload)
            .map_err(|err| self.fail(err))
    }

    fn tracking_channel(&self) -> (TrackingCallback, mpsc::UnboundedReceiver<TrackingUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: TrackingCallback = Arc::new(move |update| {
            let _ = tx.send(update);
        });
        (callback, rx)
    }

    fn spawn_pipeline(&self, mut updates: mpsc::UnboundedReceiver<TrackingUpdate>) {
        let weak: Weak<ShellInner> = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            while let Some(update) = updates.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                TravelMap { inner }.handle_tracking_update(update).await;
            }
            debug!(target: "shell", "tracking pipeline finished");
        });
        if let Some(previous) = self.inner.pipeline.lock().replace(handle) {
            previous.abort();
        }
    }

    fn abort_pipeline(&self) {
        if let Some(handle) = self.inner.pipeline.lock().take() {
            handle.abort();
        }
    }

    async fn handle_tracking_update(&self, update: TrackingUpdate) {
        match update {
            TrackingUpdate::Position(position) => {
                let coordinate = Coordinate {
                    lat: position.lat,
                    lng: position.lng,
                };
                match self
                    .record_location(coordinate, VisitMethod::AutoTracked, None)
                    .await
                {
                    Ok(AddVisitOutcome::Saved(visit)) => {
                        let mut state = self.inner.state.lock();
                        state.auto_detected += 1;
                        state.last_detected = Some(format!("{}, {}", visit.city, visit.country));
                    }
                    Ok(AddVisitOutcome::Duplicate) => {}
                    Err(AppError::Cancelled) => {}
                    Err(err) => {
                        debug!(target: "shell", error = %err, "auto-tracked visit not saved");
                    }
                }
            }
            TrackingUpdate::Error { message } => {
                self.inner
                    .notifier
                    .warning(format!("Tracking error: {message}"));
            }
        }
    }

    pub async fn prepare_import(
        &self,
        bytes: &[u8],
        observer: Option<ImportObserver>,
    ) -> AppResult<ImportSelection> {
        self.require_user()?;
        let _busy = BusyGuard::enter(&self.inner.state);

        let points = match parse_location_history(bytes) {
            Ok(points) => points,
            Err(err) => {
                self.inner
                    .notifier
                    .error("Failed to process file. Please check format.");
                return Err(err);
            }
        };
        if points.is_empty() {
            self.inner.notifier.warning("No location data found in file");
            return Ok(ImportSelection::default());
        }
        self.inner.notifier.info(format!(
            "Found {} location points. Processing...",
            points.len()
        ));

        let options = ImportOptions::from_config(&self.inner.config);
        let sampled = sample_points(&points, options.sample_stride);
        let candidates = detect_places(
            &self.inner.geocoder,
            &sampled,
            &options,
            observer,
            Some(self.inner.disposed.clone()),
        )
        .await?;
        self.ensure_live()?;

        self.inner
            .notifier
            .success(format!("Detected {} unique places!", candidates.len()));
        Ok(ImportSelection::new(candidates))
    }

    pub async fn prepare_import_file(
        &self,
        path: &Path,
        observer: Option<ImportObserver>,
    ) -> AppResult<ImportSelection> {
        let bytes = match read_import_file(path) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.inner
                    .notifier
                    .error("Please choose a location history .json file");
                return Err(err);
            }
        };
        self.prepare_import(&bytes, observer).await
    }

    pub async fn commit_import(&self, selection: &ImportSelection) -> AppResult<ImportReport> {
        let user = self.require_user()?;
        let chosen = selection.selected();
        if chosen.is_empty() {
            self.inner
                .notifier
                .warning("Please select at least one place to import");
            return Err(AppError::Parse("no places selected for import".into()));
        }

        let _busy = BusyGuard::enter(&self.inner.state);
        let _serial = self.inner.record_guard.lock().await;
        let mut report = ImportReport::default();
        for candidate in chosen {
            self.ensure_live()?;
            let new_visit = candidate.to_new_visit();
            if self.is_known_location(Coordinate {
                lat: new_visit.lat,
                lng: new_visit.lng,
            }) {
                report.duplicates += 1;
                continue;
            }
            match self.inner.store.create_visit(&user.uid, &new_visit).await {
                Ok(saved) => {
                    self.prepend_visit(&user, saved);
                    report.imported += 1;
                }
                Err(err) => {
                    warn!(target: "shell", error = %err, city = %new_visit.city, "failed to import place");
                    report.failed += 1;
                }
            }
        }

        info!(
            target: "shell",
            imported = report.imported,
            duplicates = report.duplicates,
            failed = report.failed,
            "import committed"
        );
        if report.failed > 0 {
            self.inner.notifier.warning(format!(
                "Imported {} places; {} could not be saved",
                report.imported, report.failed
            ));
        } else {
            self.inner
                .notifier
                .success(format!("Successfully imported {} places!", report.imported));
        }
        Ok(report)
    }

    pub fn summary(&self) -> TravelSummary {
        stats::summarize(&self.inner.state.lock().visits)
    }

    pub fn timeline(&self) -> Vec<TimelineEntry> {
        stats::timeline(&self.inner.state.lock().visits)
    }

    pub fn status(&self) -> ShellStatus {
        let tracking = self.tracking_status();
        let state = self.inner.state.lock();
        ShellStatus {
            user: state.user.clone(),
            visit_count: state.visits.len(),
            busy: state.busy,
            tracking,
            storage: self.inner.storage.clone(),
            config: self.inner.config.public_profile(),
        }
    }

    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.abort_pipeline();
        self.inner.tracker.dispose();
        info!(target: "shell", "shell disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    fn ensure_live(&self) -> AppResult<()> {
        if self.is_disposed() {
            Err(AppError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn require_user(&self) -> AppResult<AuthUser> {
        self.ensure_live()?;
        match self.current_user() {
            Some(user) => Ok(user),
            None => {
                self.inner.notifier.warning("Please sign in first");
                Err(AppError::Auth("not signed in".into()))
            }
        }
    }

    fn set_user(&self, user: Option<AuthUser>) {
        let mut state = self.inner.state.lock();
        if state.user != user {
            state.visits.clear();
            state.auto_detected = 0;
            state.last_detected = None;
        }
        state.user = user;
    }

    fn is_known_location(&self, coordinate: Coordinate) -> bool {
        let state = self.inner.state.lock();
        is_duplicate_location(
            coordinate,
            state.visits.iter(),
            self.inner.config.duplicate_threshold_deg,
        )
    }

    fn prepend_visit(&self, owner: &AuthUser, visit: Visit) {
        let mut state = self.inner.state.lock();
        if state.user.as_ref().map(|u| u.uid.as_str()) == Some(owner.uid.as_str()) {
            state.visits.insert(0, visit);
        }
    }

    fn fail(&self, err: AppError) -> AppError {
        if !matches!(err, AppError::Cancelled) {
            self.inner.notifier.error(err.user_message());
        }
        err
    }
}

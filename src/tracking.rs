use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::{AppError, AppResult};
use crate::geo::{haversine_m, Coordinate, Located};
use crate::notifications::{NotificationPermission, NotificationSink};
use crate::settings::{TrackingSettings, UpdateTrackingSettingsPayload};
use crate::storage::KeyValueStore;

pub const TRACKING_ENABLED_KEY: &str = "mapme_tracking_enabled";
pub const LAST_LOCATION_KEY: &str = "mapme_last_location";

const WATCH_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq)]
pub struct PositionFix {
    pub coordinate: Coordinate,
    pub accuracy: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PositionEvent {
    Fix(PositionFix),
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchOptions {
    pub enable_high_accuracy: bool,
    pub timeout_ms: u64,
    pub maximum_age_ms: u64,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            enable_high_accuracy: true,
            timeout_ms: WATCH_TIMEOUT_MS,
            maximum_age_ms: 0,
        }
    }
}

#[async_trait]
pub trait PositionSource: Send + Sync {
    fn is_available(&self) -> bool;

    async fn current_position(&self, options: WatchOptions) -> AppResult<PositionFix>;

    fn watch_position(&self, options: WatchOptions)
        -> AppResult<BoxStream<'static, PositionEvent>>;
}

#[derive(Default)]
struct ChannelShared {
    watchers: Vec<mpsc::UnboundedSender<PositionEvent>>,
    latest: Option<PositionFix>,
    denied: bool,
}

#[derive(Clone)]
pub struct ChannelPositionSource {
    shared: Arc<Mutex<ChannelShared>>,
    available: bool,
}

#[derive(Clone)]
pub struct PositionFeed {
    shared: Arc<Mutex<ChannelShared>>,
}

impl ChannelPositionSource {
    pub fn channel() -> (Self, PositionFeed) {
        let shared = Arc::new(Mutex::new(ChannelShared::default()));
        (
            Self {
                shared: shared.clone(),
                available: true,
            },
            PositionFeed { shared },
        )
    }

    pub fn unavailable() -> Self {
        Self {
            shared: Arc::new(Mutex::new(ChannelShared::default())),
            available: false,
        }
    }
}

impl PositionFeed {
    pub fn push_fix(&self, fix: PositionFix) {
        let mut shared = self.shared.lock();
        shared.latest = Some(fix.clone());
        let event = PositionEvent::Fix(fix);
        shared
            .watchers
            .retain(|watcher| watcher.send(event.clone()).is_ok());
    }

    pub fn push_error(&self, message: impl Into<String>) {
        let event = PositionEvent::Error(message.into());
        self.shared
            .lock()
            .watchers
            .retain(|watcher| watcher.send(event.clone()).is_ok());
    }

    pub fn set_permission_denied(&self, denied: bool) {
        self.shared.lock().denied = denied;
    }

    pub fn watcher_count(&self) -> usize {
        let mut shared = self.shared.lock();
        shared.watchers.retain(|watcher| !watcher.is_closed());
        shared.watchers.len()
    }
}

#[async_trait]
impl PositionSource for ChannelPositionSource {
    fn is_available(&self) -> bool {
        self.available
    }

    async fn current_position(&self, _options: WatchOptions) -> AppResult<PositionFix> {
        if !self.available {
            return Err(AppError::Unavailable("geolocation".into()));
        }
        let shared = self.shared.lock();
        if shared.denied {
            return Err(AppError::PermissionDenied("location access".into()));
        }
        shared
            .latest
            .clone()
            .ok_or_else(|| AppError::Unavailable("current position".into()))
    }

    fn watch_position(
        &self,
        _options: WatchOptions,
    ) -> AppResult<BoxStream<'static, PositionEvent>> {
        if !self.available {
            return Err(AppError::Unavailable("geolocation".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.lock().watchers.push(tx);
        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedPosition {
    pub lat: f64,
    pub lng: f64,
    pub accuracy: f64,
    pub timestamp: DateTime<Utc>,
}

impl From<PositionFix> for TrackedPosition {
    fn from(fix: PositionFix) -> Self {
        Self {
            lat: fix.coordinate.lat,
            lng: fix.coordinate.lng,
            accuracy: fix.accuracy,
            timestamp: fix.timestamp,
        }
    }
}

impl Located for TrackedPosition {
    fn coordinate(&self) -> Coordinate {
        Coordinate {
            lat: self.lat,
            lng: self.lng,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrackingUpdate {
    Position(TrackedPosition),
    Error { message: String },
}

pub type TrackingCallback = Arc<dyn Fn(TrackingUpdate) + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingStatus {
    pub enabled: bool,
    // a watch is running in this process; `enabled` is the persisted intent
    pub active: bool,
    pub last_location: Option<TrackedPosition>,
    pub notification_permission: NotificationPermission,
    pub settings: TrackingSettings,
}

struct TrackerState {
    enabled: bool,
    last_location: Option<TrackedPosition>,
    settings: TrackingSettings,
    permission: NotificationPermission,
    watch: Option<JoinHandle<()>>,
    // bumped per watch so a finished task only clears its own handle
    generation: u64,
}

pub struct LocationTracker {
    source: Arc<dyn PositionSource>,
    store: Arc<dyn KeyValueStore>,
    sink: Arc<dyn NotificationSink>,
    settings_path: PathBuf,
    state: Arc<Mutex<TrackerState>>,
}

impl LocationTracker {
    pub fn new(
        source: Arc<dyn PositionSource>,
        store: Arc<dyn KeyValueStore>,
        sink: Arc<dyn NotificationSink>,
        settings: TrackingSettings,
        settings_path: PathBuf,
    ) -> Self {
        let enabled = load_json::<bool>(store.as_ref(), TRACKING_ENABLED_KEY).unwrap_or(false);
        let last_location = load_json::<TrackedPosition>(store.as_ref(), LAST_LOCATION_KEY);
        let permission = sink.permission();
        debug!(
            target: "tracking",
            enabled,
            has_last_location = last_location.is_some(),
            "tracking state restored"
        );
        Self {
            source,
            store,
            sink,
            settings_path,
            state: Arc::new(Mutex::new(TrackerState {
                enabled,
                last_location,
                settings,
                permission,
                watch: None,
                generation: 0,
            })),
        }
    }

    pub async fn start(&self, callback: TrackingCallback) -> AppResult<bool> {
        if !self.source.is_available() {
            return Err(AppError::Unavailable("geolocation".into()));
        }
        if self.state.lock().watch.is_some() {
            debug!(target: "tracking", "tracking already running");
            return Ok(false);
        }

        let notifications_enabled = self.state.lock().settings.notifications_enabled;
        let permission = if notifications_enabled {
            self.request_notification_permission().await
        } else {
            self.sink.permission()
        };

        let events = self.source.watch_position(WatchOptions::default())?;
        {
            let mut state = self.state.lock();
            if state.watch.is_some() {
                return Ok(false);
            }
            persist_json(self.store.as_ref(), TRACKING_ENABLED_KEY, &true)?;
            state.enabled = true;
            state.permission = permission;
            state.generation += 1;
            state.watch = Some(tokio::spawn(watch_positions(
                events,
                self.state.clone(),
                self.store.clone(),
                callback,
                state.generation,
            )));
        }

        if notifications_enabled && permission == NotificationPermission::Granted {
            self.sink.show(
                "MapMe auto-tracking enabled",
                "Places will be saved as you travel.",
            );
        }
        info!(target: "tracking", "location tracking started");
        Ok(true)
    }

    pub fn stop(&self) -> AppResult<bool> {
        let (handle, notify) = {
            let mut state = self.state.lock();
            state.enabled = false;
            (
                state.watch.take(),
                state.settings.notifications_enabled
                    && state.permission == NotificationPermission::Granted,
            )
        };
        let was_running = handle.is_some();
        if let Some(handle) = handle {
            handle.abort();
        }
        persist_json(self.store.as_ref(), TRACKING_ENABLED_KEY, &false)?;

        if notify {
            self.sink.show(
                "MapMe auto-tracking disabled",
                "Location tracking has been stopped.",
            );
        }
        info!(target: "tracking", was_running, "location tracking stopped");
        Ok(was_running)
    }

    pub async fn resume(&self, callback: TrackingCallback) -> AppResult<bool> {
        let should_resume = {
            let state = self.state.lock();
            state.enabled && state.watch.is_none()
        };
        if !should_resume {
            return Ok(false);
        }
        info!(target: "tracking", "resuming tracking after restart");
        self.start(callback).await
    }

    // leaves the persisted intent alone so the next start can resume
    pub fn dispose(&self) {
        if let Some(handle) = self.state.lock().watch.take() {
            handle.abort();
            debug!(target: "tracking", "tracker disposed");
        }
    }

    pub fn status(&self) -> TrackingStatus {
        let state = self.state.lock();
        TrackingStatus {
            enabled: state.enabled,
            active: state.watch.is_some(),
            last_location: state.last_location.clone(),
            notification_permission: state.permission,
            settings: state.settings.clone(),
        }
    }

    pub fn update_settings(
        &self,
        payload: &UpdateTrackingSettingsPayload,
    ) -> AppResult<TrackingSettings> {
        let updated = {
            let mut state = self.state.lock();
            state.settings.apply_patch(payload);
            state.settings.clone()
        };
        updated.persist(&self.settings_path)?;
        Ok(updated)
    }

    pub fn clear_tracking_data(&self) -> AppResult<()> {
        {
            let mut state = self.state.lock();
            state.enabled = false;
            state.last_location = None;
        }
        self.store.remove(TRACKING_ENABLED_KEY)?;
        self.store.remove(LAST_LOCATION_KEY)?;
        debug!(target: "tracking", "tracking data cleared");
        Ok(())
    }

    async fn request_notification_permission(&self) -> NotificationPermission {
        match self.sink.permission() {
            NotificationPermission::Default => self.sink.request_permission().await,
            other => other,
        }
    }
}

impl Drop for LocationTracker {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn watch_positions(
    mut events: BoxStream<'static, PositionEvent>,
    state: Arc<Mutex<TrackerState>>,
    store: Arc<dyn KeyValueStore>,
    callback: TrackingCallback,
    generation: u64,
) {
    while let Some(event) = events.next().await {
        match event {
            PositionEvent::Fix(fix) => {
                let accepted = process_fix(&mut state.lock(), fix);
                if let Some(position) = accepted {
                    if let Err(err) = persist_json(store.as_ref(), LAST_LOCATION_KEY, &position) {
                        warn!(target: "tracking", error = %err, "failed to persist last location");
                    }
                    callback(TrackingUpdate::Position(position));
                }
            }
            PositionEvent::Error(message) => {
                warn!(target: "tracking", %message, "position error");
                callback(TrackingUpdate::Error { message });
            }
        }
    }
    let mut state = state.lock();
    if state.generation == generation {
        state.watch = None;
    }
    debug!(target: "tracking", "position stream ended");
}

fn process_fix(state: &mut TrackerState, fix: PositionFix) -> Option<TrackedPosition> {
    let position = TrackedPosition::from(fix);
    if let Some(last) = &state.last_location {
        let moved = haversine_m(last.coordinate(), position.coordinate());
        if moved < state.settings.min_distance_m {
            debug!(target: "tracking", moved_m = moved, "ignoring insignificant move");
            return None;
        }
    }
    state.last_location = Some(position.clone());
    Some(position)
}

fn load_json<T: for<'de> Deserialize<'de>>(store: &dyn KeyValueStore, key: &str) -> Option<T> {
    match store.get(key) {
        Ok(Some(raw)) => match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(target: "tracking", key, error = %err, "discarding unreadable tracking state");
                None
            }
        },
        Ok(None) => None,
        Err(err) => {
            warn!(target: "tracking", key, error = %err, "failed to read tracking state");
            None
        }
    }
}

fn persist_json<T: Serialize>(store: &dyn KeyValueStore, key: &str, value: &T) -> AppResult<()> {
    store.set(key, &serde_json::to_string(value)?)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;
    use tokio::time::timeout;

    use super::*;
    use crate::config::test_config;
    use crate::notifications::LogNotificationSink;
    use crate::storage::MemoryKeyValueStore;

    fn fix(lat: f64, lng: f64) -> PositionFix {
        PositionFix {
            coordinate: Coordinate::new(lat, lng).unwrap(),
            accuracy: 12.0,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap(),
        }
    }

    fn tracker(source: Arc<dyn PositionSource>, store: Arc<MemoryKeyValueStore>) -> LocationTracker {
        let dir = std::env::temp_dir().join("mapme-tracking-tests");
        LocationTracker::new(
            source,
            store,
            Arc::new(LogNotificationSink),
            TrackingSettings::from_config(&test_config()),
            dir.join("settings.json"),
        )
    }

    fn collecting() -> (TrackingCallback, mpsc::UnboundedReceiver<TrackingUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: TrackingCallback = Arc::new(move |update| {
            let _ = tx.send(update);
        });
        (callback, rx)
    }

    async fn next_update(rx: &mut mpsc::UnboundedReceiver<TrackingUpdate>) -> TrackingUpdate {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for update")
            .expect("callback channel closed")
    }

    #[tokio::test]
    async fn forwards_only_significant_moves() {
        let (source, feed) = ChannelPositionSource::channel();
        let store = Arc::new(MemoryKeyValueStore::new());
        let tracker = tracker(Arc::new(source), store.clone());
        let (callback, mut rx) = collecting();

        assert!(tracker.start(callback).await.unwrap());
        feed.push_fix(fix(9.0579, 7.4951));
        // roughly 110 m north
        feed.push_fix(fix(9.0589, 7.4951));
        // roughly 2.2 km north of the first fix
        feed.push_fix(fix(9.0779, 7.4951));

        match next_update(&mut rx).await {
            TrackingUpdate::Position(position) => assert_eq!(position.lat, 9.0579),
            other => panic!("unexpected update {other:?}"),
        }
        match next_update(&mut rx).await {
            TrackingUpdate::Position(position) => assert_eq!(position.lat, 9.0779),
            other => panic!("unexpected update {other:?}"),
        }

        let stored = store.get(LAST_LOCATION_KEY).unwrap().unwrap();
        assert!(stored.contains("9.0779"));
        assert_eq!(store.get(TRACKING_ENABLED_KEY).unwrap().as_deref(), Some("true"));
    }

    #[tokio::test]
    async fn position_errors_reach_callback() {
        let (source, feed) = ChannelPositionSource::channel();
        let tracker = tracker(Arc::new(source), Arc::new(MemoryKeyValueStore::new()));
        let (callback, mut rx) = collecting();
        tracker.start(callback).await.unwrap();

        feed.push_error("position unavailable");
        assert_eq!(
            next_update(&mut rx).await,
            TrackingUpdate::Error {
                message: "position unavailable".into()
            }
        );
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_persists_intent() {
        let (source, feed) = ChannelPositionSource::channel();
        let store = Arc::new(MemoryKeyValueStore::new());
        let tracker = tracker(Arc::new(source), store.clone());
        let (callback, _rx) = collecting();

        assert!(tracker.start(callback.clone()).await.unwrap());
        assert!(!tracker.start(callback).await.unwrap());
        assert_eq!(feed.watcher_count(), 1);
        assert!(tracker.status().active);

        assert!(tracker.stop().unwrap());
        assert!(!tracker.status().enabled);
        assert_eq!(store.get(TRACKING_ENABLED_KEY).unwrap().as_deref(), Some("false"));
        assert!(!tracker.stop().unwrap());
    }

    #[tokio::test]
    async fn unavailable_source_is_an_error() {
        let tracker = tracker(
            Arc::new(ChannelPositionSource::unavailable()),
            Arc::new(MemoryKeyValueStore::new()),
        );
        let (callback, _rx) = collecting();
        assert!(matches!(
            tracker.start(callback).await,
            Err(AppError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn restores_state_and_resumes() {
        let store = Arc::new(MemoryKeyValueStore::new());
        store.set(TRACKING_ENABLED_KEY, "true").unwrap();
        persist_json(
            store.as_ref(),
            LAST_LOCATION_KEY,
            &TrackedPosition::from(fix(48.8566, 2.3522)),
        )
        .unwrap();

        let (source, feed) = ChannelPositionSource::channel();
        let tracker = tracker(Arc::new(source), store.clone());
        let status = tracker.status();
        assert!(status.enabled);
        assert!(!status.active);
        assert_eq!(status.last_location.unwrap().lat, 48.8566);

        let (callback, mut rx) = collecting();
        assert!(tracker.resume(callback.clone()).await.unwrap());
        assert!(!tracker.resume(callback).await.unwrap());

        // same spot as the restored position, then a different city
        feed.push_fix(fix(48.8566, 2.3522));
        feed.push_fix(fix(48.5734, 7.7521));
        match next_update(&mut rx).await {
            TrackingUpdate::Position(position) => assert_eq!(position.lat, 48.5734),
            other => panic!("unexpected update {other:?}"),
        }

        tracker.dispose();
        assert!(tracker.status().enabled);
        assert!(!tracker.status().active);
    }

    #[tokio::test]
    async fn clear_tracking_data_removes_keys() {
        let store = Arc::new(MemoryKeyValueStore::new());
        store.set(TRACKING_ENABLED_KEY, "true").unwrap();
        store.set(LAST_LOCATION_KEY, "not json").unwrap();

        let (source, _feed) = ChannelPositionSource::channel();
        let tracker = tracker(Arc::new(source), store.clone());
        assert!(tracker.status().last_location.is_none());

        tracker.clear_tracking_data().unwrap();
        assert_eq!(store.get(TRACKING_ENABLED_KEY).unwrap(), None);
        assert_eq!(store.get(LAST_LOCATION_KEY).unwrap(), None);
        assert!(!tracker.status().enabled);
    }

    struct SingleFixSource;

    #[async_trait]
    impl PositionSource for SingleFixSource {
        fn is_available(&self) -> bool {
            true
        }

        async fn current_position(&self, _options: WatchOptions) -> AppResult<PositionFix> {
            Ok(fix(9.0579, 7.4951))
        }

        fn watch_position(
            &self,
            _options: WatchOptions,
        ) -> AppResult<BoxStream<'static, PositionEvent>> {
            Ok(stream::iter(vec![PositionEvent::Fix(fix(9.0579, 7.4951))]).boxed())
        }
    }

    #[tokio::test]
    async fn ended_watch_can_be_restarted() {
        let tracker = tracker(Arc::new(SingleFixSource), Arc::new(MemoryKeyValueStore::new()));
        let (callback, mut rx) = collecting();

        assert!(tracker.start(callback.clone()).await.unwrap());
        assert!(matches!(next_update(&mut rx).await, TrackingUpdate::Position(_)));

        wait_until_idle(&tracker).await;
        let status = tracker.status();
        assert!(!status.active);
        assert!(status.enabled);

        assert!(tracker.start(callback.clone()).await.unwrap());
        wait_until_idle(&tracker).await;
        // intent is still on, so a restart resumes a fresh watch
        assert!(tracker.resume(callback).await.unwrap());
    }

    async fn wait_until_idle(tracker: &LocationTracker) {
        let mut attempts = 0;
        while tracker.status().active && attempts < 100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            attempts += 1;
        }
    }

    #[test]
    fn first_fix_is_always_accepted() {
        let mut state = TrackerState {
            enabled: true,
            last_location: None,
            settings: TrackingSettings::from_config(&test_config()),
            permission: NotificationPermission::Default,
            watch: None,
            generation: 0,
        };
        assert!(process_fix(&mut state, fix(0.0, 0.0)).is_some());
        assert!(process_fix(&mut state, fix(0.0, 0.005)).is_none());
        assert!(process_fix(&mut state, fix(0.0, 0.01)).is_some());
    }
}

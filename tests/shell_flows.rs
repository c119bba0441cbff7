use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use tempfile::tempdir;
use tokio::sync::{watch, Notify};

use mapme::auth::{AuthProvider, AuthUser};
use mapme::config::AppConfig;
use mapme::geo::Coordinate;
use mapme::geocoding::{GeocodeResult, Geocoder, IpLocation, IpLocator, ReverseGeocoder};
use mapme::import::ImportProgress;
use mapme::notifications::{LogNotificationSink, NoticeLevel, Notifier};
use mapme::settings::{settings_path, TrackingSettings};
use mapme::storage::MemoryKeyValueStore;
use mapme::tracking::{ChannelPositionSource, LocationTracker, PositionFeed, PositionFix};
use mapme::visits::{NewVisit, Visit, VisitMethod, VisitStore};
use mapme::{AddVisitOutcome, AppError, AppResult, ImportReport, ShellServices, TravelMap};

struct StaticAuth {
    user: AuthUser,
    tx: watch::Sender<Option<AuthUser>>,
}

impl StaticAuth {
    fn new(uid: &str) -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            user: AuthUser {
                uid: uid.into(),
                email: Some(format!("{uid}@example.com")),
            },
            tx,
        }
    }
}

#[async_trait]
impl AuthProvider for StaticAuth {
    async fn sign_up(&self, _email: &str, _password: &str) -> AppResult<AuthUser> {
        self.tx.send_replace(Some(self.user.clone()));
        Ok(self.user.clone())
    }

    async fn sign_in(&self, _email: &str, _password: &str) -> AppResult<AuthUser> {
        self.tx.send_replace(Some(self.user.clone()));
        Ok(self.user.clone())
    }

    async fn sign_out(&self) -> AppResult<()> {
        self.tx.send_replace(None);
        Ok(())
    }

    async fn restore_session(&self) -> AppResult<Option<AuthUser>> {
        Ok(None)
    }

    fn subscribe(&self) -> watch::Receiver<Option<AuthUser>> {
        self.tx.subscribe()
    }

    fn current_user(&self) -> Option<AuthUser> {
        self.tx.borrow().clone()
    }
}

// holds a call open until the test releases it
#[derive(Default)]
struct Gate {
    entered: Notify,
    release: Notify,
}

impl Gate {
    async fn pass(&self) {
        self.entered.notify_one();
        self.release.notified().await;
    }
}

#[derive(Default)]
struct MemoryVisits {
    visits: Mutex<Vec<Visit>>,
    next_id: AtomicUsize,
    creates: AtomicUsize,
    gate: Option<Arc<Gate>>,
}

impl MemoryVisits {
    fn seeded(user_id: &str, coordinate: Coordinate, place: GeocodeResult) -> Self {
        let store = Self::default();
        let visit = NewVisit::from_place(coordinate, place, VisitMethod::Gps, Utc::now());
        store
            .visits
            .lock()
            .push(Visit::from_new("seed".into(), user_id.into(), visit, Utc::now()));
        store
    }
}

#[async_trait]
impl VisitStore for MemoryVisits {
    async fn create_visit(&self, user_id: &str, visit: &NewVisit) -> AppResult<Visit> {
        if let Some(gate) = &self.gate {
            gate.pass().await;
        }
        self.creates.fetch_add(1, Ordering::SeqCst);
        let id = format!("visit-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let saved = Visit::from_new(id, user_id.into(), visit.clone(), Utc::now());
        self.visits.lock().insert(0, saved.clone());
        Ok(saved)
    }

    async fn list_visits(&self, user_id: &str) -> AppResult<Vec<Visit>> {
        Ok(self
            .visits
            .lock()
            .iter()
            .filter(|visit| visit.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn delete_visit(&self, visit_id: &str) -> AppResult<()> {
        self.visits.lock().retain(|visit| visit.id != visit_id);
        Ok(())
    }
}

fn place(city: &str, country: &str) -> GeocodeResult {
    GeocodeResult {
        country: country.into(),
        state: city.into(),
        city: city.into(),
        formatted: format!("{city}, {country}"),
    }
}

// north of 8° is Abuja, everything else Lagos
struct TwoCities {
    lookups: AtomicUsize,
}

#[async_trait]
impl ReverseGeocoder for TwoCities {
    async fn lookup(&self, coordinate: Coordinate) -> AppResult<GeocodeResult> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if coordinate.lat > 8.0 {
            Ok(place("Abuja", "Nigeria"))
        } else {
            Ok(place("Lagos", "Nigeria"))
        }
    }
}

struct GatedGeocoder(Arc<Gate>);

#[async_trait]
impl ReverseGeocoder for GatedGeocoder {
    async fn lookup(&self, _coordinate: Coordinate) -> AppResult<GeocodeResult> {
        self.0.pass().await;
        Ok(place("Abuja", "Nigeria"))
    }
}

struct FixedIp;

#[async_trait]
impl IpLocator for FixedIp {
    async fn locate(&self) -> AppResult<IpLocation> {
        Ok(IpLocation {
            coordinate: Coordinate::new(51.5074, -0.1278)?,
            place: place("London", "United Kingdom"),
        })
    }
}

struct Harness {
    map: TravelMap,
    store: Arc<MemoryVisits>,
    geocoder: Arc<TwoCities>,
    feed: PositionFeed,
    _dir: tempfile::TempDir,
}

fn harness(store: MemoryVisits) -> Harness {
    harness_with(store, None)
}

fn harness_with(store: MemoryVisits, reverse: Option<Arc<dyn ReverseGeocoder>>) -> Harness {
    let dir = tempdir().unwrap();
    let config = AppConfig {
        geocode_pacing_delay_ms: 0,
        import_sample_stride: 10,
        ..AppConfig::default()
    };
    let (positions, feed) = ChannelPositionSource::channel();
    let positions = Arc::new(positions);
    let tracker = LocationTracker::new(
        positions.clone(),
        Arc::new(MemoryKeyValueStore::new()),
        Arc::new(LogNotificationSink),
        TrackingSettings::from_config(&config),
        settings_path(dir.path()),
    );
    let store = Arc::new(store);
    let geocoder = Arc::new(TwoCities {
        lookups: AtomicUsize::new(0),
    });
    let map = TravelMap::new(
        config,
        ShellServices {
            auth: Arc::new(StaticAuth::new("user-1")),
            visits: store.clone(),
            geocoder: Geocoder::from_parts(
                reverse.unwrap_or_else(|| geocoder.clone() as Arc<dyn ReverseGeocoder>),
                Arc::new(FixedIp),
            ),
            positions,
            tracker,
            notifier: Notifier::with_capacity(16),
            storage: Default::default(),
        },
    );
    Harness {
        map,
        store,
        geocoder,
        feed,
        _dir: dir,
    }
}

fn fix(lat: f64, lng: f64) -> PositionFix {
    PositionFix {
        coordinate: Coordinate::new(lat, lng).unwrap(),
        accuracy: 5.0,
        timestamp: Utc::now(),
    }
}

fn history(points: &[(f64, f64)]) -> Vec<u8> {
    let locations: Vec<_> = points
        .iter()
        .enumerate()
        .map(|(i, (lat, lng))| {
            json!({
                "latitudeE7": (lat * 1e7).round() as i64,
                "longitudeE7": (lng * 1e7).round() as i64,
                "timestampMs": (1_700_000_000_000i64 + i as i64 * 60_000).to_string()
            })
        })
        .collect();
    serde_json::to_vec(&json!({ "locations": locations })).unwrap()
}

#[tokio::test]
async fn actions_require_sign_in() {
    let h = harness(MemoryVisits::default());
    let err = h.map.add_current_location().await.unwrap_err();
    assert!(matches!(err, AppError::Auth(_)));
    let notice = h.map.notifier().latest().unwrap();
    assert_eq!(notice.level, NoticeLevel::Warning);
    assert_eq!(notice.message, "Please sign in first");
}

#[tokio::test]
async fn falls_back_to_ip_when_gps_is_denied() {
    let h = harness(MemoryVisits::default());
    h.map.sign_in("user-1@example.com", "secret1").await.unwrap();
    h.feed.set_permission_denied(true);

    let outcome = h.map.add_current_location().await.unwrap();
    let AddVisitOutcome::Saved(visit) = outcome else {
        panic!("expected a saved visit");
    };
    assert_eq!(visit.method, VisitMethod::Ip);
    assert_eq!(visit.city, "London");
    // the IP lookup already names the place
    assert_eq!(h.geocoder.lookups.load(Ordering::SeqCst), 0);

    let messages: Vec<String> = h
        .map
        .notifier()
        .drain()
        .into_iter()
        .map(|notice| notice.message)
        .collect();
    assert!(messages
        .iter()
        .any(|m| m.starts_with("Location access denied")));
    assert_eq!(messages.last().unwrap(), "Added London, United Kingdom!");
}

#[tokio::test]
async fn duplicate_location_skips_geocoding_and_saving() {
    let h = harness(MemoryVisits::seeded(
        "user-1",
        Coordinate::new(6.5244, 3.3792).unwrap(),
        place("Lagos", "Nigeria"),
    ));
    h.map.sign_in("user-1@example.com", "secret1").await.unwrap();
    assert_eq!(h.map.visits().len(), 1);

    h.feed.push_fix(fix(6.5250, 3.3800));
    let outcome = h.map.add_current_location().await.unwrap();
    assert_eq!(outcome, AddVisitOutcome::Duplicate);
    assert_eq!(h.geocoder.lookups.load(Ordering::SeqCst), 0);
    assert_eq!(h.store.creates.load(Ordering::SeqCst), 0);
    assert_eq!(
        h.map.notifier().latest().unwrap().message,
        "You've already visited this location!"
    );
}

#[tokio::test]
async fn import_detects_selects_and_commits() {
    let h = harness(MemoryVisits::seeded(
        "user-1",
        Coordinate::new(6.5244, 3.3792).unwrap(),
        place("Lagos", "Nigeria"),
    ));
    h.map.sign_in("user-1@example.com", "secret1").await.unwrap();

    // stride 10 samples indices 0, 10 and 20
    let mut points = vec![(1.0, 1.0); 25];
    points[0] = (9.0579, 7.4951);
    points[10] = (6.5244, 3.3792);
    points[20] = (9.0600, 7.4900);

    let progress: Arc<Mutex<Vec<ImportProgress>>> = Arc::default();
    let sink = progress.clone();
    let selection = h
        .map
        .prepare_import(
            &history(&points),
            Some(Arc::new(move |p| sink.lock().push(p))),
        )
        .await
        .unwrap();

    assert_eq!(selection.len(), 2);
    assert_eq!(selection.selected_count(), 2);
    let keys: Vec<_> = selection.candidates().iter().map(|c| c.key()).collect();
    assert!(keys.contains(&("Abuja", "Nigeria")));
    assert!(keys.contains(&("Lagos", "Nigeria")));
    assert_eq!(progress.lock().last().unwrap().percent(), 100);
    assert_eq!(h.store.creates.load(Ordering::SeqCst), 0);

    let report = h.map.commit_import(&selection).await.unwrap();
    assert_eq!(
        report,
        ImportReport {
            imported: 1,
            duplicates: 1,
            failed: 0
        }
    );
    let visits = h.map.visits();
    assert_eq!(visits.len(), 2);
    assert_eq!(visits[0].city, "Abuja");
    assert_eq!(visits[0].method, VisitMethod::Imported);
    assert_eq!(
        h.map.notifier().latest().unwrap().message,
        "Successfully imported 1 places!"
    );
}

#[tokio::test]
async fn empty_selection_is_rejected() {
    let h = harness(MemoryVisits::default());
    h.map.sign_in("user-1@example.com", "secret1").await.unwrap();

    let mut selection = h
        .map
        .prepare_import(&history(&[(9.0579, 7.4951)]), None)
        .await
        .unwrap();
    selection.toggle_all();
    assert_eq!(selection.selected_count(), 0);

    let err = h.map.commit_import(&selection).await.unwrap_err();
    assert!(matches!(err, AppError::Parse(_)));
    let notice = h.map.notifier().latest().unwrap();
    assert_eq!(notice.level, NoticeLevel::Warning);
    assert_eq!(h.store.creates.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn history_without_points_warns() {
    let h = harness(MemoryVisits::default());
    h.map.sign_in("user-1@example.com", "secret1").await.unwrap();

    let selection = h.map.prepare_import(b"{\"other\": []}", None).await.unwrap();
    assert!(selection.is_empty());
    assert_eq!(
        h.map.notifier().latest().unwrap().message,
        "No location data found in file"
    );
}

#[tokio::test]
async fn auto_tracking_saves_significant_moves() {
    let h = harness(MemoryVisits::default());
    h.map.sign_in("user-1@example.com", "secret1").await.unwrap();
    assert!(h.map.start_tracking().await.unwrap());
    assert!(!h.map.start_tracking().await.unwrap());
    assert_eq!(h.feed.watcher_count(), 1);

    h.feed.push_fix(fix(9.0579, 7.4951));
    // a few metres away: below the movement threshold
    h.feed.push_fix(fix(9.05791, 7.49511));
    h.feed.push_fix(fix(6.5244, 3.3792));

    let mut attempts = 0;
    while h.map.visits().len() < 2 && attempts < 100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        attempts += 1;
    }

    let visits = h.map.visits();
    assert_eq!(visits.len(), 2);
    assert!(visits.iter().all(|v| v.method == VisitMethod::AutoTracked));
    let status = h.map.tracking_status();
    assert!(status.tracker.active);
    assert_eq!(status.auto_detected_count, 2);
    assert_eq!(status.last_detected_place.as_deref(), Some("Lagos, Nigeria"));

    assert!(h.map.stop_tracking().unwrap());
    assert!(!h.map.tracking_status().tracker.enabled);
}

#[tokio::test]
async fn sign_out_clears_visits_and_tracking() {
    let h = harness(MemoryVisits::seeded(
        "user-1",
        Coordinate::new(6.5244, 3.3792).unwrap(),
        place("Lagos", "Nigeria"),
    ));
    h.map.sign_in("user-1@example.com", "secret1").await.unwrap();
    h.map.start_tracking().await.unwrap();

    h.map.sign_out().await.unwrap();
    assert!(h.map.current_user().is_none());
    assert!(h.map.visits().is_empty());
    let status = h.map.tracking_status();
    assert!(!status.tracker.enabled);
    assert!(status.tracker.last_location.is_none());
}

#[tokio::test]
async fn disposed_shell_cancels_work() {
    let h = harness(MemoryVisits::default());
    h.map.sign_in("user-1@example.com", "secret1").await.unwrap();
    h.map.dispose();
    assert!(h.map.is_disposed());

    let err = h
        .map
        .record_location(
            Coordinate::new(9.0579, 7.4951).unwrap(),
            VisitMethod::Gps,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Cancelled));
    assert_eq!(h.store.creates.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn dispose_during_geocoding_drops_the_result() {
    let gate = Arc::new(Gate::default());
    let h = harness_with(
        MemoryVisits::default(),
        Some(Arc::new(GatedGeocoder(gate.clone()))),
    );
    h.map.sign_in("user-1@example.com", "secret1").await.unwrap();

    let map = h.map.clone();
    let pending = tokio::spawn(async move {
        map.record_location(
            Coordinate::new(9.0579, 7.4951).unwrap(),
            VisitMethod::Gps,
            None,
        )
        .await
    });
    gate.entered.notified().await;
    h.map.dispose();
    gate.release.notify_one();

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, AppError::Cancelled));
    assert_eq!(h.store.creates.load(Ordering::SeqCst), 0);
    assert!(h.map.visits().is_empty());
}

#[tokio::test]
async fn dispose_during_save_keeps_the_list_unchanged() {
    let gate = Arc::new(Gate::default());
    let h = harness(MemoryVisits {
        gate: Some(gate.clone()),
        ..MemoryVisits::default()
    });
    h.map.sign_in("user-1@example.com", "secret1").await.unwrap();
    let notices_before = h.map.notifier().pending().len();

    let map = h.map.clone();
    let pending = tokio::spawn(async move {
        map.record_location(
            Coordinate::new(9.0579, 7.4951).unwrap(),
            VisitMethod::Gps,
            None,
        )
        .await
    });
    gate.entered.notified().await;
    h.map.dispose();
    gate.release.notify_one();

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, AppError::Cancelled));
    // the remote save went through; the disposed shell never sees it
    assert_eq!(h.store.creates.load(Ordering::SeqCst), 1);
    assert!(h.map.visits().is_empty());
    assert_eq!(h.map.notifier().pending().len(), notices_before);
}

#[tokio::test]
async fn dispose_during_import_detection_cancels() {
    let gate = Arc::new(Gate::default());
    let h = harness_with(
        MemoryVisits::default(),
        Some(Arc::new(GatedGeocoder(gate.clone()))),
    );
    h.map.sign_in("user-1@example.com", "secret1").await.unwrap();

    let map = h.map.clone();
    let bytes = history(&[(9.0579, 7.4951)]);
    let pending = tokio::spawn(async move { map.prepare_import(&bytes, None).await });
    gate.entered.notified().await;
    h.map.dispose();
    gate.release.notify_one();

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, AppError::Cancelled));
    assert_ne!(
        h.map.notifier().latest().unwrap().message,
        "Detected 1 unique places!"
    );
}

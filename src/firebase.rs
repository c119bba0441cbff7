use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use reqwest::{Client, Response};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::auth::{validate_credentials, AuthProvider, AuthUser, TokenSource};
use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::secrets::SecretVault;
use crate::visits::{NewVisit, Visit, VisitMethod, VisitStore, VISITS_COLLECTION};

const SESSION_ALIAS: &str = "firebase-session";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSession {
    uid: String,
    email: Option<String>,
    id_token: String,
    refresh_token: String,
    expires_at: DateTime<Utc>,
}

impl StoredSession {
    fn new(
        uid: String,
        email: Option<String>,
        id_token: String,
        refresh_token: String,
        expires_in: i64,
    ) -> Self {
        let buffer = expires_in.clamp(0, 60);
        Self {
            uid,
            email,
            id_token,
            refresh_token,
            expires_at: Utc::now() + Duration::seconds(expires_in - buffer),
        }
    }

    fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    fn user(&self) -> AuthUser {
        AuthUser {
            uid: self.uid.clone(),
            email: self.email.clone(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountResponse {
    id_token: String,
    refresh_token: String,
    local_id: String,
    email: Option<String>,
    expires_in: String,
}

#[derive(Deserialize)]
struct RefreshResponse {
    id_token: String,
    refresh_token: String,
    user_id: String,
    expires_in: String,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    status: Option<String>,
}

pub struct FirebaseAuth {
    http: Client,
    api_key: SecretString,
    auth_endpoint: String,
    token_endpoint: String,
    vault: SecretVault,
    session: Mutex<Option<StoredSession>>,
    refresh_guard: tokio::sync::Mutex<()>,
    user_tx: watch::Sender<Option<AuthUser>>,
}

impl FirebaseAuth {
    pub fn new(config: &AppConfig, vault: SecretVault) -> AppResult<Self> {
        Self::with_client(config.http_client()?, config, vault)
    }

    pub fn with_client(http: Client, config: &AppConfig, vault: SecretVault) -> AppResult<Self> {
        let api_key = config
            .firebase_api_key
            .clone()
            .ok_or_else(|| AppError::Config("FIREBASE_API_KEY is not set".into()))?;
        let (user_tx, _) = watch::channel(None);
        Ok(Self {
            http,
            api_key,
            auth_endpoint: config.firebase_auth_endpoint.trim_end_matches('/').to_string(),
            token_endpoint: config.firebase_token_endpoint.clone(),
            vault,
            session: Mutex::new(None),
            refresh_guard: tokio::sync::Mutex::new(()),
            user_tx,
        })
    }

    async fn account_request(
        &self,
        action: &str,
        email: &str,
        password: &str,
    ) -> AppResult<AuthUser> {
        validate_credentials(email, password)?;
        let url = format!("{}/accounts:{action}", self.auth_endpoint);
        let response = self
            .http
            .post(url)
            .query(&[("key", self.api_key.expose_secret())])
            .json(&json!({
                "email": email.trim(),
                "password": password,
                "returnSecureToken": true,
            }))
            .send()
            .await?;
        let response = check_auth_response(response).await?;
        let account: AccountResponse = response.json().await?;

        let session = StoredSession::new(
            account.local_id,
            account.email.or_else(|| Some(email.trim().to_string())),
            account.id_token,
            account.refresh_token,
            parse_expires_in(&account.expires_in),
        );
        self.store_session(session.clone())?;
        info!(target: "auth", uid = %session.uid, action, "firebase account session established");
        Ok(session.user())
    }

    async fn refresh(&self, refresh_token: &str) -> AppResult<StoredSession> {
        let response = self
            .http
            .post(&self.token_endpoint)
            .query(&[("key", self.api_key.expose_secret())])
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await?;

        let response = match check_auth_response(response).await {
            Ok(response) => response,
            Err(err @ AppError::Auth(_)) => {
                warn!(target: "auth", error = %err, "token refresh rejected; signing out");
                self.clear_session()?;
                return Err(err);
            }
            Err(err) => return Err(err),
        };
        let refreshed: RefreshResponse = response.json().await?;

        let email = self.session.lock().as_ref().and_then(|s| s.email.clone());
        let session = StoredSession::new(
            refreshed.user_id,
            email,
            refreshed.id_token,
            refreshed.refresh_token,
            parse_expires_in(&refreshed.expires_in),
        );
        self.store_session(session.clone())?;
        debug!(target: "auth", uid = %session.uid, "refreshed firebase id token");
        Ok(session)
    }

    fn store_session(&self, session: StoredSession) -> AppResult<()> {
        let serialized = serde_json::to_string(&session)?;
        self.vault
            .write_secret(SESSION_ALIAS, &SecretString::from(serialized))?;
        let user = session.user();
        *self.session.lock() = Some(session);
        self.user_tx.send_replace(Some(user));
        Ok(())
    }

    fn clear_session(&self) -> AppResult<()> {
        *self.session.lock() = None;
        self.user_tx.send_replace(None);
        self.vault.delete(SESSION_ALIAS)
    }
}

#[async_trait]
impl AuthProvider for FirebaseAuth {
    async fn sign_up(&self, email: &str, password: &str) -> AppResult<AuthUser> {
        self.account_request("signUp", email, password).await
    }

    async fn sign_in(&self, email: &str, password: &str) -> AppResult<AuthUser> {
        self.account_request("signInWithPassword", email, password)
            .await
    }

    async fn sign_out(&self) -> AppResult<()> {
        self.clear_session()?;
        info!(target: "auth", "signed out");
        Ok(())
    }

    async fn restore_session(&self) -> AppResult<Option<AuthUser>> {
        let Some(raw) = self.vault.read_secret(SESSION_ALIAS)? else {
            self.user_tx.send_replace(None);
            return Ok(None);
        };
        match serde_json::from_str::<StoredSession>(raw.expose_secret()) {
            Ok(session) => {
                let user = session.user();
                *self.session.lock() = Some(session);
                self.user_tx.send_replace(Some(user.clone()));
                info!(target: "auth", uid = %user.uid, "restored firebase session");
                Ok(Some(user))
            }
            Err(err) => {
                warn!(target: "auth", error = %err, "discarding unreadable stored session");
                self.clear_session()?;
                Ok(None)
            }
        }
    }

    fn subscribe(&self) -> watch::Receiver<Option<AuthUser>> {
        self.user_tx.subscribe()
    }

    fn current_user(&self) -> Option<AuthUser> {
        self.session.lock().as_ref().map(StoredSession::user)
    }
}

#[async_trait]
impl TokenSource for FirebaseAuth {
    async fn id_token(&self) -> AppResult<SecretString> {
        let current = self.session.lock().clone();
        match current {
            Some(session) if !session.is_expired() => Ok(SecretString::from(session.id_token)),
            Some(_) => {
                let _guard = self.refresh_guard.lock().await;
                // another caller may have refreshed while we waited
                let latest = self.session.lock().clone();
                match latest {
                    Some(session) if !session.is_expired() => {
                        Ok(SecretString::from(session.id_token))
                    }
                    Some(session) => {
                        let refreshed = self.refresh(&session.refresh_token).await?;
                        Ok(SecretString::from(refreshed.id_token))
                    }
                    None => Err(AppError::Auth("Please sign in first".into())),
                }
            }
            None => Err(AppError::Auth("Please sign in first".into())),
        }
    }
}

fn parse_expires_in(raw: &str) -> i64 {
    raw.trim().parse::<i64>().unwrap_or(3600)
}

async fn check_auth_response(response: Response) -> AppResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorEnvelope>(&body) {
        Ok(envelope) => Err(AppError::Auth(describe_auth_error(&envelope.error.message))),
        Err(_) => Err(AppError::Service {
            service: "firebase auth",
            message: format!("unexpected response ({status})"),
        }),
    }
}

// codes may carry a detail suffix, e.g. `WEAK_PASSWORD : ...`
pub fn describe_auth_error(raw: &str) -> String {
    let code = raw.split(':').next().unwrap_or_default().trim();
    match code {
        "EMAIL_EXISTS" => "An account with this email already exists".into(),
        "INVALID_EMAIL" | "MISSING_EMAIL" => "Please enter a valid email address".into(),
        "WEAK_PASSWORD" | "MISSING_PASSWORD" => {
            "Password should be at least 6 characters".into()
        }
        "EMAIL_NOT_FOUND" | "INVALID_PASSWORD" | "INVALID_LOGIN_CREDENTIALS" => {
            "Invalid email or password".into()
        }
        "USER_DISABLED" => "This account has been disabled".into(),
        "TOO_MANY_ATTEMPTS_TRY_LATER" => "Too many attempts. Please try again later".into(),
        "TOKEN_EXPIRED" | "INVALID_REFRESH_TOKEN" | "USER_NOT_FOUND" | "INVALID_ID_TOKEN" => {
            "Your session has expired. Please sign in again".into()
        }
        "" => "Authentication failed".into(),
        other => format!("Authentication failed: {other}"),
    }
}

pub struct FirestoreVisits {
    http: Client,
    documents_url: String,
    tokens: Arc<dyn TokenSource>,
}

impl FirestoreVisits {
    pub fn new(config: &AppConfig, tokens: Arc<dyn TokenSource>) -> AppResult<Self> {
        Self::with_client(config.http_client()?, config, tokens)
    }

    pub fn with_client(
        http: Client,
        config: &AppConfig,
        tokens: Arc<dyn TokenSource>,
    ) -> AppResult<Self> {
        let project_id = config
            .firebase_project_id
            .as_deref()
            .ok_or_else(|| AppError::Config("FIREBASE_PROJECT_ID is not set".into()))?;
        Ok(Self {
            http,
            documents_url: format!(
                "{}/projects/{project_id}/databases/(default)/documents",
                config.firestore_api_base.trim_end_matches('/')
            ),
            tokens,
        })
    }
}

#[async_trait]
impl VisitStore for FirestoreVisits {
    async fn create_visit(&self, user_id: &str, visit: &NewVisit) -> AppResult<Visit> {
        let token = self.tokens.id_token().await?;
        let created_at = Utc::now();
        let response = self
            .http
            .post(format!("{}/{VISITS_COLLECTION}", self.documents_url))
            .bearer_auth(token.expose_secret())
            .json(&json!({ "fields": encode_visit(user_id, visit, created_at) }))
            .send()
            .await?;
        let document: Document = check_firestore_response(response).await?.json().await?;
        let saved = decode_visit(&document)?;
        debug!(target: "visits", id = %saved.id, city = %saved.city, "visit saved");
        Ok(saved)
    }

    async fn list_visits(&self, user_id: &str) -> AppResult<Vec<Visit>> {
        #[derive(Deserialize)]
        struct QueryRow {
            document: Option<Document>,
        }

        let token = self.tokens.id_token().await?;
        let query = json!({
            "structuredQuery": {
                "from": [{ "collectionId": VISITS_COLLECTION }],
                "where": {
                    "fieldFilter": {
                        "field": { "fieldPath": "userId" },
                        "op": "EQUAL",
                        "value": { "stringValue": user_id }
                    }
                },
                "orderBy": [{
                    "field": { "fieldPath": "createdAt" },
                    "direction": "DESCENDING"
                }]
            }
        });
        let response = self
            .http
            .post(format!("{}:runQuery", self.documents_url))
            .bearer_auth(token.expose_secret())
            .json(&query)
            .send()
            .await?;
        let rows: Vec<QueryRow> = check_firestore_response(response).await?.json().await?;

        let mut visits = Vec::with_capacity(rows.len());
        for document in rows.into_iter().filter_map(|row| row.document) {
            match decode_visit(&document) {
                Ok(visit) => visits.push(visit),
                Err(err) => {
                    warn!(target: "visits", name = %document.name, error = %err, "skipping malformed visit")
                }
            }
        }
        visits.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        debug!(target: "visits", count = visits.len(), "visits loaded");
        Ok(visits)
    }

    async fn delete_visit(&self, visit_id: &str) -> AppResult<()> {
        if visit_id.is_empty() || visit_id.contains('/') {
            return Err(AppError::Parse(format!("invalid visit id: {visit_id}")));
        }
        let token = self.tokens.id_token().await?;
        let response = self
            .http
            .delete(format!("{}/{VISITS_COLLECTION}/{visit_id}", self.documents_url))
            .bearer_auth(token.expose_secret())
            .send()
            .await?;
        check_firestore_response(response).await?;
        debug!(target: "visits", id = visit_id, "visit deleted");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct Document {
    name: String,
    #[serde(default)]
    fields: Map<String, Value>,
}

async fn check_firestore_response(response: Response) -> AppResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let error = serde_json::from_str::<ErrorEnvelope>(&body).ok().map(|e| e.error);
    let message = error
        .as_ref()
        .map(|e| e.message.clone())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| format!("unexpected response ({status})"));
    match error.and_then(|e| e.status).as_deref() {
        Some("UNAUTHENTICATED") | Some("PERMISSION_DENIED") => Err(AppError::Auth(message)),
        _ => Err(AppError::Service {
            service: "firestore",
            message,
        }),
    }
}

fn encode_visit(user_id: &str, visit: &NewVisit, created_at: DateTime<Utc>) -> Value {
    let mut fields: HashMap<&str, Value> = HashMap::new();
    fields.insert("userId", string_value(user_id));
    fields.insert("lat", json!({ "doubleValue": visit.lat }));
    fields.insert("lng", json!({ "doubleValue": visit.lng }));
    fields.insert("city", string_value(&visit.city));
    fields.insert("state", string_value(&visit.state));
    fields.insert("country", string_value(&visit.country));
    fields.insert("formatted", string_value(&visit.formatted));
    fields.insert("method", string_value(visit.method.as_str()));
    fields.insert("timestamp", string_value(&visit.timestamp.to_rfc3339()));
    fields.insert("createdAt", string_value(&created_at.to_rfc3339()));
    json!(fields)
}

fn string_value(value: &str) -> Value {
    json!({ "stringValue": value })
}

fn decode_visit(document: &Document) -> AppResult<Visit> {
    let id = document
        .name
        .rsplit('/')
        .next()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::Parse(format!("document without id: {}", document.name)))?
        .to_string();
    let fields = &document.fields;
    let created_at = field_time(fields, "createdAt")?;
    Ok(Visit {
        id,
        user_id: field_string(fields, "userId")?,
        lat: field_f64(fields, "lat")?,
        lng: field_f64(fields, "lng")?,
        city: field_string(fields, "city")?,
        state: field_string(fields, "state")?,
        country: field_string(fields, "country")?,
        formatted: field_string(fields, "formatted")?,
        method: VisitMethod::parse(&field_string(fields, "method")?)?,
        timestamp: field_time(fields, "timestamp").unwrap_or(created_at),
        created_at,
    })
}

fn field<'a>(fields: &'a Map<String, Value>, name: &str) -> AppResult<&'a Value> {
    fields
        .get(name)
        .ok_or_else(|| AppError::Parse(format!("visit field `{name}` missing")))
}

fn field_string(fields: &Map<String, Value>, name: &str) -> AppResult<String> {
    field(fields, name)?
        .get("stringValue")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| AppError::Parse(format!("visit field `{name}` is not a string")))
}

// Numbers written by other clients may arrive as integerValue, which the REST
// API encodes as a string.
fn field_f64(fields: &Map<String, Value>, name: &str) -> AppResult<f64> {
    let value = field(fields, name)?;
    value
        .get("doubleValue")
        .and_then(Value::as_f64)
        .or_else(|| {
            value.get("integerValue").and_then(|raw| match raw {
                Value::String(text) => text.parse::<f64>().ok(),
                other => other.as_f64(),
            })
        })
        .ok_or_else(|| AppError::Parse(format!("visit field `{name}` is not a number")))
}

fn field_time(fields: &Map<String, Value>, name: &str) -> AppResult<DateTime<Utc>> {
    let value = field(fields, name)?;
    value
        .get("stringValue")
        .or_else(|| value.get("timestampValue"))
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|stamp| stamp.with_timezone(&Utc))
        .ok_or_else(|| AppError::Parse(format!("visit field `{name}` is not a timestamp")))
}

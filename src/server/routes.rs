//! JSON routes for the key manager API.
//!
//! All mutating endpoints take `POST`; `OPTIONS` answers 204 with an
//! `Allow` header. Inputs are trimmed, and empty passwords are rejected
//! before any crypto work. Errors are `{"error": code, "reason": text}`
//! with status 400, 500 or 503.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::error::KeyError;
use crate::keymgr::KeyMgr;
use crate::store::Store;

pub fn api_routes<S: Store + 'static>() -> Router<AppState<S>> {
    Router::new()
        .route("/create", post(create::<S>).options(preflight_post))
        .route("/login", post(login::<S>).options(preflight_post))
        .route("/roll-token", post(roll_token::<S>).options(preflight_post))
        .route("/logout", post(logout::<S>).options(preflight_post))
        .route(
            "/change-password",
            post(change_password::<S>).options(preflight_post),
        )
        .route(
            "/recover-password",
            post(recover_password::<S>).options(preflight_post),
        )
        .route(
            "/create-delegate",
            post(create_delegate::<S>).options(preflight_post),
        )
        .route(
            "/get-delegate-key",
            post(get_delegate_key::<S>).options(preflight_post),
        )
        .route(
            "/get-delegate-pub",
            get(get_delegate_pub_query::<S>)
                .post(get_delegate_pub::<S>)
                .options(preflight_get_post),
        )
        .route(
            "/make-delegate",
            post(make_delegate::<S>).options(preflight_post),
        )
}

async fn preflight_post() -> impl IntoResponse {
    (StatusCode::NO_CONTENT, [(header::ALLOW, "POST, OPTIONS")])
}

async fn preflight_get_post() -> impl IntoResponse {
    (StatusCode::NO_CONTENT, [(header::ALLOW, "GET, POST, OPTIONS")])
}

// ─── Errors ──────────────────────────────────────────────

pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    reason: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    reason: String,
}

impl ApiError {
    fn field(code: &'static str, reason: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code,
            reason: reason.into(),
        }
    }

    fn internal(reason: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "error",
            reason: reason.into(),
        }
    }

    fn bad_json(rejection: JsonRejection) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad-request",
            reason: format!("decoding request: {rejection}"),
        }
    }

    fn bad_query(rejection: QueryRejection) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad-request",
            reason: format!("decoding query: {rejection}"),
        }
    }
}

impl From<KeyError> for ApiError {
    fn from(e: KeyError) -> Self {
        let reason = e.to_string();
        let (status, code) = match e {
            KeyError::OutOfEntropy => (StatusCode::SERVICE_UNAVAILABLE, "entropy"),
            KeyError::WrongPassword => (StatusCode::BAD_REQUEST, "password"),
            KeyError::BadToken => (StatusCode::BAD_REQUEST, "token"),
            KeyError::WrongToken => (StatusCode::BAD_REQUEST, "wrong-token"),
            KeyError::KeyExists | KeyError::AlreadyExists => (StatusCode::BAD_REQUEST, "exists"),
            KeyError::NotFound => (StatusCode::BAD_REQUEST, "not-found"),
            KeyError::NoKey => (StatusCode::BAD_REQUEST, "nokey"),
            KeyError::TooManyAttempts => (StatusCode::INTERNAL_SERVER_ERROR, "attempts"),
            KeyError::WrongMnemonic | KeyError::Mnemonic(_) => {
                (StatusCode::BAD_REQUEST, "mnemonic")
            }
            KeyError::MnemonicLength => (StatusCode::BAD_REQUEST, "length"),
            KeyError::MnemonicWord => (StatusCode::BAD_REQUEST, "wordlist"),
            KeyError::MnemonicChecksum => (StatusCode::BAD_REQUEST, "checksum"),
            KeyError::BadKey(_) => (StatusCode::INTERNAL_SERVER_ERROR, "bad-key"),
            KeyError::DbConflict | KeyError::Db(_) | KeyError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "error")
            }
        };
        Self {
            status,
            code,
            reason,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.code,
                reason: self.reason,
            }),
        )
            .into_response()
    }
}

// ─── Helpers ─────────────────────────────────────────────

/// Run a key-manager operation on the blocking pool; the Argon2id KDF must
/// not stall the async workers.
async fn run<S, T, F>(state: &AppState<S>, f: F) -> Result<T, ApiError>
where
    S: Store + 'static,
    T: Send + 'static,
    F: FnOnce(&KeyMgr<S>) -> crate::error::Result<T> + Send + 'static,
{
    let km = state.keymgr.clone();
    tokio::task::spawn_blocking(move || f(&km))
        .await
        .map_err(|e| ApiError::internal(format!("blocking task failed: {e}")))?
        .map_err(ApiError::from)
}

fn require(value: &str, code: &'static str, what: &str) -> Result<String, ApiError> {
    let v = value.trim();
    if v.is_empty() {
        return Err(ApiError::field(code, format!("{what} must not be empty")));
    }
    Ok(v.to_string())
}

#[derive(Serialize)]
struct Empty {}

#[derive(Serialize)]
struct SessionResponse {
    token: String,
    valid_for: u64,
}

#[derive(Serialize)]
struct ChangedResponse {
    changed: bool,
}

// ─── Master key ──────────────────────────────────────────

#[derive(Deserialize)]
struct CreateRequest {
    password: String,
}

#[derive(Serialize)]
struct CreateResponse {
    seedphrase: Vec<String>,
}

/// POST /create — generate the master key, returning the mnemonic.
async fn create<S: Store + 'static>(
    State(state): State<AppState<S>>,
    payload: Result<Json<CreateRequest>, JsonRejection>,
) -> Result<Json<CreateResponse>, ApiError> {
    let Json(req) = payload.map_err(ApiError::bad_json)?;
    let password = require(&req.password, "password", "password")?;
    let seedphrase = run(&state, move |km| km.create_key(&password)).await?;
    Ok(Json(CreateResponse { seedphrase }))
}

#[derive(Deserialize)]
struct LoginRequest {
    password: String,
}

/// POST /login — verify the password and open a session.
async fn login<S: Store + 'static>(
    State(state): State<AppState<S>>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<SessionResponse>, ApiError> {
    let Json(req) = payload.map_err(ApiError::bad_json)?;
    let password = require(&req.password, "password", "password")?;
    let (token, valid_for) = run(&state, move |km| km.login(&password)).await?;
    Ok(Json(SessionResponse { token, valid_for }))
}

#[derive(Deserialize)]
struct TokenRequest {
    token: String,
}

/// POST /roll-token — exchange a live session token for a fresh one.
async fn roll_token<S: Store + 'static>(
    State(state): State<AppState<S>>,
    payload: Result<Json<TokenRequest>, JsonRejection>,
) -> Result<Json<SessionResponse>, ApiError> {
    let Json(req) = payload.map_err(ApiError::bad_json)?;
    let token = req.token.trim().to_string();
    let (token, valid_for) = run(&state, move |km| km.roll_token(&token)).await?;
    Ok(Json(SessionResponse { token, valid_for }))
}

/// POST /logout — invalidate a session token.
async fn logout<S: Store + 'static>(
    State(state): State<AppState<S>>,
    payload: Result<Json<TokenRequest>, JsonRejection>,
) -> Result<Json<Empty>, ApiError> {
    let Json(req) = payload.map_err(ApiError::bad_json)?;
    let token = req.token.trim().to_string();
    run(&state, move |km| km.logout(&token)).await?;
    Ok(Json(Empty {}))
}

#[derive(Deserialize)]
struct ChangePasswordRequest {
    password: String,
    new_password: String,
}

/// POST /change-password — re-seal the master under a new password.
async fn change_password<S: Store + 'static>(
    State(state): State<AppState<S>>,
    payload: Result<Json<ChangePasswordRequest>, JsonRejection>,
) -> Result<Json<ChangedResponse>, ApiError> {
    let Json(req) = payload.map_err(ApiError::bad_json)?;
    let password = require(&req.password, "password", "password")?;
    let new_password = require(&req.new_password, "newpassword", "new password")?;
    run(&state, move |km| km.change_password(&password, &new_password)).await?;
    Ok(Json(ChangedResponse { changed: true }))
}

#[derive(Deserialize)]
struct RecoverPasswordRequest {
    seedphrase: Vec<String>,
    new_password: String,
}

/// POST /recover-password — re-seal the master under a new password,
/// authenticated by the mnemonic backup.
async fn recover_password<S: Store + 'static>(
    State(state): State<AppState<S>>,
    payload: Result<Json<RecoverPasswordRequest>, JsonRejection>,
) -> Result<Json<ChangedResponse>, ApiError> {
    let Json(req) = payload.map_err(ApiError::bad_json)?;
    let new_password = require(&req.new_password, "newpassword", "new password")?;
    let words: Vec<String> = req
        .seedphrase
        .iter()
        .map(|w| w.trim().to_string())
        .collect();
    run(&state, move |km| km.recover_password(&words, &new_password)).await?;
    Ok(Json(ChangedResponse { changed: true }))
}

// ─── Delegates ───────────────────────────────────────────

#[derive(Deserialize)]
struct CreateDelegateRequest {
    id: String,
    password: String,
}

#[derive(Serialize)]
struct CreateDelegateResponse {
    token: String,
    #[serde(rename = "pub")]
    pubkey: String,
}

/// POST /create-delegate — mint a delegate key for an application id,
/// authenticated by password.
async fn create_delegate<S: Store + 'static>(
    State(state): State<AppState<S>>,
    payload: Result<Json<CreateDelegateRequest>, JsonRejection>,
) -> Result<Json<CreateDelegateResponse>, ApiError> {
    let Json(req) = payload.map_err(ApiError::bad_json)?;
    let id = require(&req.id, "bad-request", "id")?;
    let password = require(&req.password, "password", "password")?;
    let (token, pubkey) = run(&state, move |km| km.create_delegate(&id, &password)).await?;
    Ok(Json(CreateDelegateResponse {
        token,
        pubkey: hex::encode(pubkey),
    }))
}

#[derive(Deserialize)]
struct DelegateKeyRequest {
    id: String,
    token: String,
}

#[derive(Serialize)]
struct DelegateKeyResponse {
    #[serde(rename = "priv")]
    privkey: String,
    #[serde(rename = "pub")]
    pubkey: String,
}

/// POST /get-delegate-key — recover a delegate private key with its token.
async fn get_delegate_key<S: Store + 'static>(
    State(state): State<AppState<S>>,
    payload: Result<Json<DelegateKeyRequest>, JsonRejection>,
) -> Result<Json<DelegateKeyResponse>, ApiError> {
    let Json(req) = payload.map_err(ApiError::bad_json)?;
    let id = require(&req.id, "bad-request", "id")?;
    let token = req.token.trim().to_string();
    let (secret, pubkey) = run(&state, move |km| km.delegate_priv(&id, &token)).await?;
    Ok(Json(DelegateKeyResponse {
        privkey: hex::encode(secret.as_bytes()),
        pubkey: hex::encode(pubkey),
    }))
}

#[derive(Deserialize)]
struct DelegatePubRequest {
    id: String,
}

#[derive(Serialize)]
struct DelegatePubResponse {
    #[serde(rename = "pub")]
    pubkey: String,
}

/// POST /get-delegate-pub — public key of a delegate.
async fn get_delegate_pub<S: Store + 'static>(
    State(state): State<AppState<S>>,
    payload: Result<Json<DelegatePubRequest>, JsonRejection>,
) -> Result<Json<DelegatePubResponse>, ApiError> {
    let Json(req) = payload.map_err(ApiError::bad_json)?;
    let id = require(&req.id, "bad-request", "id")?;
    delegate_pub_response(&state, id).await
}

/// GET /get-delegate-pub?id= — query-string variant.
async fn get_delegate_pub_query<S: Store + 'static>(
    State(state): State<AppState<S>>,
    query: Result<Query<DelegatePubRequest>, QueryRejection>,
) -> Result<Json<DelegatePubResponse>, ApiError> {
    let Query(req) = query.map_err(ApiError::bad_query)?;
    let id = require(&req.id, "bad-request", "id")?;
    delegate_pub_response(&state, id).await
}

async fn delegate_pub_response<S: Store + 'static>(
    state: &AppState<S>,
    id: String,
) -> Result<Json<DelegatePubResponse>, ApiError> {
    let pubkey = run(state, move |km| km.delegate_pub(&id)).await?;
    Ok(Json(DelegatePubResponse {
        pubkey: hex::encode(pubkey),
    }))
}

#[derive(Deserialize)]
struct MakeDelegateRequest {
    id: String,
    token: String,
}

#[derive(Serialize)]
struct MakeDelegateResponse {
    #[serde(rename = "priv")]
    privkey: String,
    #[serde(rename = "pub")]
    pubkey: String,
    wif: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<String>,
}

/// POST /make-delegate — session-authenticated delegate mint from the
/// cached master. Returns the delegate token only on the creating call.
async fn make_delegate<S: Store + 'static>(
    State(state): State<AppState<S>>,
    payload: Result<Json<MakeDelegateRequest>, JsonRejection>,
) -> Result<Json<MakeDelegateResponse>, ApiError> {
    let Json(req) = payload.map_err(ApiError::bad_json)?;
    let id = require(&req.id, "bad-request", "id")?;
    let token = req.token.trim().to_string();
    let delegate = run(&state, move |km| km.make_delegate(&id, &token)).await?;
    Ok(Json(MakeDelegateResponse {
        privkey: hex::encode(delegate.secret.as_bytes()),
        pubkey: hex::encode(&delegate.pubkey),
        wif: delegate.wif.to_string(),
        token: delegate.token,
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::super::{build_app, AppState};
    use crate::keymgr::KeyMgr;
    use crate::store::memory::MemoryStore;

    fn app() -> axum::Router {
        build_app(AppState {
            keymgr: Arc::new(KeyMgr::new(MemoryStore::new())),
        })
    }

    async fn post(app: &axum::Router, path: &str, body: Value) -> (StatusCode, Value) {
        let req = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        send(app, req).await
    }

    async fn send(app: &axum::Router, req: Request<Body>) -> (StatusCode, Value) {
        let res = app.clone().oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            json!(null)
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn master_key_lifecycle() {
        let app = app();

        // no key yet
        let (status, body) = post(&app, "/login", json!({"password": "suchpass"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "nokey");

        let (status, body) = post(&app, "/create", json!({"password": "suchpass"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["seedphrase"].as_array().unwrap().len(), 24);

        let (status, body) = post(&app, "/create", json!({"password": "whatever"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "exists");

        let (status, body) = post(&app, "/login", json!({"password": "wrong"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "password");

        let (status, body) = post(&app, "/login", json!({"password": "suchpass"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["valid_for"], 600);
        let token = body["token"].as_str().unwrap().to_string();
        assert_eq!(token.len(), 32);

        // roll once, then the old token is dead
        let (status, body) = post(&app, "/roll-token", json!({"token": token})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["valid_for"], 600);
        let fresh = body["token"].as_str().unwrap().to_string();
        assert_ne!(fresh, token);

        let (status, body) = post(&app, "/roll-token", json!({"token": token})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "token");

        let (status, body) = post(&app, "/logout", json!({"token": fresh})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({}));
    }

    #[tokio::test]
    async fn empty_inputs_rejected_before_crypto() {
        let app = app();

        let (status, body) = post(&app, "/create", json!({"password": "  "})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "password");

        let (status, body) = post(
            &app,
            "/change-password",
            json!({"password": "x", "new_password": ""}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "newpassword");

        let (status, body) = post(&app, "/login", json!({"nope": true})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "bad-request");
    }

    #[tokio::test]
    async fn password_change_and_recovery() {
        let app = app();

        let (_, body) = post(&app, "/create", json!({"password": "suchpass"})).await;
        let words = body["seedphrase"].clone();

        let (status, body) = post(
            &app,
            "/change-password",
            json!({"password": "suchpass", "new_password": "betterpass"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["changed"], true);

        let (status, _) = post(&app, "/login", json!({"password": "betterpass"})).await;
        assert_eq!(status, StatusCode::OK);

        // recovery with a mangled mnemonic fails word-by-word checks
        let (status, body) = post(
            &app,
            "/recover-password",
            json!({"seedphrase": ["zzzz"], "new_password": "wowsecure"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "length");

        let (status, body) = post(
            &app,
            "/recover-password",
            json!({"seedphrase": words, "new_password": "wowsecure"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["changed"], true);

        let (status, body) = post(&app, "/login", json!({"password": "betterpass"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "password");

        let (status, _) = post(&app, "/login", json!({"password": "wowsecure"})).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn delegate_endpoints() {
        let app = app();
        post(&app, "/create", json!({"password": "suchpass"})).await;

        let (status, body) = post(
            &app,
            "/create-delegate",
            json!({"id": "pup.alpha", "password": "suchpass"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let token = body["token"].as_str().unwrap().to_string();
        let pubkey = body["pub"].as_str().unwrap().to_string();
        assert_eq!(token.len(), 64);
        assert_eq!(pubkey.len(), 66);

        let (status, body) = post(
            &app,
            "/create-delegate",
            json!({"id": "pup.alpha", "password": "suchpass"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "exists");

        let (status, body) = post(&app, "/get-delegate-pub", json!({"id": "pup.alpha"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pub"], pubkey);

        let req = Request::builder()
            .method(Method::GET)
            .uri("/get-delegate-pub?id=pup.alpha")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pub"], pubkey);

        let (status, body) = post(&app, "/get-delegate-pub", json!({"id": "pup.beta"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "not-found");

        let wrong = "ab".repeat(32);
        let (status, body) = post(
            &app,
            "/get-delegate-key",
            json!({"id": "pup.alpha", "token": wrong}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "wrong-token");

        let (status, body) = post(
            &app,
            "/get-delegate-key",
            json!({"id": "pup.alpha", "token": token}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["priv"].as_str().unwrap().len(), 64);
        assert_eq!(body["pub"], pubkey);
    }

    #[tokio::test]
    async fn make_delegate_uses_the_session() {
        let app = app();
        post(&app, "/create", json!({"password": "suchpass"})).await;

        let (status, body) = post(
            &app,
            "/make-delegate",
            json!({"id": "pup.alpha", "token": "deadbeef"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "token");

        let (_, body) = post(&app, "/login", json!({"password": "suchpass"})).await;
        let session = body["token"].as_str().unwrap().to_string();

        let (status, body) = post(
            &app,
            "/make-delegate",
            json!({"id": "pup.alpha", "token": session}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["priv"].as_str().unwrap().len(), 64);
        assert_eq!(body["pub"].as_str().unwrap().len(), 66);
        assert!(body["wif"].as_str().unwrap().starts_with("xprv"));
        assert_eq!(body["token"].as_str().unwrap().len(), 64);
        let pubkey = body["pub"].clone();

        // second call re-derives, no fresh token
        let (status, body) = post(
            &app,
            "/make-delegate",
            json!({"id": "pup.alpha", "token": session}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pub"], pubkey);
        assert!(body.get("token").is_none());
    }

    #[tokio::test]
    async fn options_preflight() {
        let app = app();
        let req = Request::builder()
            .method(Method::OPTIONS)
            .uri("/create")
            .body(Body::empty())
            .unwrap();
        let res = app.clone().oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
        assert_eq!(res.headers()["allow"], "POST, OPTIONS");
    }
}


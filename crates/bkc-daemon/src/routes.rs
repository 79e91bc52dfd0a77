//! Axum router and all HTTP handlers for bkc-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. Handlers are thin: taps and reads go to the engine,
//! everything else that moves coins goes through the treasury, which passes
//! the consistency gate first.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;

use bkc_db::StoreError;
use bkc_econ::normalize_requested;
use bkc_tap::TapError;

use crate::{
    api_types::{
        AdminSendRequest, BuyRequest, BuyResponse, DepositRequest, DepositSettleRequest,
        ErrorResponse, FlushResponse, HealthResponse, LedgerRequest, LedgerResponse, OkResponse,
        ReleaseResponse, ShopItem, StateResponse, TapRequest, TapResponse, TransferRequest,
        UserRequest,
    },
    state::{uptime_secs, AppState},
};

pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

const DEFAULT_LEDGER_LIMIT: i64 = 50;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are not applied here; `main.rs`
/// attaches them so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/state", post(user_state))
        .route("/v1/tap", post(tap))
        .route("/v1/flush", post(flush))
        .route("/v1/transfer", post(transfer))
        .route("/v1/buy", post(buy))
        .route("/v1/ledger", post(ledger))
        .route("/v1/admin/reserve/send", post(admin_reserve_send))
        .route("/v1/admin/deposit/reserve", post(admin_deposit_reserve))
        .route("/v1/admin/deposit/settle", post(admin_deposit_settle))
        .route("/v1/admin/quarantine/release", post(admin_release_quarantine))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

pub(crate) enum ApiError {
    Tap(TapError),
    Forbidden(&'static str),
    Unauthorized,
}

impl From<TapError> for ApiError {
    fn from(e: TapError) -> Self {
        ApiError::Tap(e)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Tap(TapError::Store(e))
    }
}

fn status_for(e: &TapError) -> StatusCode {
    if e.is_retryable() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    match e {
        TapError::Store(StoreError::InsufficientBalance { .. })
        | TapError::Store(StoreError::InsufficientReserve { .. })
        | TapError::Store(StoreError::Invalid(_)) => StatusCode::BAD_REQUEST,
        TapError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
        TapError::Quarantined { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::Tap(e) => {
                let status = status_for(&e);
                let mut msg = e.to_string();
                if e.is_retryable() && !msg.ends_with("retry") {
                    msg.push_str(", retry");
                }
                if status == StatusCode::INTERNAL_SERVER_ERROR {
                    tracing::error!(error = %e, "request failed");
                }
                (status, msg)
            }
            ApiError::Forbidden(why) => (StatusCode::FORBIDDEN, why.to_string()),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "bad admin token".to_string()),
        };
        (status, Json(ErrorResponse { ok: false, error })).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn require_admin(st: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = st.admin_token.as_deref() else {
        return Err(ApiError::Forbidden("admin routes disabled"));
    };
    let given = headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if given != expected {
        tracing::warn!("admin route called with a bad token");
        return Err(ApiError::Unauthorized);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
            uptime_secs: uptime_secs(),
            storage: st.storage,
            engine: st.engine.stats().await,
        }),
    )
}

// ---------------------------------------------------------------------------
// POST /v1/state
// ---------------------------------------------------------------------------

pub(crate) async fn user_state(
    State(st): State<Arc<AppState>>,
    Json(req): Json<UserRequest>,
) -> ApiResult<StateResponse> {
    let state = st.engine.snapshot(req.user_id, Utc::now()).await?;
    Ok(Json(StateResponse {
        ok: true,
        mode: st.engine.mode().as_str(),
        state,
    }))
}

// ---------------------------------------------------------------------------
// POST /v1/tap
// ---------------------------------------------------------------------------

pub(crate) async fn tap(
    State(st): State<Arc<AppState>>,
    Json(req): Json<TapRequest>,
) -> ApiResult<TapResponse> {
    let requested = normalize_requested(req.count.unwrap_or(1), st.engine.params().max_per_request);
    let out = st.engine.tap(req.user_id, requested, Utc::now()).await?;
    Ok(Json(TapResponse::new(st.engine.mode().as_str(), out)))
}

// ---------------------------------------------------------------------------
// POST /v1/flush
// ---------------------------------------------------------------------------

pub(crate) async fn flush(State(st): State<Arc<AppState>>) -> ApiResult<FlushResponse> {
    let report = st.engine.flush().await?;
    Ok(Json(FlushResponse { ok: true, report }))
}

// ---------------------------------------------------------------------------
// POST /v1/transfer
// ---------------------------------------------------------------------------

pub(crate) async fn transfer(
    State(st): State<Arc<AppState>>,
    Json(req): Json<TransferRequest>,
) -> ApiResult<OkResponse> {
    st.treasury.transfer(req.from_id, req.to_id, req.amount).await?;
    Ok(Json(OkResponse { ok: true }))
}

// ---------------------------------------------------------------------------
// POST /v1/buy
// ---------------------------------------------------------------------------

pub(crate) async fn buy(
    State(st): State<Arc<AppState>>,
    Json(req): Json<BuyRequest>,
) -> ApiResult<BuyResponse> {
    let now = Utc::now();
    let shop = st.treasury.shop();
    let (price, quota) = match req.item {
        ShopItem::EnergyBoost => {
            st.treasury.buy_energy_boost(req.user_id, now).await?;
            (shop.energy_boost_price, None)
        }
        ShopItem::TapPack => {
            let quota = st.treasury.buy_tap_pack(req.user_id, now).await?;
            (shop.tap_pack_price, Some(quota))
        }
    };
    let state = st.engine.snapshot(req.user_id, now).await?;
    Ok(Json(BuyResponse {
        ok: true,
        item: req.item,
        price,
        quota,
        state,
    }))
}

// ---------------------------------------------------------------------------
// POST /v1/ledger
// ---------------------------------------------------------------------------

pub(crate) async fn ledger(
    State(st): State<Arc<AppState>>,
    Json(req): Json<LedgerRequest>,
) -> ApiResult<LedgerResponse> {
    let limit = req.limit.unwrap_or(DEFAULT_LEDGER_LIMIT);
    let entries = st.treasury.history(req.user_id, limit).await?;
    Ok(Json(LedgerResponse { ok: true, entries }))
}

// ---------------------------------------------------------------------------
// POST /v1/admin/reserve/send
// ---------------------------------------------------------------------------

pub(crate) async fn admin_reserve_send(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<AdminSendRequest>,
) -> ApiResult<OkResponse> {
    require_admin(&st, &headers)?;
    st.treasury
        .admin_reserve_send(req.to_id, req.amount, req.note)
        .await?;
    Ok(Json(OkResponse { ok: true }))
}

// ---------------------------------------------------------------------------
// POST /v1/admin/deposit/reserve  /v1/admin/deposit/settle
// ---------------------------------------------------------------------------

pub(crate) async fn admin_deposit_reserve(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<DepositRequest>,
) -> ApiResult<OkResponse> {
    require_admin(&st, &headers)?;
    st.treasury.reserve_deposit(req.user_id, req.amount).await?;
    Ok(Json(OkResponse { ok: true }))
}

pub(crate) async fn admin_deposit_settle(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<DepositSettleRequest>,
) -> ApiResult<OkResponse> {
    require_admin(&st, &headers)?;
    st.treasury
        .settle_deposit(req.user_id, req.amount, req.approve)
        .await?;
    Ok(Json(OkResponse { ok: true }))
}

// ---------------------------------------------------------------------------
// POST /v1/admin/quarantine/release
// ---------------------------------------------------------------------------

pub(crate) async fn admin_release_quarantine(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<UserRequest>,
) -> ApiResult<ReleaseResponse> {
    require_admin(&st, &headers)?;
    let released = st.engine.release_quarantine(req.user_id).await?;
    Ok(Json(ReleaseResponse { ok: true, released }))
}

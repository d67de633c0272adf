use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::betting::odds::{MarketSpec, Price, Wager};
use crate::betting::PublishedRuns;
use crate::db::models::Selection;
use crate::db::{Database, RecommendationFilter};
use crate::ledger::{Ledger, LedgerError, PlaceBet};

const RECOMMENDATION_LIMIT: i64 = 200;

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub ledger: Arc<Ledger>,
    /// Runs finished this session, served ahead of the store
    pub published: PublishedRuns,
}

/// Build the Axum router for the query and placement API.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/simulations", get(simulations_handler))
        .route("/api/simulations/:game_id", get(simulation_handler))
        .route("/api/recommendations", get(recommendations_handler))
        .route("/api/wallets", get(wallets_handler))
        .route("/api/wallets/:id", get(wallet_handler))
        .route("/api/wallets/:id/bets", get(wallet_bets_handler))
        .route("/api/bets", post(place_bet_handler))
        .route("/api/bets/:id", get(bet_handler))
        .route("/api/bets/:id/void", post(void_bet_handler))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// JSON error body with a status code.
pub struct ApiError(StatusCode, String);

impl ApiError {
    fn internal(err: anyhow::Error) -> Self {
        ApiError(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        let status = match &err {
            LedgerError::WalletNotFound(_) | LedgerError::GameNotFound(_) | LedgerError::BetNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            LedgerError::InsufficientBalance { .. }
            | LedgerError::GameAlreadyFinal(_)
            | LedgerError::AlreadySettled(_) => StatusCode::CONFLICT,
            LedgerError::InvalidStake(_) | LedgerError::NegativeBalance(_) | LedgerError::InvalidWager(_) => {
                StatusCode::BAD_REQUEST
            }
            LedgerError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, err.to_string())
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct SimulationQuery {
    game_id: Option<String>,
}

/// GET /api/simulations?game_id=
async fn simulations_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<SimulationQuery>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .db
        .list_simulations(q.game_id.as_deref())
        .map(Json)
        .map_err(ApiError::internal)
}

/// GET /api/simulations/:game_id
async fn simulation_handler(
    State(state): State<Arc<AppState>>,
    Path(game_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(summary) = state.published.get(&game_id) {
        return Ok(Json(summary));
    }
    match state.db.get_simulation(&game_id).map_err(ApiError::internal)? {
        Some(summary) => Ok(Json(summary)),
        None => Err(ApiError(
            StatusCode::NOT_FOUND,
            format!("no simulation for game {game_id}"),
        )),
    }
}

#[derive(Debug, Deserialize)]
struct RecommendationQuery {
    game_id: Option<String>,
    player: Option<String>,
    market: Option<String>,
}

/// GET /api/recommendations?game_id=&player=&market=
async fn recommendations_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<RecommendationQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = RecommendationFilter {
        game_id: q.game_id,
        player: q.player,
        market: q.market,
    };
    state
        .db
        .list_recommendations(&filter, RECOMMENDATION_LIMIT)
        .map(Json)
        .map_err(ApiError::internal)
}

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError(StatusCode::BAD_REQUEST, format!("invalid id '{raw}'")))
}

/// GET /api/wallets
async fn wallets_handler(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let mut wallets = state.ledger.wallets()?;
    wallets.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Ok(Json(wallets))
}

/// GET /api/wallets/:id
async fn wallet_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.ledger.wallet(parse_id(&id)?)?))
}

/// GET /api/wallets/:id/bets
async fn wallet_bets_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.ledger.bets(parse_id(&id)?)?))
}

#[derive(Debug, Deserialize)]
struct PlaceBetBody {
    wallet_id: Uuid,
    game_id: String,
    market: MarketSpec,
    selection: Selection,
    /// American ("+110") or decimal ("2.10") price
    price: String,
    stake: Decimal,
}

/// POST /api/bets
async fn place_bet_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PlaceBetBody>,
) -> Result<impl IntoResponse, ApiError> {
    let price = Price::parse(&body.price).map_err(|e| ApiError(StatusCode::BAD_REQUEST, e.to_string()))?;
    let req = PlaceBet {
        wallet_id: body.wallet_id,
        game_id: body.game_id,
        wager: Wager {
            market: body.market,
            selection: body.selection,
            price,
        },
        stake: body.stake,
    };
    match state.ledger.place(req, Utc::now()) {
        Ok(bet) => {
            info!("Bet {} placed via API: {} stake {}", bet.id, bet.wager, bet.stake);
            Ok((StatusCode::CREATED, Json(bet)))
        }
        Err(e) => {
            warn!("Bet rejected: {}", e);
            Err(e.into())
        }
    }
}

/// GET /api/bets/:id
async fn bet_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.ledger.bet(parse_id(&id)?)?))
}

/// POST /api/bets/:id/void refunds a pending bet
async fn void_bet_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let bet = state.ledger.void_bet(parse_id(&id)?, Utc::now()).map_err(|e| {
        warn!("Void rejected: {}", e);
        ApiError::from(e)
    })?;
    Ok(Json(bet))
}

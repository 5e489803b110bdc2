use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap},
    response::Json,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub mod auth;
pub mod config;
pub mod db;
pub mod errors;
pub mod global_stats;
pub mod ingest;
pub mod metadata;
pub mod models;
pub mod retry;
pub mod spotify;
pub mod stats;
pub mod store;
pub mod token;

#[cfg(test)]
pub(crate) mod testing;

use config::IngestConfig;
use errors::AppError;
use global_stats::{GlobalStats, PercentileData, UserMinutes, ALL_TIME_DAYS};
use ingest::{Ingestor, RunReport};
use metadata::MetadataCache;
use models::{ActivityEvent, ArtistMetadata, PlaylistPlay, TrackMetadata, User};
use spotify::MusicApi;
use stats::{DayBucket, GenreSlice, HistogramBin, PlayCount, PlayFilter, UserStats};
use store::{ActivityStore, MetadataStore, UserStore};
use token::TokenManager;

const DEFAULT_WINDOW_DAYS: u32 = 30;
const DEFAULT_TOP_USERS: usize = 5;
const DEFAULT_TOP_LIMIT: usize = 10;

/// Services shared by every handler. All of them sit on the same store and
/// music API handles.
#[derive(Clone)]
pub struct AppState {
    pub users: Arc<dyn UserStore>,
    pub activity: Arc<dyn ActivityStore>,
    pub api: Arc<dyn MusicApi>,
    pub tokens: TokenManager,
    pub metadata: MetadataCache,
    pub ingestor: Ingestor,
    pub stats: UserStats,
    pub global: GlobalStats,
    pub cron_secret: Option<String>,
}

impl AppState {
    pub fn new<S>(
        store: Arc<S>,
        api: Arc<dyn MusicApi>,
        ingest: IngestConfig,
        cron_secret: Option<String>,
    ) -> Self
    where
        S: UserStore + ActivityStore + MetadataStore + 'static,
    {
        let users: Arc<dyn UserStore> = store.clone();
        let activity: Arc<dyn ActivityStore> = store.clone();
        let metadata_store: Arc<dyn MetadataStore> = store;

        let tokens = TokenManager::new(users.clone(), api.clone());
        let metadata = MetadataCache::new(metadata_store, api.clone());
        let ingestor = Ingestor::new(
            users.clone(),
            activity.clone(),
            tokens.clone(),
            metadata.clone(),
            api.clone(),
            ingest,
        );
        let stats = UserStats::new(activity.clone(), metadata.clone());
        let global = GlobalStats::new(users.clone(), stats.clone());

        Self {
            users,
            activity,
            api,
            tokens,
            metadata,
            ingestor,
            stats,
            global,
            cron_secret,
        }
    }

    async fn require_user(&self, user_id: &str) -> Result<User, AppError> {
        self.users
            .get_user(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("user {user_id}")))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WindowQuery {
    days_ago: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TopUsersQuery {
    days_ago: Option<u32>,
    num_users: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaysOverTimeQuery {
    track_id: Option<String>,
    artist_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdsQuery {
    ids: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LeaderboardEntry {
    id: String,
    display_name: Option<String>,
    spotify_id: String,
    minutes_listened: f64,
}

impl From<UserMinutes> for LeaderboardEntry {
    fn from(entry: UserMinutes) -> Self {
        Self {
            id: entry.user.id,
            display_name: entry.user.display_name,
            spotify_id: entry.user.spotify_id,
            minutes_listened: entry.minutes,
        }
    }
}

#[derive(Debug, Serialize)]
struct LeaderboardResponse {
    users: Vec<LeaderboardEntry>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TopUsersResponse {
    top_users: Vec<UserMinutes>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MinutesResponse {
    minutes_listened: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PercentileResponse {
    percentile_data: PercentileData,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UndergroundResponse {
    underground_score: f64,
}

#[derive(Debug, Serialize)]
struct GenresResponse {
    genres: Vec<GenreSlice>,
}

#[derive(Debug, Serialize)]
struct HistogramResponse {
    bins: Vec<HistogramBin>,
}

#[derive(Debug, Serialize)]
struct DaysResponse {
    days: Vec<DayBucket>,
}

#[derive(Debug, Serialize)]
struct TopTracksResponse {
    tracks: Vec<PlayCount>,
}

#[derive(Debug, Serialize)]
struct TopArtistsResponse {
    artists: Vec<PlayCount>,
}

fn parse_ids(query: IdsQuery) -> Result<Vec<String>, AppError> {
    let ids: Vec<String> = query
        .ids
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(String::from)
        .collect();
    if ids.is_empty() {
        return Err(AppError::Validation("ids must list at least one id".into()));
    }
    Ok(ids)
}

fn positive_limit(limit: Option<usize>, default: usize) -> Result<usize, AppError> {
    match limit {
        Some(0) => Err(AppError::Validation("limit must be positive".into())),
        Some(limit) => Ok(limit),
        None => Ok(default),
    }
}

async fn health_check() -> &'static str {
    "ok"
}

async fn auth_callback(
    State(state): State<AppState>,
    Query(params): Query<CallbackQuery>,
) -> Result<Json<User>, AppError> {
    if let Some(error) = params.error {
        return Err(AppError::Validation(format!("authorization denied: {error}")));
    }
    let code = params
        .code
        .filter(|code| !code.is_empty())
        .ok_or_else(|| AppError::Validation("missing authorization code".into()))?;

    let user = auth::sign_in(&state.api, &state.users, &state.tokens, &code).await?;
    Ok(Json(user))
}

async fn trigger_ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<RunReport>, AppError> {
    if let Some(secret) = state.cron_secret.as_deref() {
        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));
        if presented != Some(secret) {
            return Err(AppError::Unauthorized);
        }
    }

    let report = state.ingestor.run_for_all_users().await?;
    Ok(Json(report))
}

async fn list_users(
    State(state): State<AppState>,
    Query(params): Query<WindowQuery>,
) -> Result<Json<LeaderboardResponse>, AppError> {
    let days = params.days_ago.unwrap_or(ALL_TIME_DAYS);
    let ranked = state.global.minutes_for_all_users(days).await?;
    Ok(Json(LeaderboardResponse {
        users: ranked.into_iter().map(LeaderboardEntry::from).collect(),
    }))
}

async fn top_users(
    State(state): State<AppState>,
    Query(params): Query<TopUsersQuery>,
) -> Result<Json<TopUsersResponse>, AppError> {
    let days = params.days_ago.unwrap_or(DEFAULT_WINDOW_DAYS);
    let limit = params.num_users.unwrap_or(DEFAULT_TOP_USERS);
    let top_users = state.global.top_users(days, limit).await?;
    Ok(Json(TopUsersResponse { top_users }))
}

async fn minutes_listened(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(params): Query<WindowQuery>,
) -> Result<Json<MinutesResponse>, AppError> {
    state.require_user(&user_id).await?;
    let days = params.days_ago.unwrap_or(DEFAULT_WINDOW_DAYS);
    let minutes_listened = state.stats.total_minutes_listened(&user_id, Some(days)).await?;
    Ok(Json(MinutesResponse { minutes_listened }))
}

async fn listening_percentile(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(params): Query<WindowQuery>,
) -> Result<Json<PercentileResponse>, AppError> {
    let days = params.days_ago.unwrap_or(DEFAULT_WINDOW_DAYS);
    let percentile_data = state.global.listening_percentile(&user_id, days).await?;
    Ok(Json(PercentileResponse { percentile_data }))
}

async fn underground_score(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<UndergroundResponse>, AppError> {
    state.require_user(&user_id).await?;
    let underground_score = state.stats.underground_score(&user_id).await?;
    Ok(Json(UndergroundResponse { underground_score }))
}

async fn track_plays(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<ActivityEvent>>, AppError> {
    state.require_user(&user_id).await?;
    Ok(Json(state.activity.get_all_activity(&user_id).await?))
}

async fn playlist_plays(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<PlaylistPlay>>, AppError> {
    state.require_user(&user_id).await?;
    Ok(Json(state.activity.get_playlist_plays(&user_id).await?))
}

async fn top_tracks(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(params): Query<LimitQuery>,
) -> Result<Json<TopTracksResponse>, AppError> {
    let limit = positive_limit(params.limit, DEFAULT_TOP_LIMIT)?;
    state.require_user(&user_id).await?;
    let tracks = state.stats.top_tracks(&user_id, limit).await?;
    Ok(Json(TopTracksResponse { tracks }))
}

async fn top_artists(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(params): Query<LimitQuery>,
) -> Result<Json<TopArtistsResponse>, AppError> {
    let limit = positive_limit(params.limit, DEFAULT_TOP_LIMIT)?;
    state.require_user(&user_id).await?;
    let artists = state.stats.top_artists(&user_id, limit).await?;
    Ok(Json(TopArtistsResponse { artists }))
}

async fn genre_distribution(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<GenresResponse>, AppError> {
    state.require_user(&user_id).await?;
    let genres = state.stats.genre_distribution(&user_id).await?;
    Ok(Json(GenresResponse { genres }))
}

async fn duration_histogram(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<HistogramResponse>, AppError> {
    state.require_user(&user_id).await?;
    let bins = state.stats.duration_histogram(&user_id).await?;
    Ok(Json(HistogramResponse { bins }))
}

async fn plays_over_time(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(params): Query<PlaysOverTimeQuery>,
) -> Result<Json<DaysResponse>, AppError> {
    state.require_user(&user_id).await?;
    let filter = PlayFilter {
        track_id: params.track_id.filter(|id| !id.is_empty()),
        artist_id: params.artist_id.filter(|id| !id.is_empty()),
    };
    let days = state.stats.plays_over_time(&user_id, &filter).await?;
    Ok(Json(DaysResponse { days }))
}

async fn tracks_metadata(
    State(state): State<AppState>,
    Query(params): Query<IdsQuery>,
) -> Result<Json<Vec<TrackMetadata>>, AppError> {
    let ids = parse_ids(params)?;
    Ok(Json(state.metadata.batch_get_tracks(&ids).await?))
}

async fn artists_metadata(
    State(state): State<AppState>,
    Query(params): Query<IdsQuery>,
) -> Result<Json<Vec<ArtistMetadata>>, AppError> {
    let ids = parse_ids(params)?;
    Ok(Json(state.metadata.batch_get_artists(&ids).await?))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/auth/callback", get(auth_callback))
        .route("/api/cron/ingest", get(trigger_ingest))
        .route("/api/users", get(list_users))
        .route("/api/top-users", get(top_users))
        .route("/api/users/:id/minutes-listened", get(minutes_listened))
        .route("/api/users/:id/percentile", get(listening_percentile))
        .route("/api/users/:id/underground-score", get(underground_score))
        .route("/api/users/:id/track-plays", get(track_plays))
        .route("/api/users/:id/playlist-plays", get(playlist_plays))
        .route("/api/users/:id/top-tracks", get(top_tracks))
        .route("/api/users/:id/top-artists", get(top_artists))
        .route("/api/users/:id/genre-distribution", get(genre_distribution))
        .route("/api/users/:id/duration-histogram", get(duration_histogram))
        .route("/api/users/:id/plays-over-time", get(plays_over_time))
        .route("/api/tracks", get(tracks_metadata))
        .route("/api/artists", get(artists_metadata))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vault_api=debug,tower_http=debug".into()),
        )
        .init();
}

pub async fn run() -> anyhow::Result<()> {
    init_tracing();

    let config = config::Config::from_env()?;

    let pool = db::init_db(&config.database_url)
        .await
        .context("failed to initialize database")?;
    tracing::info!("database initialized");

    let store = Arc::new(db::PgStore::new(pool, config.retry));
    let api: Arc<dyn MusicApi> = Arc::new(
        spotify::SpotifyClient::new(&config.spotify).context("failed to build upstream client")?,
    );

    if config.cron_secret.is_none() {
        tracing::warn!("CRON_SECRET not set, /api/cron/ingest is open to anyone");
    }

    let state = AppState::new(store, api, config.ingest, config.cron_secret.clone());
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::{Duration, Utc};
use serde_json::Value;
use tower::ServiceExt;

use vault_api::config::IngestConfig;
use vault_api::errors::UpstreamError;
use vault_api::models::{
    ActivityEvent, ArtistMetadata, ArtistRef, NewUser, PlaybackContext, PlayedItem,
    PlaylistSummary, TokenGrant, TrackMetadata, UserProfile,
};
use vault_api::spotify::MusicApi;
use vault_api::store::{ActivityStore, MemoryStore, UserStore};
use vault_api::{router, AppState};

/// Upstream serving the same recent plays to every listener and synthesizing
/// metadata for any id it is asked about.
#[derive(Default)]
struct StubUpstream {
    recent: Vec<PlayedItem>,
}

fn unavailable() -> UpstreamError {
    UpstreamError::Status {
        status: 503,
        body: "unavailable in tests".to_string(),
    }
}

#[async_trait]
impl MusicApi for StubUpstream {
    async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenGrant, UpstreamError> {
        Ok(TokenGrant {
            access_token: format!("access-{refresh_token}"),
            expires_in_secs: 3600,
            refresh_token: None,
        })
    }

    async fn exchange_code(&self, _code: &str) -> Result<TokenGrant, UpstreamError> {
        Err(unavailable())
    }

    async fn current_user(&self, _access_token: &str) -> Result<UserProfile, UpstreamError> {
        Err(unavailable())
    }

    async fn recently_played(
        &self,
        _access_token: &str,
        _limit: u32,
    ) -> Result<Vec<PlayedItem>, UpstreamError> {
        Ok(self.recent.clone())
    }

    async fn track(&self, _access_token: &str, id: &str) -> Result<TrackMetadata, UpstreamError> {
        Ok(TrackMetadata {
            track_id: id.to_string(),
            name: format!("Track {id}"),
            artists: vec![ArtistRef {
                id: "a1".to_string(),
                name: "Artist a1".to_string(),
            }],
            album: "Album".to_string(),
            album_image_url: None,
            duration_ms: 90_000,
            popularity: Some(20),
            release_date: None,
            updated_at: Utc::now(),
        })
    }

    async fn artist(&self, _access_token: &str, id: &str) -> Result<ArtistMetadata, UpstreamError> {
        Ok(ArtistMetadata {
            artist_id: id.to_string(),
            name: format!("Artist {id}"),
            genres: vec!["shoegaze".to_string()],
            popularity: Some(20),
            followers: None,
            image_url: None,
            updated_at: Utc::now(),
        })
    }

    async fn playlists(
        &self,
        _access_token: &str,
        _limit: u32,
    ) -> Result<Vec<PlaylistSummary>, UpstreamError> {
        Ok(Vec::new())
    }
}

async fn seeded_app(cron_secret: Option<&str>) -> Router {
    app_with_upstream(cron_secret, StubUpstream::default()).await
}

async fn app_with_upstream(cron_secret: Option<&str>, upstream: StubUpstream) -> Router {
    let store = Arc::new(MemoryStore::new());
    let now = Utc::now();

    for (id, plays) in [("u1", 2), ("u2", 5)] {
        store
            .upsert_user(&NewUser {
                id: id.to_string(),
                spotify_id: id.to_string(),
                display_name: Some(format!("Listener {id}")),
                email: None,
                refresh_token: Some(format!("refresh-{id}")),
            })
            .await
            .unwrap();
        for n in 0..plays {
            store
                .put_activity_if_absent(&ActivityEvent {
                    user_id: id.to_string(),
                    track_id: format!("t{n}"),
                    played_at: now - Duration::hours(n + 1),
                    duration_ms: 60_000,
                    context: None,
                    context_id: None,
                    artist_ids: "a1".to_string(),
                })
                .await
                .unwrap();
        }
    }

    let state = AppState::new(
        store,
        Arc::new(upstream),
        IngestConfig::default(),
        cron_secret.map(String::from),
    );
    router(state)
}

async fn get(app: Router, uri: &str) -> (StatusCode, Value) {
    send(app, Request::builder().uri(uri).body(Body::empty()).unwrap()).await
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn health_check() {
    let app = seeded_app(None).await;
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn minutes_listened_in_window() {
    let (status, body) = get(seeded_app(None).await, "/api/users/u1/minutes-listened?daysAgo=7").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["minutesListened"], 2.0);
}

#[tokio::test]
async fn unknown_user_is_not_found() {
    let (status, body) = get(seeded_app(None).await, "/api/users/nobody/minutes-listened").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn percentile_ranks_heaviest_listener_first() {
    let app = seeded_app(None).await;

    let (status, body) = get(app.clone(), "/api/users/u2/percentile?daysAgo=30").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["percentileData"]["rank"], 1);
    assert_eq!(body["percentileData"]["totalUsers"], 2);
    assert_eq!(body["percentileData"]["percentile"], 50);

    let (_, body) = get(app, "/api/users/ghost/percentile").await;
    assert_eq!(body["percentileData"]["rank"], 2);
    assert_eq!(body["percentileData"]["percentile"], 100);
}

#[tokio::test]
async fn top_users_never_expose_tokens() {
    let (status, body) = get(seeded_app(None).await, "/api/top-users?daysAgo=30&numUsers=1").await;
    assert_eq!(status, StatusCode::OK);

    let top = body["topUsers"].as_array().unwrap();
    assert_eq!(top.len(), 1);
    assert_eq!(top[0]["user"]["id"], "u2");
    assert_eq!(top[0]["minutes"], 5.0);
    assert!(!body.to_string().contains("refresh-"));
}

#[tokio::test]
async fn leaderboard_lists_everyone() {
    let (status, body) = get(seeded_app(None).await, "/api/users").await;
    assert_eq!(status, StatusCode::OK);
    let users = body["users"].as_array().unwrap();
    assert_eq!(users.len(), 2);
    assert_eq!(users[0]["spotifyId"], "u2");
    assert_eq!(users[1]["minutesListened"], 2.0);
}

#[tokio::test]
async fn underground_score_defaults_without_metadata() {
    let (status, body) = get(seeded_app(None).await, "/api/users/u1/underground-score").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["undergroundScore"], 50.0);
}

#[tokio::test]
async fn track_plays_are_newest_first() {
    let (status, body) = get(seeded_app(None).await, "/api/users/u1/track-plays").await;
    assert_eq!(status, StatusCode::OK);
    let plays = body.as_array().unwrap();
    assert_eq!(plays.len(), 2);
    assert_eq!(plays[0]["trackId"], "t0");
    assert_eq!(plays[0]["durationMs"], 60_000);
}

#[tokio::test]
async fn metadata_lookup_requires_ids() {
    let (status, body) = get(seeded_app(None).await, "/api/tracks?ids=").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    let (status, body) = get(seeded_app(None).await, "/api/tracks?ids=t1,t2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn cron_trigger_checks_secret() {
    let (status, _) = get(seeded_app(Some("s3cret")).await, "/api/cron/ingest").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .uri("/api/cron/ingest")
        .header(header::AUTHORIZATION, "Bearer s3cret")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(seeded_app(Some("s3cret")).await, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["users"], 2);
    assert_eq!(body["failed"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn oversized_window_means_all_time() {
    let app = seeded_app(None).await;

    let (status, body) = get(app.clone(), "/api/users/u1/minutes-listened?daysAgo=4000000000").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["minutesListened"], 2.0);

    let (status, body) = get(app, "/api/top-users?daysAgo=4294967295&numUsers=1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["topUsers"][0]["user"]["id"], "u2");
}

#[tokio::test]
async fn cron_ingest_records_new_plays_and_metadata() {
    let played_at = Utc::now() - Duration::minutes(10);
    let upstream = StubUpstream {
        recent: vec![
            PlayedItem {
                track_id: "fresh".to_string(),
                played_at,
                duration_ms: 90_000,
                context: Some(PlaybackContext {
                    kind: "playlist".to_string(),
                    uri: "spotify:playlist:p1".to_string(),
                }),
                artist_ids: vec!["a1".to_string()],
            },
            PlayedItem {
                track_id: "fresh".to_string(),
                played_at: played_at - Duration::minutes(5),
                duration_ms: 90_000,
                context: None,
                artist_ids: vec!["a1".to_string()],
            },
        ],
    };
    let app = app_with_upstream(None, upstream).await;

    let (status, body) = get(app.clone(), "/api/cron/ingest").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["users"], 2);
    let completed = body["completed"].as_array().unwrap();
    assert_eq!(completed.len(), 2);
    for report in completed {
        assert_eq!(report["inserted"], 2);
        assert_eq!(report["playlistPlaysInserted"], 1);
        assert_eq!(report["tracksRefreshed"], 1);
        assert_eq!(report["artistsRefreshed"], 1);
        assert_eq!(report["failures"].as_array().unwrap().len(), 0);
    }

    // a second trigger over the same page adds nothing
    let (_, body) = get(app.clone(), "/api/cron/ingest").await;
    assert_eq!(body["completed"][0]["inserted"], 0);
    assert_eq!(body["completed"][0]["duplicates"], 2);

    let (_, body) = get(app.clone(), "/api/users/u1/minutes-listened?daysAgo=1").await;
    assert_eq!(body["minutesListened"], 5.0);

    let (status, body) = get(app, "/api/tracks?ids=fresh").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["trackId"], "fresh");
    assert_eq!(body[0]["popularity"], 20);
}

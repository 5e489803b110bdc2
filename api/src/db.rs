use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::errors::StoreError;
use crate::models::{
    ActivityEvent, ArtistMetadata, ArtistMetadataRow, NewUser, Playlist, PlaylistPlay,
    TrackMetadata, TrackMetadataRow, TrackPlayRow, User,
};
use crate::retry::{with_backoff, RetryPolicy};
use crate::store::{
    check_batch_size, ActivityCursor, ActivityStore, MetadataStore, Page, UserStore, WriteOutcome,
    DEFAULT_PAGE_SIZE,
};

pub async fn init_db(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(50)
        .acquire_timeout(std::time::Duration::from_secs(30))
        .connect(database_url)
        .await?;

    // Run migrations
    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Postgres-backed implementation of every store trait. Each statement is
/// wrapped in [`with_backoff`] so throttling and dropped connections are
/// retried before surfacing.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PgStore {
    pub fn new(pool: PgPool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn outcome(rows_affected: u64) -> WriteOutcome {
    if rows_affected > 0 {
        WriteOutcome::Inserted
    } else {
        WriteOutcome::AlreadyRecorded
    }
}

/// Fetches one row past the page so the continuation key is only handed out
/// when more rows exist.
fn split_page<T, C>(mut rows: Vec<T>, page_size: usize, key: impl Fn(&T) -> C) -> Page<T, C> {
    let more = rows.len() > page_size;
    rows.truncate(page_size);
    let last_evaluated_key = if more { rows.last().map(key) } else { None };
    Page {
        items: rows,
        last_evaluated_key,
    }
}

async fn upsert_user_row(pool: &PgPool, user: &NewUser) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO users (id, spotify_id, display_name, email, refresh_token)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (id) DO UPDATE SET
            spotify_id = EXCLUDED.spotify_id,
            display_name = EXCLUDED.display_name,
            email = EXCLUDED.email,
            refresh_token = COALESCE(EXCLUDED.refresh_token, users.refresh_token),
            updated_at = NOW()
        "#,
    )
    .bind(user.id.as_str())
    .bind(user.spotify_id.as_str())
    .bind(user.display_name.as_deref())
    .bind(user.email.as_deref())
    .bind(user.refresh_token.as_deref())
    .execute(pool)
    .await?;
    Ok(())
}

async fn fetch_user(pool: &PgPool, user_id: &str) -> Result<Option<User>, StoreError> {
    let user = sqlx::query_as::<_, User>(
        r#"
        SELECT id, spotify_id, display_name, email, refresh_token, access_token,
               token_expires_at, created_at, updated_at
        FROM users
        WHERE id = $1
        "#,
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(user)
}

async fn store_access_token(
    pool: &PgPool,
    user_id: &str,
    access_token: &str,
    expires_at: DateTime<Utc>,
    rotated_refresh_token: Option<&str>,
) -> Result<(), StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE users
        SET access_token = $2,
            token_expires_at = $3,
            refresh_token = COALESCE($4, refresh_token),
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(user_id)
    .bind(access_token)
    .bind(expires_at)
    .bind(rotated_refresh_token)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::Corrupt {
            key: format!("USER#{user_id}"),
            reason: "token update for unknown user".to_string(),
        });
    }
    Ok(())
}

async fn fetch_users_page(
    pool: &PgPool,
    start_after: Option<&str>,
) -> Result<Page<User>, StoreError> {
    let rows = sqlx::query_as::<_, User>(
        r#"
        SELECT id, spotify_id, display_name, email, refresh_token, access_token,
               token_expires_at, created_at, updated_at
        FROM users
        WHERE ($1::text IS NULL OR id > $1)
        ORDER BY id
        LIMIT $2
        "#,
    )
    .bind(start_after)
    .bind(DEFAULT_PAGE_SIZE as i64 + 1)
    .fetch_all(pool)
    .await?;

    Ok(split_page(rows, DEFAULT_PAGE_SIZE, |user| user.id.clone()))
}

async fn insert_track_play(pool: &PgPool, event: &ActivityEvent) -> Result<WriteOutcome, StoreError> {
    let result = sqlx::query(
        r#"
        INSERT INTO track_plays
            (user_id, sort_key, track_id, played_at, duration_ms,
             context_type, context_uri, context_id, artist_ids)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (user_id, sort_key) DO NOTHING
        "#,
    )
    .bind(event.user_id.as_str())
    .bind(event.sort_key())
    .bind(event.track_id.as_str())
    .bind(event.played_at)
    .bind(event.duration_ms)
    .bind(event.context.as_ref().map(|c| c.kind.as_str()))
    .bind(event.context.as_ref().map(|c| c.uri.as_str()))
    .bind(event.context_id.as_deref())
    .bind(event.artist_ids.as_str())
    .execute(pool)
    .await?;
    Ok(outcome(result.rows_affected()))
}

async fn fetch_activity_page(
    pool: &PgPool,
    user_id: &str,
    since: Option<DateTime<Utc>>,
    cursor: Option<&ActivityCursor>,
) -> Result<Page<ActivityEvent, ActivityCursor>, StoreError> {
    let rows = sqlx::query_as::<_, TrackPlayRow>(
        r#"
        SELECT user_id, sort_key, track_id, played_at, duration_ms,
               context_type, context_uri, context_id, artist_ids
        FROM track_plays
        WHERE user_id = $1
          AND ($2::timestamptz IS NULL OR played_at >= $2)
          AND ($3::timestamptz IS NULL OR (played_at, sort_key) < ($3, $4::text))
        ORDER BY played_at DESC, sort_key DESC
        LIMIT $5
        "#,
    )
    .bind(user_id)
    .bind(since)
    .bind(cursor.map(|c| c.played_at))
    .bind(cursor.map(|c| c.sort_key.as_str()))
    .bind(DEFAULT_PAGE_SIZE as i64 + 1)
    .fetch_all(pool)
    .await?;

    let events: Vec<ActivityEvent> = rows.into_iter().map(ActivityEvent::from).collect();
    Ok(split_page(events, DEFAULT_PAGE_SIZE, ActivityCursor::after))
}

async fn insert_playlist_play(pool: &PgPool, play: &PlaylistPlay) -> Result<WriteOutcome, StoreError> {
    let result = sqlx::query(
        r#"
        INSERT INTO playlist_plays (user_id, sort_key, playlist_id, played_at, context_uri)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (user_id, sort_key) DO NOTHING
        "#,
    )
    .bind(play.user_id.as_str())
    .bind(play.sort_key())
    .bind(play.playlist_id.as_str())
    .bind(play.played_at)
    .bind(play.context_uri.as_str())
    .execute(pool)
    .await?;
    Ok(outcome(result.rows_affected()))
}

async fn insert_playlist(pool: &PgPool, playlist: &Playlist) -> Result<WriteOutcome, StoreError> {
    let result = sqlx::query(
        r#"
        INSERT INTO playlists
            (user_id, sort_key, playlist_id, name, description, owner, snapshot_id, total_tracks, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (user_id, sort_key) DO NOTHING
        "#,
    )
    .bind(playlist.user_id.as_str())
    .bind(playlist.sort_key())
    .bind(playlist.playlist_id.as_str())
    .bind(playlist.name.as_str())
    .bind(playlist.description.as_deref())
    .bind(playlist.owner.as_deref())
    .bind(playlist.snapshot_id.as_deref())
    .bind(playlist.total_tracks)
    .bind(playlist.created_at)
    .execute(pool)
    .await?;
    Ok(outcome(result.rows_affected()))
}

async fn fetch_playlist_plays(pool: &PgPool, user_id: &str) -> Result<Vec<PlaylistPlay>, StoreError> {
    let plays = sqlx::query_as::<_, (String, String, DateTime<Utc>, String)>(
        r#"
        SELECT user_id, playlist_id, played_at, context_uri
        FROM playlist_plays
        WHERE user_id = $1
        ORDER BY played_at DESC, sort_key DESC
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(|(user_id, playlist_id, played_at, context_uri)| PlaylistPlay {
        user_id,
        playlist_id,
        played_at,
        context_uri,
    })
    .collect();
    Ok(plays)
}

type PlaylistTuple = (
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<i64>,
    DateTime<Utc>,
);

async fn fetch_playlists(pool: &PgPool, user_id: &str) -> Result<Vec<Playlist>, StoreError> {
    let playlists = sqlx::query_as::<_, PlaylistTuple>(
        r#"
        SELECT user_id, playlist_id, name, description, owner, snapshot_id, total_tracks, created_at
        FROM playlists
        WHERE user_id = $1
        ORDER BY sort_key
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(
        |(user_id, playlist_id, name, description, owner, snapshot_id, total_tracks, created_at)| {
            Playlist {
                user_id,
                playlist_id,
                name,
                description,
                owner,
                snapshot_id,
                total_tracks,
                created_at,
            }
        },
    )
    .collect();
    Ok(playlists)
}

async fn fetch_track(pool: &PgPool, track_id: &str) -> Result<Option<TrackMetadata>, StoreError> {
    let row = sqlx::query_as::<_, TrackMetadataRow>(
        r#"
        SELECT track_id, name, artist_ids, artist_names, album, album_image_url,
               duration_ms, popularity, release_date, updated_at
        FROM track_metadata
        WHERE track_id = $1
        "#,
    )
    .bind(track_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(TrackMetadata::from))
}

fn track_artist_columns(track: &TrackMetadata) -> (Vec<String>, Vec<String>) {
    track
        .artists
        .iter()
        .map(|a| (a.id.clone(), a.name.clone()))
        .unzip()
}

async fn insert_track(pool: &PgPool, track: &TrackMetadata) -> Result<WriteOutcome, StoreError> {
    let (artist_ids, artist_names) = track_artist_columns(track);
    let result = sqlx::query(
        r#"
        INSERT INTO track_metadata
            (track_id, name, artist_ids, artist_names, album, album_image_url,
             duration_ms, popularity, release_date, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (track_id) DO NOTHING
        "#,
    )
    .bind(track.track_id.as_str())
    .bind(track.name.as_str())
    .bind(artist_ids)
    .bind(artist_names)
    .bind(track.album.as_str())
    .bind(track.album_image_url.as_deref())
    .bind(track.duration_ms)
    .bind(track.popularity)
    .bind(track.release_date.as_deref())
    .bind(track.updated_at)
    .execute(pool)
    .await?;
    Ok(outcome(result.rows_affected()))
}

async fn upsert_track(pool: &PgPool, track: &TrackMetadata) -> Result<(), StoreError> {
    let (artist_ids, artist_names) = track_artist_columns(track);
    sqlx::query(
        r#"
        INSERT INTO track_metadata
            (track_id, name, artist_ids, artist_names, album, album_image_url,
             duration_ms, popularity, release_date, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (track_id) DO UPDATE SET
            name = EXCLUDED.name,
            artist_ids = EXCLUDED.artist_ids,
            artist_names = EXCLUDED.artist_names,
            album = EXCLUDED.album,
            album_image_url = EXCLUDED.album_image_url,
            duration_ms = EXCLUDED.duration_ms,
            popularity = EXCLUDED.popularity,
            release_date = EXCLUDED.release_date,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(track.track_id.as_str())
    .bind(track.name.as_str())
    .bind(artist_ids)
    .bind(artist_names)
    .bind(track.album.as_str())
    .bind(track.album_image_url.as_deref())
    .bind(track.duration_ms)
    .bind(track.popularity)
    .bind(track.release_date.as_deref())
    .bind(track.updated_at)
    .execute(pool)
    .await?;
    Ok(())
}

async fn fetch_tracks(pool: &PgPool, ids: &[String]) -> Result<Vec<TrackMetadata>, StoreError> {
    let rows = sqlx::query_as::<_, TrackMetadataRow>(
        r#"
        SELECT track_id, name, artist_ids, artist_names, album, album_image_url,
               duration_ms, popularity, release_date, updated_at
        FROM track_metadata
        WHERE track_id = ANY($1)
        "#,
    )
    .bind(ids)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(TrackMetadata::from).collect())
}

async fn fetch_artist(pool: &PgPool, artist_id: &str) -> Result<Option<ArtistMetadata>, StoreError> {
    let row = sqlx::query_as::<_, ArtistMetadataRow>(
        r#"
        SELECT artist_id, name, genres, popularity, followers, image_url, updated_at
        FROM artist_metadata
        WHERE artist_id = $1
        "#,
    )
    .bind(artist_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(ArtistMetadata::from))
}

async fn insert_artist(pool: &PgPool, artist: &ArtistMetadata) -> Result<WriteOutcome, StoreError> {
    let result = sqlx::query(
        r#"
        INSERT INTO artist_metadata
            (artist_id, name, genres, popularity, followers, image_url, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (artist_id) DO NOTHING
        "#,
    )
    .bind(artist.artist_id.as_str())
    .bind(artist.name.as_str())
    .bind(artist.genres.as_slice())
    .bind(artist.popularity)
    .bind(artist.followers)
    .bind(artist.image_url.as_deref())
    .bind(artist.updated_at)
    .execute(pool)
    .await?;
    Ok(outcome(result.rows_affected()))
}

async fn upsert_artist(pool: &PgPool, artist: &ArtistMetadata) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO artist_metadata
            (artist_id, name, genres, popularity, followers, image_url, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (artist_id) DO UPDATE SET
            name = EXCLUDED.name,
            genres = EXCLUDED.genres,
            popularity = EXCLUDED.popularity,
            followers = EXCLUDED.followers,
            image_url = EXCLUDED.image_url,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(artist.artist_id.as_str())
    .bind(artist.name.as_str())
    .bind(artist.genres.as_slice())
    .bind(artist.popularity)
    .bind(artist.followers)
    .bind(artist.image_url.as_deref())
    .bind(artist.updated_at)
    .execute(pool)
    .await?;
    Ok(())
}

async fn fetch_artists(pool: &PgPool, ids: &[String]) -> Result<Vec<ArtistMetadata>, StoreError> {
    let rows = sqlx::query_as::<_, ArtistMetadataRow>(
        r#"
        SELECT artist_id, name, genres, popularity, followers, image_url, updated_at
        FROM artist_metadata
        WHERE artist_id = ANY($1)
        "#,
    )
    .bind(ids)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(ArtistMetadata::from).collect())
}

#[async_trait]
impl UserStore for PgStore {
    async fn upsert_user(&self, user: &NewUser) -> Result<(), StoreError> {
        let pool = &self.pool;
        with_backoff(&self.retry, "upsert_user", move || upsert_user_row(pool, user)).await
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<User>, StoreError> {
        let pool = &self.pool;
        with_backoff(&self.retry, "get_user", move || fetch_user(pool, user_id)).await
    }

    async fn update_access_token(
        &self,
        user_id: &str,
        access_token: &str,
        expires_at: DateTime<Utc>,
        rotated_refresh_token: Option<&str>,
    ) -> Result<(), StoreError> {
        let pool = &self.pool;
        with_backoff(&self.retry, "update_access_token", move || {
            store_access_token(pool, user_id, access_token, expires_at, rotated_refresh_token)
        })
        .await
    }

    async fn scan_users_page(&self, start_after: Option<&str>) -> Result<Page<User>, StoreError> {
        let pool = &self.pool;
        with_backoff(&self.retry, "scan_users", move || fetch_users_page(pool, start_after)).await
    }
}

#[async_trait]
impl ActivityStore for PgStore {
    async fn put_activity_if_absent(
        &self,
        event: &ActivityEvent,
    ) -> Result<WriteOutcome, StoreError> {
        let pool = &self.pool;
        with_backoff(&self.retry, "put_track_play", move || insert_track_play(pool, event)).await
    }

    async fn query_activity_page(
        &self,
        user_id: &str,
        since: Option<DateTime<Utc>>,
        cursor: Option<ActivityCursor>,
    ) -> Result<Page<ActivityEvent, ActivityCursor>, StoreError> {
        let pool = &self.pool;
        let cursor = cursor.as_ref();
        with_backoff(&self.retry, "query_track_plays", move || {
            fetch_activity_page(pool, user_id, since, cursor)
        })
        .await
    }

    async fn put_playlist_play_if_absent(
        &self,
        play: &PlaylistPlay,
    ) -> Result<WriteOutcome, StoreError> {
        let pool = &self.pool;
        with_backoff(&self.retry, "put_playlist_play", move || insert_playlist_play(pool, play))
            .await
    }

    async fn put_playlist_if_absent(
        &self,
        playlist: &Playlist,
    ) -> Result<WriteOutcome, StoreError> {
        let pool = &self.pool;
        with_backoff(&self.retry, "put_playlist", move || insert_playlist(pool, playlist)).await
    }

    async fn get_playlist_plays(&self, user_id: &str) -> Result<Vec<PlaylistPlay>, StoreError> {
        let pool = &self.pool;
        with_backoff(&self.retry, "query_playlist_plays", move || {
            fetch_playlist_plays(pool, user_id)
        })
        .await
    }

    async fn get_playlists(&self, user_id: &str) -> Result<Vec<Playlist>, StoreError> {
        let pool = &self.pool;
        with_backoff(&self.retry, "query_playlists", move || fetch_playlists(pool, user_id)).await
    }
}

#[async_trait]
impl MetadataStore for PgStore {
    async fn get_track(&self, track_id: &str) -> Result<Option<TrackMetadata>, StoreError> {
        let pool = &self.pool;
        with_backoff(&self.retry, "get_track", move || fetch_track(pool, track_id)).await
    }

    async fn create_track_if_absent(
        &self,
        track: &TrackMetadata,
    ) -> Result<WriteOutcome, StoreError> {
        let pool = &self.pool;
        with_backoff(&self.retry, "create_track", move || insert_track(pool, track)).await
    }

    async fn update_track(&self, track: &TrackMetadata) -> Result<(), StoreError> {
        let pool = &self.pool;
        with_backoff(&self.retry, "update_track", move || upsert_track(pool, track)).await
    }

    async fn batch_get_tracks(&self, ids: &[String]) -> Result<Vec<TrackMetadata>, StoreError> {
        check_batch_size(ids)?;
        let pool = &self.pool;
        with_backoff(&self.retry, "batch_get_tracks", move || fetch_tracks(pool, ids)).await
    }

    async fn get_artist(&self, artist_id: &str) -> Result<Option<ArtistMetadata>, StoreError> {
        let pool = &self.pool;
        with_backoff(&self.retry, "get_artist", move || fetch_artist(pool, artist_id)).await
    }

    async fn create_artist_if_absent(
        &self,
        artist: &ArtistMetadata,
    ) -> Result<WriteOutcome, StoreError> {
        let pool = &self.pool;
        with_backoff(&self.retry, "create_artist", move || insert_artist(pool, artist)).await
    }

    async fn update_artist(&self, artist: &ArtistMetadata) -> Result<(), StoreError> {
        let pool = &self.pool;
        with_backoff(&self.retry, "update_artist", move || upsert_artist(pool, artist)).await
    }

    async fn batch_get_artists(&self, ids: &[String]) -> Result<Vec<ArtistMetadata>, StoreError> {
        check_batch_size(ids)?;
        let pool = &self.pool;
        with_backoff(&self.retry, "batch_get_artists", move || fetch_artists(pool, ids)).await
    }
}

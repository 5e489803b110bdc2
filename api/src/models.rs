use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

pub const TRACK_PLAY_PREFIX: &str = "TRACKPLAY#";
pub const PLAYLIST_PLAY_PREFIX: &str = "PLAYLISTPLAY#";
pub const PLAYLIST_PREFIX: &str = "PLAYLIST#";

/// Canonical spelling of an instant inside sort keys.
///
/// The upstream sends both `...:00Z` and `...:00.000Z`; normalizing keeps the
/// uniqueness discriminator stable across those spellings.
pub fn canonical_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// A signed-in listener. Token fields never leave the process.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub spotify_id: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    #[serde(skip_serializing, default)]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing, default)]
    pub access_token: Option<String>,
    #[serde(skip_serializing, default)]
    pub token_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Profile fields written on sign-in or profile re-sync.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub id: String,
    pub spotify_id: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackContext {
    pub kind: String,
    pub uri: String,
}

impl PlaybackContext {
    pub fn id(&self) -> Option<&str> {
        self.uri.split(':').nth(2).filter(|id| !id.is_empty())
    }
}

/// One play of one track by one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    pub user_id: String,
    pub track_id: String,
    pub played_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub context: Option<PlaybackContext>,
    /// Id segment of the context URI (playlist, album, artist...).
    pub context_id: Option<String>,
    /// Comma-joined, in credit order.
    pub artist_ids: String,
}

impl ActivityEvent {
    pub fn sort_key(&self) -> String {
        format!(
            "{}{}#{}",
            TRACK_PLAY_PREFIX,
            self.track_id,
            canonical_timestamp(&self.played_at)
        )
    }

    pub fn artist_id_list(&self) -> impl Iterator<Item = &str> {
        self.artist_ids
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    pub fn primary_artist_id(&self) -> Option<&str> {
        self.artist_id_list().next()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistPlay {
    pub user_id: String,
    pub playlist_id: String,
    pub played_at: DateTime<Utc>,
    pub context_uri: String,
}

impl PlaylistPlay {
    pub fn sort_key(&self) -> String {
        format!(
            "{}{}#{}",
            PLAYLIST_PLAY_PREFIX,
            self.playlist_id,
            canonical_timestamp(&self.played_at)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Playlist {
    pub user_id: String,
    pub playlist_id: String,
    pub name: String,
    pub description: Option<String>,
    pub owner: Option<String>,
    pub snapshot_id: Option<String>,
    pub total_tracks: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Playlist {
    pub fn sort_key(&self) -> String {
        format!("{}{}", PLAYLIST_PREFIX, self.playlist_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtistRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackMetadata {
    pub track_id: String,
    pub name: String,
    pub artists: Vec<ArtistRef>,
    pub album: String,
    pub album_image_url: Option<String>,
    pub duration_ms: i64,
    /// 0-100 as defined by the upstream.
    pub popularity: Option<i32>,
    pub release_date: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtistMetadata {
    pub artist_id: String,
    pub name: String,
    pub genres: Vec<String>,
    pub popularity: Option<i32>,
    pub followers: Option<i64>,
    pub image_url: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ArtistMetadata {
    pub fn primary_genre(&self) -> Option<&str> {
        self.genres
            .first()
            .map(String::as_str)
            .filter(|genre| !genre.is_empty())
    }
}

/// A play as returned by the upstream, already validated.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayedItem {
    pub track_id: String,
    pub played_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub context: Option<PlaybackContext>,
    pub artist_ids: Vec<String>,
}

impl PlayedItem {
    pub fn to_event(&self, user_id: &str) -> ActivityEvent {
        ActivityEvent {
            user_id: user_id.to_string(),
            track_id: self.track_id.clone(),
            played_at: self.played_at,
            duration_ms: self.duration_ms,
            context_id: self
                .context
                .as_ref()
                .and_then(|c| c.id())
                .map(String::from),
            context: self.context.clone(),
            artist_ids: self.artist_ids.join(","),
        }
    }

    /// Playlist play derived from this item, when it was played from a playlist.
    pub fn to_playlist_play(&self, user_id: &str) -> Option<PlaylistPlay> {
        let context = self.context.as_ref().filter(|c| c.kind == "playlist")?;
        Some(PlaylistPlay {
            user_id: user_id.to_string(),
            playlist_id: context.id()?.to_string(),
            played_at: self.played_at,
            context_uri: context.uri.clone(),
        })
    }
}

/// One of the user's playlists as listed by the upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaylistSummary {
    pub playlist_id: String,
    pub name: String,
    pub description: Option<String>,
    pub owner: Option<String>,
    pub snapshot_id: Option<String>,
    pub total_tracks: Option<i64>,
}

impl PlaylistSummary {
    pub fn into_playlist(self, user_id: &str, seen_at: DateTime<Utc>) -> Playlist {
        Playlist {
            user_id: user_id.to_string(),
            playlist_id: self.playlist_id,
            name: self.name,
            description: self.description,
            owner: self.owner,
            snapshot_id: self.snapshot_id,
            total_tracks: self.total_tracks,
            created_at: seen_at,
        }
    }
}

/// Result of a token grant, converted from the upstream body.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub expires_in_secs: i64,
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UserProfile {
    pub id: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
}

// Row types for the Postgres backend.

#[derive(Debug, Clone, FromRow)]
pub struct TrackPlayRow {
    pub user_id: String,
    pub sort_key: String,
    pub track_id: String,
    pub played_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub context_type: Option<String>,
    pub context_uri: Option<String>,
    pub context_id: Option<String>,
    pub artist_ids: String,
}

impl From<TrackPlayRow> for ActivityEvent {
    fn from(row: TrackPlayRow) -> Self {
        let context = match (row.context_type, row.context_uri) {
            (Some(kind), Some(uri)) => Some(PlaybackContext { kind, uri }),
            _ => None,
        };
        ActivityEvent {
            user_id: row.user_id,
            track_id: row.track_id,
            played_at: row.played_at,
            duration_ms: row.duration_ms,
            context,
            context_id: row.context_id,
            artist_ids: row.artist_ids,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct TrackMetadataRow {
    pub track_id: String,
    pub name: String,
    pub artist_ids: Vec<String>,
    pub artist_names: Vec<String>,
    pub album: String,
    pub album_image_url: Option<String>,
    pub duration_ms: i64,
    pub popularity: Option<i32>,
    pub release_date: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<TrackMetadataRow> for TrackMetadata {
    fn from(row: TrackMetadataRow) -> Self {
        let artists = row
            .artist_ids
            .into_iter()
            .zip(row.artist_names)
            .map(|(id, name)| ArtistRef { id, name })
            .collect();
        TrackMetadata {
            track_id: row.track_id,
            name: row.name,
            artists,
            album: row.album,
            album_image_url: row.album_image_url,
            duration_ms: row.duration_ms,
            popularity: row.popularity,
            release_date: row.release_date,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ArtistMetadataRow {
    pub artist_id: String,
    pub name: String,
    pub genres: Vec<String>,
    pub popularity: Option<i32>,
    pub followers: Option<i64>,
    pub image_url: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<ArtistMetadataRow> for ArtistMetadata {
    fn from(row: ArtistMetadataRow) -> Self {
        ArtistMetadata {
            artist_id: row.artist_id,
            name: row.name,
            genres: row.genres,
            popularity: row.popularity,
            followers: row.followers,
            image_url: row.image_url,
            updated_at: row.updated_at,
        }
    }
}

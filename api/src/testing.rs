//! Scripted music API and fixtures shared by unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::errors::UpstreamError;
use crate::models::{
    ArtistMetadata, ArtistRef, NewUser, PlaybackContext, PlayedItem, PlaylistSummary, TokenGrant,
    TrackMetadata, UserProfile,
};
use crate::spotify::MusicApi;

/// Access tokens it issues are `access-{refresh_token}`. Recently-played
/// pages are keyed by the access token they are requested with.
#[derive(Default)]
pub struct FakeMusicApi {
    pub refresh_rejection: Option<(u16, String)>,
    pub rotated_refresh_token: Option<String>,
    pub profile: Option<UserProfile>,
    pub history: HashMap<String, Vec<PlayedItem>>,
    pub failing_history: HashSet<String>,
    pub tracks: HashMap<String, TrackMetadata>,
    pub artists: HashMap<String, ArtistMetadata>,
    pub playlists: Vec<PlaylistSummary>,
    pub refresh_calls: AtomicUsize,
    pub history_calls: AtomicUsize,
    pub track_calls: AtomicUsize,
    pub artist_calls: AtomicUsize,
}

impl FakeMusicApi {
    pub fn calls(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn with_track(mut self, track: TrackMetadata) -> Self {
        self.tracks.insert(track.track_id.clone(), track);
        self
    }

    pub fn with_artist(mut self, artist: ArtistMetadata) -> Self {
        self.artists.insert(artist.artist_id.clone(), artist);
        self
    }

    pub fn with_history(mut self, access_token: &str, items: Vec<PlayedItem>) -> Self {
        self.history.insert(access_token.to_string(), items);
        self
    }

    fn grant(&self, refresh_token: &str) -> TokenGrant {
        TokenGrant {
            access_token: format!("access-{refresh_token}"),
            expires_in_secs: 3600,
            refresh_token: self.rotated_refresh_token.clone(),
        }
    }
}

fn not_found(what: &str, id: &str) -> UpstreamError {
    UpstreamError::Status {
        status: 404,
        body: format!("{what} {id} not found"),
    }
}

#[async_trait]
impl MusicApi for FakeMusicApi {
    async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenGrant, UpstreamError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if let Some((status, body)) = &self.refresh_rejection {
            return Err(UpstreamError::Status {
                status: *status,
                body: body.clone(),
            });
        }
        Ok(self.grant(refresh_token))
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenGrant, UpstreamError> {
        if code.is_empty() {
            return Err(UpstreamError::Status {
                status: 400,
                body: "invalid_grant: Invalid authorization code".to_string(),
            });
        }
        Ok(TokenGrant {
            access_token: format!("access-{code}"),
            expires_in_secs: 3600,
            refresh_token: Some(format!("refresh-{code}")),
        })
    }

    async fn current_user(&self, _access_token: &str) -> Result<UserProfile, UpstreamError> {
        self.profile.clone().ok_or_else(|| UpstreamError::Status {
            status: 401,
            body: "Invalid access token".to_string(),
        })
    }

    async fn recently_played(
        &self,
        access_token: &str,
        limit: u32,
    ) -> Result<Vec<PlayedItem>, UpstreamError> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_history.contains(access_token) {
            return Err(UpstreamError::Timeout);
        }
        Ok(self
            .history
            .get(access_token)
            .map(|items| items.iter().take(limit as usize).cloned().collect())
            .unwrap_or_default())
    }

    async fn track(
        &self,
        _access_token: &str,
        track_id: &str,
    ) -> Result<TrackMetadata, UpstreamError> {
        self.track_calls.fetch_add(1, Ordering::SeqCst);
        self.tracks
            .get(track_id)
            .cloned()
            .ok_or_else(|| not_found("track", track_id))
    }

    async fn artist(
        &self,
        _access_token: &str,
        artist_id: &str,
    ) -> Result<ArtistMetadata, UpstreamError> {
        self.artist_calls.fetch_add(1, Ordering::SeqCst);
        self.artists
            .get(artist_id)
            .cloned()
            .ok_or_else(|| not_found("artist", artist_id))
    }

    async fn playlists(
        &self,
        _access_token: &str,
        limit: u32,
    ) -> Result<Vec<PlaylistSummary>, UpstreamError> {
        Ok(self.playlists.iter().take(limit as usize).cloned().collect())
    }
}

pub fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, day, hour, 0, 0).unwrap()
}

pub fn new_user(id: &str) -> NewUser {
    NewUser {
        id: id.to_string(),
        spotify_id: id.to_string(),
        display_name: Some(format!("Listener {id}")),
        email: None,
        refresh_token: Some(format!("refresh-{id}")),
    }
}

pub fn played(track_id: &str, artist_ids: &[&str], played_at: DateTime<Utc>) -> PlayedItem {
    PlayedItem {
        track_id: track_id.to_string(),
        played_at,
        duration_ms: 180_000,
        context: None,
        artist_ids: artist_ids.iter().map(|id| id.to_string()).collect(),
    }
}

pub fn played_from_playlist(track_id: &str, playlist_id: &str, played_at: DateTime<Utc>) -> PlayedItem {
    PlayedItem {
        context: Some(PlaybackContext {
            kind: "playlist".to_string(),
            uri: format!("spotify:playlist:{playlist_id}"),
        }),
        ..played(track_id, &["a1"], played_at)
    }
}

pub fn track(id: &str, artist_ids: &[&str], popularity: Option<i32>) -> TrackMetadata {
    TrackMetadata {
        track_id: id.to_string(),
        name: format!("Track {id}"),
        artists: artist_ids
            .iter()
            .map(|a| ArtistRef {
                id: a.to_string(),
                name: format!("Artist {a}"),
            })
            .collect(),
        album: "Album".to_string(),
        album_image_url: None,
        duration_ms: 180_000,
        popularity,
        release_date: None,
        updated_at: at(1, 0),
    }
}

pub fn artist(id: &str, genres: &[&str]) -> ArtistMetadata {
    ArtistMetadata {
        artist_id: id.to_string(),
        name: format!("Artist {id}"),
        genres: genres.iter().map(|g| g.to_string()).collect(),
        popularity: Some(40),
        followers: Some(1_000),
        image_url: None,
        updated_at: at(1, 0),
    }
}

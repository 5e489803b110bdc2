use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use spotify_schema::web_api::{
    ApiErrorResponse, ArtistObject, OAuthErrorResponse, Paging, PlayHistoryObject,
    PrivateUserObject, RecentlyPlayedResponse, SimplifiedPlaylistObject, TokenResponse,
    TrackObject,
};

use crate::config::SpotifyConfig;
use crate::errors::UpstreamError;
use crate::models::{
    ArtistMetadata, ArtistRef, PlaybackContext, PlayedItem, PlaylistSummary, TokenGrant,
    TrackMetadata, UserProfile,
};

/// The slice of the music service this crate talks to. Every response is
/// converted into internal types before it leaves the implementation.
#[async_trait]
pub trait MusicApi: Send + Sync {
    async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenGrant, UpstreamError>;

    async fn exchange_code(&self, code: &str) -> Result<TokenGrant, UpstreamError>;

    async fn current_user(&self, access_token: &str) -> Result<UserProfile, UpstreamError>;

    async fn recently_played(
        &self,
        access_token: &str,
        limit: u32,
    ) -> Result<Vec<PlayedItem>, UpstreamError>;

    async fn track(&self, access_token: &str, track_id: &str)
        -> Result<TrackMetadata, UpstreamError>;

    async fn artist(
        &self,
        access_token: &str,
        artist_id: &str,
    ) -> Result<ArtistMetadata, UpstreamError>;

    async fn playlists(
        &self,
        access_token: &str,
        limit: u32,
    ) -> Result<Vec<PlaylistSummary>, UpstreamError>;
}

pub struct SpotifyClient {
    http: Client,
    client_id: String,
    client_secret: String,
    redirect_uri: Option<String>,
    accounts_url: String,
    api_url: String,
}

impl SpotifyClient {
    pub fn new(config: &SpotifyConfig) -> Result<Self, UpstreamError> {
        let http = Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("listening-vault/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri: config.redirect_uri.clone(),
            accounts_url: config.accounts_url.trim_end_matches('/').to_string(),
            api_url: config.api_url.trim_end_matches('/').to_string(),
        })
    }

    fn basic_auth(&self) -> String {
        let auth = format!("{}:{}", self.client_id, self.client_secret);
        let encoded =
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD, auth.as_bytes());
        format!("Basic {}", encoded)
    }

    async fn token_grant(&self, form: &[(&str, &str)]) -> Result<TokenGrant, UpstreamError> {
        let request = self
            .http
            .post(format!("{}/api/token", self.accounts_url))
            .header("Authorization", self.basic_auth())
            .form(form);

        let token: TokenResponse = send_json(request).await?;
        Ok(TokenGrant {
            access_token: token.access_token,
            expires_in_secs: token.expires_in as i64,
            refresh_token: token.refresh_token,
        })
    }

    async fn get<T: DeserializeOwned>(
        &self,
        access_token: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, UpstreamError> {
        let request = self
            .http
            .get(format!("{}{}", self.api_url, path))
            .header("Authorization", format!("Bearer {}", access_token))
            .query(query);
        send_json(request).await
    }
}

async fn send_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, UpstreamError> {
    let response = request.send().await?;
    let status = response.status();

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(UpstreamError::Status {
            status: status.as_u16(),
            body: error_reason(&body),
        });
    }

    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| UpstreamError::Decode(e.to_string()))
}

/// Best human-readable reason from an error body: the OAuth error pair, the
/// Web API error message, or the raw text.
pub fn error_reason(body: &str) -> String {
    if let Ok(oauth) = serde_json::from_str::<OAuthErrorResponse>(body) {
        return oauth.reason();
    }
    if let Ok(api) = serde_json::from_str::<ApiErrorResponse>(body) {
        if !api.error.message.is_empty() {
            return api.error.message;
        }
    }
    body.trim().to_string()
}

#[async_trait]
impl MusicApi for SpotifyClient {
    async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenGrant, UpstreamError> {
        self.token_grant(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .await
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenGrant, UpstreamError> {
        let mut form = vec![("grant_type", "authorization_code"), ("code", code)];
        if let Some(redirect_uri) = self.redirect_uri.as_deref() {
            form.push(("redirect_uri", redirect_uri));
        }
        self.token_grant(&form).await
    }

    async fn current_user(&self, access_token: &str) -> Result<UserProfile, UpstreamError> {
        let user: PrivateUserObject = self.get(access_token, "/me", &[]).await?;
        Ok(UserProfile {
            id: user.id,
            display_name: user.display_name,
            email: user.email,
        })
    }

    async fn recently_played(
        &self,
        access_token: &str,
        limit: u32,
    ) -> Result<Vec<PlayedItem>, UpstreamError> {
        let page: RecentlyPlayedResponse = self
            .get(
                access_token,
                "/me/player/recently-played",
                &[("limit", limit.to_string())],
            )
            .await?;

        let total = page.items.len();
        let items: Vec<PlayedItem> = page.items.into_iter().filter_map(played_item).collect();
        if items.len() < total {
            tracing::warn!(
                "dropped {} of {} recently played items without a track id or timestamp",
                total - items.len(),
                total
            );
        }
        Ok(items)
    }

    async fn track(
        &self,
        access_token: &str,
        track_id: &str,
    ) -> Result<TrackMetadata, UpstreamError> {
        let track: TrackObject = self
            .get(access_token, &format!("/tracks/{}", track_id), &[])
            .await?;
        track_metadata(track, Utc::now())
    }

    async fn artist(
        &self,
        access_token: &str,
        artist_id: &str,
    ) -> Result<ArtistMetadata, UpstreamError> {
        let artist: ArtistObject = self
            .get(access_token, &format!("/artists/{}", artist_id), &[])
            .await?;
        Ok(artist_metadata(artist, Utc::now()))
    }

    async fn playlists(
        &self,
        access_token: &str,
        limit: u32,
    ) -> Result<Vec<PlaylistSummary>, UpstreamError> {
        let page: Paging<SimplifiedPlaylistObject> = self
            .get(access_token, "/me/playlists", &[("limit", limit.to_string())])
            .await?;
        Ok(page.items.into_iter().map(playlist_summary).collect())
    }
}

pub fn played_item(item: PlayHistoryObject) -> Option<PlayedItem> {
    let track = item.track?;
    let track_id = track.id.filter(|id| !id.is_empty())?;
    let played_at = match DateTime::parse_from_rfc3339(&item.played_at) {
        Ok(at) => at.with_timezone(&Utc),
        Err(e) => {
            tracing::debug!("unparseable played_at '{}': {}", item.played_at, e);
            return None;
        }
    };

    Some(PlayedItem {
        track_id,
        played_at,
        duration_ms: track.duration_ms as i64,
        context: item.context.map(|c| PlaybackContext {
            kind: c.kind,
            uri: c.uri,
        }),
        artist_ids: track
            .artists
            .into_iter()
            .filter_map(|artist| artist.id)
            .filter(|id| !id.is_empty())
            .collect(),
    })
}

pub fn track_metadata(
    track: TrackObject,
    fetched_at: DateTime<Utc>,
) -> Result<TrackMetadata, UpstreamError> {
    let track_id = track
        .id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| UpstreamError::Decode(format!("track '{}' has no id", track.name)))?;

    let (album, album_image_url, release_date) = match track.album {
        Some(album) => {
            let image = album.images.into_iter().next().map(|img| img.url);
            (album.name, image, album.release_date)
        }
        None => (String::new(), None, None),
    };

    Ok(TrackMetadata {
        track_id,
        name: track.name,
        artists: track
            .artists
            .into_iter()
            .filter_map(|a| a.id.map(|id| ArtistRef { id, name: a.name }))
            .collect(),
        album,
        album_image_url,
        duration_ms: track.duration_ms as i64,
        popularity: track.popularity.map(i32::from),
        release_date,
        updated_at: fetched_at,
    })
}

pub fn artist_metadata(artist: ArtistObject, fetched_at: DateTime<Utc>) -> ArtistMetadata {
    ArtistMetadata {
        artist_id: artist.id,
        name: artist.name,
        genres: artist.genres,
        popularity: artist.popularity.map(i32::from),
        followers: artist.followers.map(|f| f.total as i64),
        image_url: artist.images.into_iter().next().map(|img| img.url),
        updated_at: fetched_at,
    }
}

fn playlist_summary(playlist: SimplifiedPlaylistObject) -> PlaylistSummary {
    PlaylistSummary {
        playlist_id: playlist.id,
        name: playlist.name,
        description: playlist.description.filter(|d| !d.is_empty()),
        owner: playlist.owner.map(|o| o.id),
        snapshot_id: playlist.snapshot_id,
        total_tracks: playlist.tracks.map(|t| t.total as i64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(body: &str) -> PlayHistoryObject {
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn played_item_keeps_context_and_credit_order() {
        let item = played_item(history(
            r#"{
                "track": {
                    "id": "t1",
                    "name": "Song",
                    "artists": [{"id": "a1", "name": "One"}, {"id": "a2", "name": "Two"}],
                    "duration_ms": 180000
                },
                "played_at": "2024-01-01T00:00:00.000Z",
                "context": {"type": "playlist", "uri": "spotify:playlist:p1"}
            }"#,
        ))
        .unwrap();

        assert_eq!(item.track_id, "t1");
        assert_eq!(item.duration_ms, 180_000);
        assert_eq!(item.artist_ids, vec!["a1", "a2"]);
        assert_eq!(item.context.unwrap().id(), Some("p1"));
    }

    #[test]
    fn played_item_drops_local_tracks_and_bad_timestamps() {
        let local = history(
            r#"{
                "track": {"id": null, "name": "demo", "artists": [], "duration_ms": 1000},
                "played_at": "2024-01-01T00:00:00Z"
            }"#,
        );
        assert!(played_item(local).is_none());

        let garbled = history(
            r#"{
                "track": {"id": "t1", "name": "Song", "artists": [], "duration_ms": 1000},
                "played_at": "yesterday"
            }"#,
        );
        assert!(played_item(garbled).is_none());
    }

    #[test]
    fn error_reason_prefers_structured_bodies() {
        assert_eq!(
            error_reason(r#"{"error":"invalid_grant","error_description":"Refresh token revoked"}"#),
            "invalid_grant: Refresh token revoked"
        );
        assert_eq!(
            error_reason(r#"{"error":{"status":429,"message":"API rate limit exceeded"}}"#),
            "API rate limit exceeded"
        );
        assert_eq!(error_reason("  upstream exploded \n"), "upstream exploded");
    }

    #[test]
    fn track_metadata_uses_first_album_image() {
        let track: TrackObject = serde_json::from_str(
            r#"{
                "id": "t1",
                "name": "Song",
                "artists": [{"id": "a1", "name": "One"}],
                "album": {
                    "name": "Record",
                    "images": [{"url": "https://img/large", "width": 640}, {"url": "https://img/small", "width": 64}],
                    "release_date": "1999"
                },
                "duration_ms": 1000,
                "popularity": 12
            }"#,
        )
        .unwrap();
        let metadata = track_metadata(track, Utc::now()).unwrap();
        assert_eq!(metadata.album, "Record");
        assert_eq!(metadata.album_image_url.as_deref(), Some("https://img/large"));
        assert_eq!(metadata.popularity, Some(12));
        assert_eq!(metadata.artists[0].id, "a1");
    }

    #[test]
    fn artist_metadata_keeps_genre_order() {
        let artist: ArtistObject = serde_json::from_str(
            r#"{"id": "a1", "name": "One", "genres": ["shoegaze", "dream pop"], "popularity": 3, "followers": {"total": 42}}"#,
        )
        .unwrap();
        let metadata = artist_metadata(artist, Utc::now());
        assert_eq!(metadata.primary_genre(), Some("shoegaze"));
        assert_eq!(metadata.followers, Some(42));
    }
}

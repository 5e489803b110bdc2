//! In-process store with the same conditional-write and paging behaviour as
//! the Postgres backend. Used by tests and for local runs without a database.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    check_batch_size, ActivityCursor, ActivityStore, MetadataStore, Page, UserStore, WriteOutcome,
    DEFAULT_PAGE_SIZE,
};
use crate::errors::StoreError;
use crate::models::{
    ActivityEvent, ArtistMetadata, NewUser, Playlist, PlaylistPlay, TrackMetadata, User,
};

#[derive(Default)]
struct Tables {
    users: BTreeMap<String, User>,
    // user id -> sort key -> item
    track_plays: HashMap<String, BTreeMap<String, ActivityEvent>>,
    playlist_plays: HashMap<String, BTreeMap<String, PlaylistPlay>>,
    playlists: HashMap<String, BTreeMap<String, Playlist>>,
    tracks: HashMap<String, TrackMetadata>,
    artists: HashMap<String, ArtistMetadata>,
}

pub struct MemoryStore {
    tables: RwLock<Tables>,
    page_size: usize,
    batch_get_calls: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    /// Small pages force callers through the continuation path.
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            page_size: page_size.max(1),
            batch_get_calls: AtomicUsize::new(0),
        }
    }

    /// Number of batch-get round trips served so far (tracks and artists).
    pub fn batch_get_calls(&self) -> usize {
        self.batch_get_calls.load(Ordering::SeqCst)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables
            .read()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StoreError> {
        self.tables
            .write()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }
}

fn insert_if_absent<T>(partition: &mut BTreeMap<String, T>, key: String, item: T) -> WriteOutcome {
    if partition.contains_key(&key) {
        return WriteOutcome::AlreadyRecorded;
    }
    partition.insert(key, item);
    WriteOutcome::Inserted
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn upsert_user(&self, user: &NewUser) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        let now = Utc::now();
        match tables.users.get_mut(&user.id) {
            Some(existing) => {
                existing.spotify_id = user.spotify_id.clone();
                existing.display_name = user.display_name.clone();
                existing.email = user.email.clone();
                if user.refresh_token.is_some() {
                    existing.refresh_token = user.refresh_token.clone();
                }
                existing.updated_at = now;
            }
            None => {
                tables.users.insert(
                    user.id.clone(),
                    User {
                        id: user.id.clone(),
                        spotify_id: user.spotify_id.clone(),
                        display_name: user.display_name.clone(),
                        email: user.email.clone(),
                        refresh_token: user.refresh_token.clone(),
                        access_token: None,
                        token_expires_at: None,
                        created_at: now,
                        updated_at: now,
                    },
                );
            }
        }
        Ok(())
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<User>, StoreError> {
        Ok(self.read()?.users.get(user_id).cloned())
    }

    async fn update_access_token(
        &self,
        user_id: &str,
        access_token: &str,
        expires_at: DateTime<Utc>,
        rotated_refresh_token: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        let user = tables.users.get_mut(user_id).ok_or_else(|| StoreError::Corrupt {
            key: format!("USER#{user_id}"),
            reason: "token update for unknown user".to_string(),
        })?;
        user.access_token = Some(access_token.to_string());
        user.token_expires_at = Some(expires_at);
        if let Some(refresh_token) = rotated_refresh_token {
            user.refresh_token = Some(refresh_token.to_string());
        }
        user.updated_at = Utc::now();
        Ok(())
    }

    async fn scan_users_page(&self, start_after: Option<&str>) -> Result<Page<User>, StoreError> {
        let tables = self.read()?;
        let mut remaining = tables
            .users
            .iter()
            .filter(|(id, _)| start_after.map_or(true, |after| id.as_str() > after))
            .map(|(_, user)| user.clone());

        let items: Vec<User> = remaining.by_ref().take(self.page_size).collect();
        let more = remaining.next().is_some();
        let last_evaluated_key = if more {
            items.last().map(|user| user.id.clone())
        } else {
            None
        };
        Ok(Page {
            items,
            last_evaluated_key,
        })
    }
}

#[async_trait]
impl ActivityStore for MemoryStore {
    async fn put_activity_if_absent(
        &self,
        event: &ActivityEvent,
    ) -> Result<WriteOutcome, StoreError> {
        let mut tables = self.write()?;
        let partition = tables.track_plays.entry(event.user_id.clone()).or_default();
        Ok(insert_if_absent(partition, event.sort_key(), event.clone()))
    }

    async fn query_activity_page(
        &self,
        user_id: &str,
        since: Option<DateTime<Utc>>,
        cursor: Option<ActivityCursor>,
    ) -> Result<Page<ActivityEvent, ActivityCursor>, StoreError> {
        let tables = self.read()?;
        let mut matching: Vec<(String, ActivityEvent)> = tables
            .track_plays
            .get(user_id)
            .map(|partition| {
                partition
                    .iter()
                    .filter(|(_, e)| since.map_or(true, |since| e.played_at >= since))
                    .map(|(k, e)| (k.clone(), e.clone()))
                    .collect()
            })
            .unwrap_or_default();

        matching.sort_by(|(ka, a), (kb, b)| b.played_at.cmp(&a.played_at).then_with(|| kb.cmp(ka)));

        let mut remaining = matching.into_iter().filter(|(key, event)| match &cursor {
            Some(c) => (event.played_at, key.as_str()) < (c.played_at, c.sort_key.as_str()),
            None => true,
        });

        let items: Vec<ActivityEvent> = remaining
            .by_ref()
            .take(self.page_size)
            .map(|(_, event)| event)
            .collect();
        let more = remaining.next().is_some();
        let last_evaluated_key = if more {
            items.last().map(ActivityCursor::after)
        } else {
            None
        };
        Ok(Page {
            items,
            last_evaluated_key,
        })
    }

    async fn put_playlist_play_if_absent(
        &self,
        play: &PlaylistPlay,
    ) -> Result<WriteOutcome, StoreError> {
        let mut tables = self.write()?;
        let partition = tables.playlist_plays.entry(play.user_id.clone()).or_default();
        Ok(insert_if_absent(partition, play.sort_key(), play.clone()))
    }

    async fn put_playlist_if_absent(
        &self,
        playlist: &Playlist,
    ) -> Result<WriteOutcome, StoreError> {
        let mut tables = self.write()?;
        let partition = tables.playlists.entry(playlist.user_id.clone()).or_default();
        Ok(insert_if_absent(partition, playlist.sort_key(), playlist.clone()))
    }

    async fn get_playlist_plays(&self, user_id: &str) -> Result<Vec<PlaylistPlay>, StoreError> {
        let tables = self.read()?;
        let mut plays: Vec<PlaylistPlay> = tables
            .playlist_plays
            .get(user_id)
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default();
        plays.sort_by(|a, b| b.played_at.cmp(&a.played_at));
        Ok(plays)
    }

    async fn get_playlists(&self, user_id: &str) -> Result<Vec<Playlist>, StoreError> {
        let tables = self.read()?;
        Ok(tables
            .playlists
            .get(user_id)
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn get_track(&self, track_id: &str) -> Result<Option<TrackMetadata>, StoreError> {
        Ok(self.read()?.tracks.get(track_id).cloned())
    }

    async fn create_track_if_absent(
        &self,
        track: &TrackMetadata,
    ) -> Result<WriteOutcome, StoreError> {
        let mut tables = self.write()?;
        if tables.tracks.contains_key(&track.track_id) {
            return Ok(WriteOutcome::AlreadyRecorded);
        }
        tables.tracks.insert(track.track_id.clone(), track.clone());
        Ok(WriteOutcome::Inserted)
    }

    async fn update_track(&self, track: &TrackMetadata) -> Result<(), StoreError> {
        self.write()?
            .tracks
            .insert(track.track_id.clone(), track.clone());
        Ok(())
    }

    async fn batch_get_tracks(&self, ids: &[String]) -> Result<Vec<TrackMetadata>, StoreError> {
        check_batch_size(ids)?;
        self.batch_get_calls.fetch_add(1, Ordering::SeqCst);
        let tables = self.read()?;
        Ok(ids.iter().filter_map(|id| tables.tracks.get(id).cloned()).collect())
    }

    async fn get_artist(&self, artist_id: &str) -> Result<Option<ArtistMetadata>, StoreError> {
        Ok(self.read()?.artists.get(artist_id).cloned())
    }

    async fn create_artist_if_absent(
        &self,
        artist: &ArtistMetadata,
    ) -> Result<WriteOutcome, StoreError> {
        let mut tables = self.write()?;
        if tables.artists.contains_key(&artist.artist_id) {
            return Ok(WriteOutcome::AlreadyRecorded);
        }
        tables.artists.insert(artist.artist_id.clone(), artist.clone());
        Ok(WriteOutcome::Inserted)
    }

    async fn update_artist(&self, artist: &ArtistMetadata) -> Result<(), StoreError> {
        self.write()?
            .artists
            .insert(artist.artist_id.clone(), artist.clone());
        Ok(())
    }

    async fn batch_get_artists(&self, ids: &[String]) -> Result<Vec<ArtistMetadata>, StoreError> {
        check_batch_size(ids)?;
        self.batch_get_calls.fetch_add(1, Ordering::SeqCst);
        let tables = self.read()?;
        Ok(ids.iter().filter_map(|id| tables.artists.get(id).cloned()).collect())
    }
}

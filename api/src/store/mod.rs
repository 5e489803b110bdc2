//! Storage contracts for users, listening activity and shared metadata.
//!
//! Each trait mirrors the primitives of a partition/sort-key document store:
//! conditional puts, paged queries and scans, and capped batch gets. Paging is
//! exposed one page at a time so backends stay honest about round trips; the
//! provided methods walk pages until the store reports no continuation key.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::StoreError;
use crate::models::{
    ActivityEvent, ArtistMetadata, NewUser, Playlist, PlaylistPlay, TrackMetadata, User,
};

pub use memory::MemoryStore;

/// Largest number of keys a single batch get may carry.
pub const MAX_BATCH_GET: usize = 100;

/// Items a single page returns when the caller does not ask for fewer.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Outcome of an insert-if-absent write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    /// An item with the same key already exists; nothing was written.
    AlreadyRecorded,
}

impl WriteOutcome {
    pub fn is_new(self) -> bool {
        self == WriteOutcome::Inserted
    }
}

#[derive(Debug, Clone)]
pub struct Page<T, C = String> {
    pub items: Vec<T>,
    /// Resume point for the next call; `None` once the result set is exhausted.
    pub last_evaluated_key: Option<C>,
}

/// Continuation point inside a user's activity, newest-first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityCursor {
    pub played_at: DateTime<Utc>,
    pub sort_key: String,
}

impl ActivityCursor {
    pub fn after(event: &ActivityEvent) -> Self {
        Self {
            played_at: event.played_at,
            sort_key: event.sort_key(),
        }
    }
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Create the user or refresh its profile fields. `created_at` is only set
    /// the first time; a `None` refresh token never erases a stored one.
    async fn upsert_user(&self, user: &NewUser) -> Result<(), StoreError>;

    async fn get_user(&self, user_id: &str) -> Result<Option<User>, StoreError>;

    async fn update_access_token(
        &self,
        user_id: &str,
        access_token: &str,
        expires_at: DateTime<Utc>,
        rotated_refresh_token: Option<&str>,
    ) -> Result<(), StoreError>;

    /// One page of users ordered by id, starting after `start_after`.
    async fn scan_users_page(&self, start_after: Option<&str>) -> Result<Page<User>, StoreError>;

    async fn scan_all_users(&self) -> Result<Vec<User>, StoreError> {
        let mut users = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self.scan_users_page(cursor.as_deref()).await?;
            users.extend(page.items);
            match page.last_evaluated_key {
                Some(key) => cursor = Some(key),
                None => break,
            }
        }
        Ok(users)
    }
}

#[async_trait]
pub trait ActivityStore: Send + Sync {
    /// Conditional put keyed by `(user, sort key)`.
    async fn put_activity_if_absent(&self, event: &ActivityEvent)
        -> Result<WriteOutcome, StoreError>;

    /// One page of a user's track plays, newest first, optionally limited to
    /// plays at or after `since`.
    async fn query_activity_page(
        &self,
        user_id: &str,
        since: Option<DateTime<Utc>>,
        cursor: Option<ActivityCursor>,
    ) -> Result<Page<ActivityEvent, ActivityCursor>, StoreError>;

    async fn put_playlist_play_if_absent(
        &self,
        play: &PlaylistPlay,
    ) -> Result<WriteOutcome, StoreError>;

    async fn put_playlist_if_absent(&self, playlist: &Playlist)
        -> Result<WriteOutcome, StoreError>;

    /// Newest first.
    async fn get_playlist_plays(&self, user_id: &str) -> Result<Vec<PlaylistPlay>, StoreError>;

    async fn get_playlists(&self, user_id: &str) -> Result<Vec<Playlist>, StoreError>;

    async fn get_all_activity(&self, user_id: &str) -> Result<Vec<ActivityEvent>, StoreError> {
        self.collect_activity(user_id, None).await
    }

    async fn get_activity_since(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ActivityEvent>, StoreError> {
        self.collect_activity(user_id, Some(since)).await
    }

    async fn collect_activity(
        &self,
        user_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ActivityEvent>, StoreError> {
        let mut events = Vec::new();
        let mut cursor = None;
        loop {
            let page = self.query_activity_page(user_id, since, cursor).await?;
            events.extend(page.items);
            match page.last_evaluated_key {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(events)
    }
}

/// Backing tables of the metadata cache. Batch calls reject more than
/// [`MAX_BATCH_GET`] ids; missing ids are simply absent from the result.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get_track(&self, track_id: &str) -> Result<Option<TrackMetadata>, StoreError>;

    async fn create_track_if_absent(
        &self,
        track: &TrackMetadata,
    ) -> Result<WriteOutcome, StoreError>;

    async fn update_track(&self, track: &TrackMetadata) -> Result<(), StoreError>;

    async fn batch_get_tracks(&self, ids: &[String]) -> Result<Vec<TrackMetadata>, StoreError>;

    async fn get_artist(&self, artist_id: &str) -> Result<Option<ArtistMetadata>, StoreError>;

    async fn create_artist_if_absent(
        &self,
        artist: &ArtistMetadata,
    ) -> Result<WriteOutcome, StoreError>;

    async fn update_artist(&self, artist: &ArtistMetadata) -> Result<(), StoreError>;

    async fn batch_get_artists(&self, ids: &[String]) -> Result<Vec<ArtistMetadata>, StoreError>;
}

pub(crate) fn check_batch_size(ids: &[String]) -> Result<(), StoreError> {
    if ids.len() > MAX_BATCH_GET {
        return Err(StoreError::BatchTooLarge {
            requested: ids.len(),
            max: MAX_BATCH_GET,
        });
    }
    Ok(())
}

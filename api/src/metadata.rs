use std::collections::HashSet;
use std::sync::Arc;

use futures::future::try_join_all;

use crate::errors::{CacheError, StoreError};
use crate::models::{ArtistMetadata, TrackMetadata};
use crate::spotify::MusicApi;
use crate::store::{MetadataStore, MAX_BATCH_GET};

/// Shared track and artist metadata. Entries have no TTL: every observed use
/// re-fetches from the upstream and overwrites what is stored.
#[derive(Clone)]
pub struct MetadataCache {
    store: Arc<dyn MetadataStore>,
    api: Arc<dyn MusicApi>,
}

impl MetadataCache {
    pub fn new(store: Arc<dyn MetadataStore>, api: Arc<dyn MusicApi>) -> Self {
        Self { store, api }
    }

    pub async fn get_or_cache_track(
        &self,
        access_token: &str,
        track_id: &str,
    ) -> Result<TrackMetadata, CacheError> {
        let existing = self.store.get_track(track_id).await?;
        let fresh = self.api.track(access_token, track_id).await?;

        let created = existing.is_none() && self.store.create_track_if_absent(&fresh).await?.is_new();
        if !created {
            // Either cached already or created by a concurrent run since the lookup.
            self.store.update_track(&fresh).await?;
        }
        Ok(fresh)
    }

    pub async fn get_or_cache_artist(
        &self,
        access_token: &str,
        artist_id: &str,
    ) -> Result<ArtistMetadata, CacheError> {
        let existing = self.store.get_artist(artist_id).await?;
        let fresh = self.api.artist(access_token, artist_id).await?;

        let created =
            existing.is_none() && self.store.create_artist_if_absent(&fresh).await?.is_new();
        if !created {
            self.store.update_artist(&fresh).await?;
        }
        Ok(fresh)
    }

    /// Cached tracks for `ids`, in no particular order. Unknown ids are
    /// skipped; duplicates are looked up once.
    pub async fn batch_get_tracks(&self, ids: &[String]) -> Result<Vec<TrackMetadata>, StoreError> {
        let ids = dedupe(ids);
        let chunks = try_join_all(
            ids.chunks(MAX_BATCH_GET)
                .map(|chunk| self.store.batch_get_tracks(chunk)),
        )
        .await?;
        Ok(chunks.into_iter().flatten().collect())
    }

    pub async fn batch_get_artists(
        &self,
        ids: &[String],
    ) -> Result<Vec<ArtistMetadata>, StoreError> {
        let ids = dedupe(ids);
        let chunks = try_join_all(
            ids.chunks(MAX_BATCH_GET)
                .map(|chunk| self.store.batch_get_artists(chunk)),
        )
        .await?;
        Ok(chunks.into_iter().flatten().collect())
    }
}

fn dedupe(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.iter()
        .filter(|id| !id.is_empty() && seen.insert(id.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{artist, track, FakeMusicApi};

    #[tokio::test]
    async fn batch_get_chunks_to_store_cap() {
        let store = Arc::new(MemoryStore::new());
        let ids: Vec<String> = (0..250).map(|i| format!("t{i}")).collect();
        for id in &ids {
            store.create_track_if_absent(&track(id, &["a1"], None)).await.unwrap();
        }
        let cache = MetadataCache::new(store.clone(), Arc::new(FakeMusicApi::default()));

        let tracks = cache.batch_get_tracks(&ids).await.unwrap();

        assert_eq!(store.batch_get_calls(), 3);
        assert_eq!(tracks.len(), 250);
    }

    #[tokio::test]
    async fn batch_get_skips_duplicates_and_unknown_ids() {
        let store = Arc::new(MemoryStore::new());
        store.create_artist_if_absent(&artist("a1", &["jazz"])).await.unwrap();
        let cache = MetadataCache::new(store.clone(), Arc::new(FakeMusicApi::default()));

        let ids = vec!["a1".to_string(), "a1".to_string(), "ghost".to_string()];
        let artists = cache.batch_get_artists(&ids).await.unwrap();

        assert_eq!(artists.len(), 1);
        assert_eq!(store.batch_get_calls(), 1);
    }

    #[tokio::test]
    async fn get_or_cache_creates_then_overwrites() {
        let store = Arc::new(MemoryStore::new());
        let api = Arc::new(FakeMusicApi::default().with_track(track("t1", &["a1"], Some(80))));
        let cache = MetadataCache::new(store.clone(), api.clone());

        cache.get_or_cache_track("tok", "t1").await.unwrap();
        assert_eq!(store.get_track("t1").await.unwrap().unwrap().popularity, Some(80));

        let mut stale = track("t1", &["a1"], Some(3));
        stale.name = "Old name".to_string();
        store.update_track(&stale).await.unwrap();

        let fresh = cache.get_or_cache_track("tok", "t1").await.unwrap();
        assert_eq!(fresh.popularity, Some(80));
        assert_eq!(store.get_track("t1").await.unwrap().unwrap().name, "Track t1");
        assert_eq!(FakeMusicApi::calls(&api.track_calls), 2);
    }

    #[tokio::test]
    async fn upstream_failure_leaves_store_untouched() {
        let store = Arc::new(MemoryStore::new());
        let cache = MetadataCache::new(store.clone(), Arc::new(FakeMusicApi::default()));

        let err = cache.get_or_cache_artist("tok", "missing").await.unwrap_err();

        assert!(matches!(err, CacheError::Upstream(_)));
        assert!(store.get_artist("missing").await.unwrap().is_none());
    }
}

//! Ingestion job: pulls each user's recent listening history and records it.
//!
//! Every unit of work below the user level runs through [`isolate`], which
//! turns a failure into an [`ItemFailure`] on the user's report instead of
//! aborting the remaining items. A user whose token or history fetch fails is
//! recorded on the [`RunReport`] and the run moves on to the next user.

use std::collections::HashSet;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;

use crate::config::IngestConfig;
use crate::errors::{IngestError, StoreError};
use crate::metadata::MetadataCache;
use crate::models::{PlayedItem, User};
use crate::spotify::MusicApi;
use crate::store::{ActivityStore, UserStore, WriteOutcome};
use crate::token::TokenManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    TrackPlay,
    PlaylistPlay,
    Playlists,
    Playlist,
    TrackMetadata,
    ArtistMetadata,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemFailure {
    pub stage: Stage,
    pub target: String,
    pub reason: String,
}

#[derive(Debug)]
pub enum Outcome<T> {
    Completed(T),
    Failed(ItemFailure),
}

/// Awaits one unit of work, converting its error into a logged failure.
pub async fn isolate<T, E, F>(stage: Stage, target: &str, work: F) -> Outcome<T>
where
    E: Display,
    F: Future<Output = Result<T, E>>,
{
    match work.await {
        Ok(value) => Outcome::Completed(value),
        Err(e) => {
            tracing::warn!("{:?} failed for {}: {}", stage, target, e);
            Outcome::Failed(ItemFailure {
                stage,
                target: target.to_string(),
                reason: e.to_string(),
            })
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserReport {
    pub user_id: String,
    pub fetched: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub playlist_plays_inserted: usize,
    pub playlists_inserted: usize,
    pub tracks_refreshed: usize,
    pub artists_refreshed: usize,
    pub failures: Vec<ItemFailure>,
}

impl UserReport {
    fn record<T>(&mut self, outcome: Outcome<T>) -> Option<T> {
        match outcome {
            Outcome::Completed(value) => Some(value),
            Outcome::Failed(failure) => {
                self.failures.push(failure);
                None
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserFailure {
    pub user_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub users: usize,
    pub completed: Vec<UserReport>,
    pub failed: Vec<UserFailure>,
}

impl RunReport {
    pub fn inserted(&self) -> usize {
        self.completed.iter().map(|r| r.inserted).sum()
    }
}

#[derive(Clone)]
pub struct Ingestor {
    users: Arc<dyn UserStore>,
    activity: Arc<dyn ActivityStore>,
    tokens: TokenManager,
    metadata: MetadataCache,
    api: Arc<dyn MusicApi>,
    config: IngestConfig,
}

impl Ingestor {
    pub fn new(
        users: Arc<dyn UserStore>,
        activity: Arc<dyn ActivityStore>,
        tokens: TokenManager,
        metadata: MetadataCache,
        api: Arc<dyn MusicApi>,
        config: IngestConfig,
    ) -> Self {
        Self {
            users,
            activity,
            tokens,
            metadata,
            api,
            config,
        }
    }

    pub fn with_user_concurrency(mut self, parallelism: usize) -> Self {
        self.config.user_concurrency = parallelism.max(1);
        self
    }

    pub async fn run_for_user(&self, user: &User) -> Result<UserReport, IngestError> {
        let access_token = self.tokens.get_valid_access_token(user).await?;
        let items = self
            .api
            .recently_played(&access_token, self.config.page_limit)
            .await?;

        let mut report = UserReport {
            user_id: user.id.clone(),
            fetched: items.len(),
            ..UserReport::default()
        };

        for item in &items {
            self.record_item(user, item, &mut report).await;
        }

        self.refresh_metadata(&access_token, &items, &mut report).await;
        self.record_playlists(user, &access_token, &mut report).await;

        tracing::debug!(
            "user {}: {} fetched, {} new, {} already recorded, {} item failures",
            user.id,
            report.fetched,
            report.inserted,
            report.duplicates,
            report.failures.len()
        );
        Ok(report)
    }

    async fn record_item(&self, user: &User, item: &PlayedItem, report: &mut UserReport) {
        let event = item.to_event(&user.id);
        let key = event.sort_key();
        let written = isolate(
            Stage::TrackPlay,
            &key,
            self.activity.put_activity_if_absent(&event),
        )
        .await;
        match report.record(written) {
            Some(WriteOutcome::Inserted) => report.inserted += 1,
            Some(WriteOutcome::AlreadyRecorded) => report.duplicates += 1,
            None => {}
        }

        if let Some(play) = item.to_playlist_play(&user.id) {
            let key = play.sort_key();
            let written = isolate(
                Stage::PlaylistPlay,
                &key,
                self.activity.put_playlist_play_if_absent(&play),
            )
            .await;
            if let Some(WriteOutcome::Inserted) = report.record(written) {
                report.playlist_plays_inserted += 1;
            }
        }
    }

    /// Refreshes each distinct track and credited artist on the page once,
    /// whether its play was new or already recorded.
    async fn refresh_metadata(&self, access_token: &str, items: &[PlayedItem], report: &mut UserReport) {
        let mut seen = HashSet::new();
        let track_ids: Vec<String> = items
            .iter()
            .map(|item| item.track_id.as_str())
            .filter(|id| seen.insert(*id))
            .map(String::from)
            .collect();

        let mut seen = HashSet::new();
        let artist_ids: Vec<String> = items
            .iter()
            .flat_map(|item| item.artist_ids.iter().map(String::as_str))
            .filter(|id| seen.insert(*id))
            .map(String::from)
            .collect();

        let concurrency = self.config.metadata_concurrency.max(1);

        // Owned ids: borrowed ones break the `Send` bound on handler futures.
        let tracks: Vec<Outcome<_>> = stream::iter(track_ids)
            .map(|id| async move {
                isolate(
                    Stage::TrackMetadata,
                    &id,
                    self.metadata.get_or_cache_track(access_token, &id),
                )
                .await
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;
        for outcome in tracks {
            if report.record(outcome).is_some() {
                report.tracks_refreshed += 1;
            }
        }

        let artists: Vec<Outcome<_>> = stream::iter(artist_ids)
            .map(|id| async move {
                isolate(
                    Stage::ArtistMetadata,
                    &id,
                    self.metadata.get_or_cache_artist(access_token, &id),
                )
                .await
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;
        for outcome in artists {
            if report.record(outcome).is_some() {
                report.artists_refreshed += 1;
            }
        }
    }

    async fn record_playlists(&self, user: &User, access_token: &str, report: &mut UserReport) {
        let listed = isolate(
            Stage::Playlists,
            &user.id,
            self.api.playlists(access_token, self.config.page_limit),
        )
        .await;
        let Some(playlists) = report.record(listed) else {
            return;
        };

        let seen_at = Utc::now();
        for summary in playlists {
            let playlist = summary.into_playlist(&user.id, seen_at);
            let key = playlist.sort_key();
            let written = isolate(
                Stage::Playlist,
                &key,
                self.activity.put_playlist_if_absent(&playlist),
            )
            .await;
            if let Some(WriteOutcome::Inserted) = report.record(written) {
                report.playlists_inserted += 1;
            }
        }
    }

    /// Scans every user and ingests each one. Only the scan itself can fail
    /// the run; per-user failures are collected on the report.
    pub async fn run_for_all_users(&self) -> Result<RunReport, StoreError> {
        let users = self.users.scan_all_users().await?;
        let total = users.len();
        let parallelism = self.config.user_concurrency.max(1);

        tracing::info!(
            "Starting ingestion for {} users with parallelism {}",
            total,
            parallelism
        );

        let processed = &AtomicUsize::new(0);

        let results: Vec<(String, Result<UserReport, IngestError>)> = stream::iter(users)
            .map(move |user| async move {
                let result = self.run_for_user(&user).await;
                let current = processed.fetch_add(1, Ordering::SeqCst) + 1;

                match &result {
                    Ok(report) => {
                        tracing::info!(
                            "[{}/{}] Ingested {} new plays for {}",
                            current,
                            total,
                            report.inserted,
                            user.id
                        );
                    }
                    Err(e) => {
                        tracing::error!("[{}/{}] Failed to ingest {}: {}", current, total, user.id, e);
                    }
                }
                (user.id, result)
            })
            .buffer_unordered(parallelism)
            .collect()
            .await;

        let mut report = RunReport {
            users: total,
            ..RunReport::default()
        };
        for (user_id, result) in results {
            match result {
                Ok(user_report) => report.completed.push(user_report),
                Err(e) => report.failed.push(UserFailure {
                    user_id,
                    reason: e.to_string(),
                }),
            }
        }
        report.completed.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        report.failed.sort_by(|a, b| a.user_id.cmp(&b.user_id));

        tracing::info!(
            "Ingestion complete. Users: {}, Failed: {}, New plays: {}",
            report.users,
            report.failed.len(),
            report.inserted()
        );
        Ok(report)
    }
}

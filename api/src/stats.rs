use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;

use crate::errors::StoreError;
use crate::metadata::MetadataCache;
use crate::models::{ActivityEvent, ArtistMetadata, TrackMetadata};
use crate::store::ActivityStore;

/// Popularity assumed for tracks with no cached metadata or no popularity.
pub const DEFAULT_POPULARITY: i32 = 50;

/// Genres shown individually before the tail is folded into [`OTHER_GENRE`].
pub const MAX_NAMED_GENRES: usize = 19;
pub const OTHER_GENRE: &str = "Other";

pub const HISTOGRAM_BIN_SECS: i64 = 15;

const MS_PER_MINUTE: f64 = 60_000.0;

pub fn minutes_from_ms(total_ms: i64) -> f64 {
    total_ms as f64 / MS_PER_MINUTE
}

pub fn total_minutes(events: &[ActivityEvent]) -> f64 {
    minutes_from_ms(events.iter().map(|e| e.duration_ms.max(0)).sum())
}

/// Start of a window reaching `days_ago` days back from `now`. `None` when the
/// window reaches past the Unix epoch, which covers all recorded listening.
pub fn window_start(days_ago: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Duration::try_days(i64::from(days_ago))
        .and_then(|span| now.checked_sub_signed(span))
        .filter(|start| *start > DateTime::<Utc>::UNIX_EPOCH)
}

/// Duration-weighted average of `100 - popularity` over the user's tracks.
/// Higher means more underground; no listening time scores 0.
pub fn underground_score(events: &[ActivityEvent], tracks: &HashMap<String, TrackMetadata>) -> f64 {
    let mut ms_per_track: HashMap<&str, i64> = HashMap::new();
    for event in events {
        *ms_per_track.entry(event.track_id.as_str()).or_default() += event.duration_ms.max(0);
    }

    let total_ms: i64 = ms_per_track.values().sum();
    if total_ms == 0 {
        return 0.0;
    }

    let weighted: f64 = ms_per_track
        .iter()
        .map(|(track_id, ms)| {
            let popularity = tracks
                .get(*track_id)
                .and_then(|t| t.popularity)
                .unwrap_or(DEFAULT_POPULARITY)
                .clamp(0, 100);
            f64::from(100 - popularity) * minutes_from_ms(*ms)
        })
        .sum();

    weighted / minutes_from_ms(total_ms)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopTrackInGenre {
    pub track_id: String,
    pub plays: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenreSlice {
    pub genre: String,
    pub plays: u64,
    pub top_track: Option<TopTrackInGenre>,
}

/// Plays grouped by the primary genre of each play's first credited artist.
/// Plays whose artist has no cached genre are left out.
pub fn genre_distribution(
    events: &[ActivityEvent],
    artists: &HashMap<String, ArtistMetadata>,
) -> Vec<GenreSlice> {
    let mut by_genre: HashMap<&str, HashMap<&str, u64>> = HashMap::new();
    for event in events {
        let genre = event
            .primary_artist_id()
            .and_then(|id| artists.get(id))
            .and_then(ArtistMetadata::primary_genre);
        if let Some(genre) = genre {
            *by_genre
                .entry(genre)
                .or_default()
                .entry(event.track_id.as_str())
                .or_default() += 1;
        }
    }

    let mut slices: Vec<(&str, HashMap<&str, u64>)> = by_genre.into_iter().collect();
    slices.sort_by(|(ga, ta), (gb, tb)| {
        let pa: u64 = ta.values().sum();
        let pb: u64 = tb.values().sum();
        pb.cmp(&pa).then_with(|| ga.cmp(gb))
    });

    let mut named = Vec::new();
    let mut other: HashMap<&str, u64> = HashMap::new();
    let fold_tail = slices.len() > MAX_NAMED_GENRES;
    for (index, (genre, tracks)) in slices.into_iter().enumerate() {
        if fold_tail && index >= MAX_NAMED_GENRES {
            for (track_id, plays) in tracks {
                *other.entry(track_id).or_default() += plays;
            }
        } else {
            named.push(slice(genre, &tracks));
        }
    }
    if !other.is_empty() {
        named.push(slice(OTHER_GENRE, &other));
    }
    named
}

fn slice(genre: &str, tracks: &HashMap<&str, u64>) -> GenreSlice {
    let top_track = tracks
        .iter()
        .max_by(|(ta, pa), (tb, pb)| pa.cmp(pb).then_with(|| tb.cmp(ta)))
        .map(|(track_id, plays)| TopTrackInGenre {
            track_id: track_id.to_string(),
            plays: *plays,
        });
    GenreSlice {
        genre: genre.to_string(),
        plays: tracks.values().sum(),
        top_track,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramBin {
    pub bin: String,
    pub count: u64,
}

fn format_mss(total_secs: i64) -> String {
    format!("{}:{:02}", total_secs / 60, total_secs % 60)
}

/// Play counts per 15-second duration bin, labelled `m:ss-m:ss`, shortest
/// first. Empty bins are omitted.
pub fn duration_histogram(events: &[ActivityEvent]) -> Vec<HistogramBin> {
    let mut bins: BTreeMap<i64, u64> = BTreeMap::new();
    for event in events {
        let secs = event.duration_ms.max(0) / 1000;
        *bins.entry(secs / HISTOGRAM_BIN_SECS * HISTOGRAM_BIN_SECS).or_default() += 1;
    }
    bins.into_iter()
        .map(|(start, count)| HistogramBin {
            bin: format!("{}-{}", format_mss(start), format_mss(start + HISTOGRAM_BIN_SECS)),
            count,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DayBucket {
    pub date: NaiveDate,
    pub plays: u64,
    pub minutes: f64,
}

#[derive(Debug, Clone, Default)]
pub struct PlayFilter {
    pub track_id: Option<String>,
    pub artist_id: Option<String>,
}

impl PlayFilter {
    fn matches(&self, event: &ActivityEvent) -> bool {
        let track_ok = self.track_id.as_deref().map_or(true, |id| event.track_id == id);
        let artist_ok = self
            .artist_id
            .as_deref()
            .map_or(true, |id| event.artist_id_list().any(|a| a == id));
        track_ok && artist_ok
    }
}

/// Per-day (UTC) play counts and minutes, oldest day first.
pub fn plays_over_time(events: &[ActivityEvent], filter: &PlayFilter) -> Vec<DayBucket> {
    let mut days: BTreeMap<NaiveDate, (u64, i64)> = BTreeMap::new();
    for event in events.iter().filter(|e| filter.matches(e)) {
        let day = days.entry(event.played_at.date_naive()).or_default();
        day.0 += 1;
        day.1 += event.duration_ms.max(0);
    }
    days.into_iter()
        .map(|(date, (plays, ms))| DayBucket {
            date,
            plays,
            minutes: minutes_from_ms(ms),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayCount {
    pub id: String,
    pub plays: u64,
    pub minutes: f64,
}

fn rank_counts(counts: HashMap<&str, (u64, i64)>, limit: usize) -> Vec<PlayCount> {
    let mut ranked: Vec<PlayCount> = counts
        .into_iter()
        .map(|(id, (plays, ms))| PlayCount {
            id: id.to_string(),
            plays,
            minutes: minutes_from_ms(ms),
        })
        .collect();
    ranked.sort_by(|a, b| b.plays.cmp(&a.plays).then_with(|| a.id.cmp(&b.id)));
    ranked.truncate(limit);
    ranked
}

pub fn top_tracks(events: &[ActivityEvent], limit: usize) -> Vec<PlayCount> {
    let mut counts: HashMap<&str, (u64, i64)> = HashMap::new();
    for event in events {
        let entry = counts.entry(event.track_id.as_str()).or_default();
        entry.0 += 1;
        entry.1 += event.duration_ms.max(0);
    }
    rank_counts(counts, limit)
}

/// Every credited artist gets the play, not just the first.
pub fn top_artists(events: &[ActivityEvent], limit: usize) -> Vec<PlayCount> {
    let mut counts: HashMap<&str, (u64, i64)> = HashMap::new();
    for event in events {
        for artist_id in event.artist_id_list() {
            let entry = counts.entry(artist_id).or_default();
            entry.0 += 1;
            entry.1 += event.duration_ms.max(0);
        }
    }
    rank_counts(counts, limit)
}

/// Read-side queries over one user's activity.
#[derive(Clone)]
pub struct UserStats {
    activity: Arc<dyn ActivityStore>,
    metadata: MetadataCache,
}

impl UserStats {
    pub fn new(activity: Arc<dyn ActivityStore>, metadata: MetadataCache) -> Self {
        Self { activity, metadata }
    }

    pub async fn activity(
        &self,
        user_id: &str,
        days_ago: Option<u32>,
    ) -> Result<Vec<ActivityEvent>, StoreError> {
        match days_ago.and_then(|days| window_start(days, Utc::now())) {
            Some(since) => self.activity.get_activity_since(user_id, since).await,
            None => self.activity.get_all_activity(user_id).await,
        }
    }

    pub async fn total_minutes_listened(
        &self,
        user_id: &str,
        days_ago: Option<u32>,
    ) -> Result<f64, StoreError> {
        let events = self.activity(user_id, days_ago).await?;
        Ok(total_minutes(&events))
    }

    pub async fn underground_score(&self, user_id: &str) -> Result<f64, StoreError> {
        let events = self.activity.get_all_activity(user_id).await?;
        if events.is_empty() {
            return Ok(0.0);
        }
        let ids: Vec<String> = events.iter().map(|e| e.track_id.clone()).collect();
        let tracks = self
            .metadata
            .batch_get_tracks(&ids)
            .await?
            .into_iter()
            .map(|t| (t.track_id.clone(), t))
            .collect();
        Ok(underground_score(&events, &tracks))
    }

    pub async fn genre_distribution(&self, user_id: &str) -> Result<Vec<GenreSlice>, StoreError> {
        let events = self.activity.get_all_activity(user_id).await?;
        let ids: Vec<String> = events
            .iter()
            .filter_map(|e| e.primary_artist_id().map(String::from))
            .collect();
        let artists = self
            .metadata
            .batch_get_artists(&ids)
            .await?
            .into_iter()
            .map(|a| (a.artist_id.clone(), a))
            .collect();
        Ok(genre_distribution(&events, &artists))
    }

    pub async fn duration_histogram(&self, user_id: &str) -> Result<Vec<HistogramBin>, StoreError> {
        let events = self.activity.get_all_activity(user_id).await?;
        Ok(duration_histogram(&events))
    }

    pub async fn plays_over_time(
        &self,
        user_id: &str,
        filter: &PlayFilter,
    ) -> Result<Vec<DayBucket>, StoreError> {
        let events = self.activity.get_all_activity(user_id).await?;
        Ok(plays_over_time(&events, filter))
    }

    pub async fn top_tracks(&self, user_id: &str, limit: usize) -> Result<Vec<PlayCount>, StoreError> {
        let events = self.activity.get_all_activity(user_id).await?;
        Ok(top_tracks(&events, limit))
    }

    pub async fn top_artists(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<PlayCount>, StoreError> {
        let events = self.activity.get_all_activity(user_id).await?;
        Ok(top_artists(&events, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{artist, at, track};

    fn event(track_id: &str, artist_ids: &str, played_at: DateTime<Utc>, duration_ms: i64) -> ActivityEvent {
        ActivityEvent {
            user_id: "u1".to_string(),
            track_id: track_id.to_string(),
            played_at,
            duration_ms,
            context: None,
            context_id: None,
            artist_ids: artist_ids.to_string(),
        }
    }

    #[test]
    fn two_minutes_of_milliseconds() {
        assert_eq!(minutes_from_ms(120_000), 2.0);
        let events = vec![event("t1", "a1", at(1, 1), 60_000), event("t2", "a1", at(1, 2), 60_000)];
        assert_eq!(total_minutes(&events), 2.0);
    }

    #[test]
    fn oversized_window_covers_all_history() {
        let now = at(10, 0);
        assert_eq!(window_start(3, now), Some(at(7, 0)));
        assert_eq!(window_start(0, now), Some(now));
        assert_eq!(window_start(u32::MAX, now), None);
        assert_eq!(window_start(100_000, now), None);
    }

    #[test]
    fn unknown_track_scores_default() {
        let events = vec![event("t1", "a1", at(1, 1), 60_000)];
        assert_eq!(underground_score(&events, &HashMap::new()), 50.0);
    }

    #[test]
    fn underground_score_weights_by_listening_time() {
        let events = vec![
            event("mainstream", "a1", at(1, 1), 180_000),
            event("obscure", "a2", at(1, 2), 60_000),
        ];
        let tracks: HashMap<String, TrackMetadata> = [
            ("mainstream".to_string(), track("mainstream", &["a1"], Some(100))),
            ("obscure".to_string(), track("obscure", &["a2"], Some(0))),
        ]
        .into_iter()
        .collect();
        // 0 * 3 minutes + 100 * 1 minute over 4 minutes
        assert_eq!(underground_score(&events, &tracks), 25.0);
        assert_eq!(underground_score(&[], &tracks), 0.0);
    }

    #[test]
    fn genre_tail_folds_into_other() {
        let mut events = Vec::new();
        let mut artists = HashMap::new();
        for i in 0..21 {
            let artist_id = format!("a{i}");
            artists.insert(artist_id.clone(), artist(&artist_id, &[&format!("genre {i:02}")]));
            // genre 00 gets the most plays, genre 20 the fewest
            for _ in 0..(30 - i) {
                events.push(event(&format!("t{i}"), &artist_id, at(1, 1), 1000));
            }
        }
        events.push(event("t-nogenre", "unknown", at(1, 1), 1000));

        let slices = genre_distribution(&events, &artists);

        assert_eq!(slices.len(), MAX_NAMED_GENRES + 1);
        assert_eq!(slices[0].genre, "genre 00");
        assert_eq!(slices[0].plays, 30);
        let other = slices.last().unwrap();
        assert_eq!(other.genre, OTHER_GENRE);
        assert_eq!(other.plays, 11 + 10);
        assert_eq!(other.top_track.as_ref().unwrap().track_id, "t19");
    }

    #[test]
    fn genre_uses_first_artist_only() {
        let artists: HashMap<String, ArtistMetadata> = [
            ("a1".to_string(), artist("a1", &["jazz", "bebop"])),
            ("a2".to_string(), artist("a2", &["metal"])),
        ]
        .into_iter()
        .collect();
        let events = vec![
            event("t1", "a1,a2", at(1, 1), 1000),
            event("t1", "a1", at(1, 2), 1000),
            event("t2", "a1", at(1, 3), 1000),
        ];

        let slices = genre_distribution(&events, &artists);

        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].genre, "jazz");
        assert_eq!(slices[0].plays, 3);
        assert_eq!(
            slices[0].top_track,
            Some(TopTrackInGenre {
                track_id: "t1".to_string(),
                plays: 2
            })
        );
    }

    #[test]
    fn histogram_bins_are_fifteen_seconds() {
        let events = vec![
            event("t1", "a1", at(1, 1), 200_000),
            event("t2", "a1", at(1, 2), 209_999),
            event("t3", "a1", at(1, 3), 14_000),
        ];
        let bins = duration_histogram(&events);
        assert_eq!(
            bins,
            vec![
                HistogramBin {
                    bin: "0:00-0:15".to_string(),
                    count: 1
                },
                HistogramBin {
                    bin: "3:15-3:30".to_string(),
                    count: 2
                },
            ]
        );
    }

    #[test]
    fn plays_over_time_groups_by_day_with_filter() {
        let events = vec![
            event("t1", "a1", at(1, 1), 60_000),
            event("t1", "a1", at(1, 23), 60_000),
            event("t2", "a2", at(2, 5), 120_000),
        ];

        let all = plays_over_time(&events, &PlayFilter::default());
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].plays, 2);
        assert_eq!(all[0].minutes, 2.0);

        let only_a2 = plays_over_time(
            &events,
            &PlayFilter {
                artist_id: Some("a2".to_string()),
                ..PlayFilter::default()
            },
        );
        assert_eq!(only_a2.len(), 1);
        assert_eq!(only_a2[0].date, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
    }

    #[test]
    fn top_artists_credit_every_artist() {
        let events = vec![
            event("t1", "a1,a2", at(1, 1), 1000),
            event("t2", "a2", at(1, 2), 1000),
            event("t1", "a1,a2", at(1, 3), 1000),
        ];
        let artists = top_artists(&events, 10);
        assert_eq!(artists[0].id, "a2");
        assert_eq!(artists[0].plays, 3);
        assert_eq!(artists[1].plays, 2);

        let tracks = top_tracks(&events, 1);
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].id, "t1");
    }
}

use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;

use crate::errors::StoreError;
use crate::models::User;
use crate::stats::UserStats;
use crate::store::UserStore;

/// Window used when a leaderboard is requested without one.
pub const ALL_TIME_DAYS: u32 = 100_000;

/// Per-user activity queries in flight while building a leaderboard.
const LEADERBOARD_CONCURRENCY: usize = 16;

#[derive(Debug, Clone, Serialize)]
pub struct UserMinutes {
    pub user: User,
    pub minutes: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PercentileData {
    pub rank: usize,
    pub total_users: usize,
    pub percentile: u32,
}

/// Most minutes first; equal minutes fall back to user id so ranks are stable.
pub fn rank_users(mut entries: Vec<UserMinutes>) -> Vec<UserMinutes> {
    entries.sort_by(|a, b| {
        b.minutes
            .total_cmp(&a.minutes)
            .then_with(|| a.user.id.cmp(&b.user.id))
    });
    entries
}

/// Rank 1 is the heaviest listener. A user missing from `ranked` gets the
/// last rank and percentile 100.
pub fn percentile_for(ranked: &[UserMinutes], user_id: &str) -> PercentileData {
    let total_users = ranked.len();
    match ranked.iter().position(|entry| entry.user.id == user_id) {
        Some(index) => {
            let rank = index + 1;
            PercentileData {
                rank,
                total_users,
                percentile: (rank as f64 / total_users as f64 * 100.0).round() as u32,
            }
        }
        None => PercentileData {
            rank: total_users,
            total_users,
            percentile: 100,
        },
    }
}

/// Aggregations across every user. Each call scans the user table and reads
/// every user's window; nothing is cached between calls.
#[derive(Clone)]
pub struct GlobalStats {
    users: Arc<dyn UserStore>,
    stats: UserStats,
}

impl GlobalStats {
    pub fn new(users: Arc<dyn UserStore>, stats: UserStats) -> Self {
        Self { users, stats }
    }

    pub async fn minutes_for_all_users(&self, days_ago: u32) -> Result<Vec<UserMinutes>, StoreError> {
        let users = self.users.scan_all_users().await?;
        let stats = &self.stats;

        let entries: Vec<UserMinutes> = stream::iter(users)
            .map(move |user| async move {
                let minutes = stats.total_minutes_listened(&user.id, Some(days_ago)).await?;
                Ok::<_, StoreError>(UserMinutes { user, minutes })
            })
            .buffer_unordered(LEADERBOARD_CONCURRENCY)
            .try_collect()
            .await?;

        Ok(rank_users(entries))
    }

    pub async fn listening_percentile(
        &self,
        user_id: &str,
        days_ago: u32,
    ) -> Result<PercentileData, StoreError> {
        let ranked = self.minutes_for_all_users(days_ago).await?;
        Ok(percentile_for(&ranked, user_id))
    }

    pub async fn top_users(&self, days_ago: u32, limit: usize) -> Result<Vec<UserMinutes>, StoreError> {
        let mut ranked = self.minutes_for_all_users(days_ago).await?;
        ranked.truncate(limit);
        Ok(ranked)
    }
}

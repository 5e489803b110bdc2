use serde::{Deserialize, Serialize};

use super::tracks::TrackObject;

/// `GET /v1/me/player/recently-played`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentlyPlayedResponse {
    #[serde(default)]
    pub items: Vec<PlayHistoryObject>,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub cursors: Option<Cursors>,
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cursors {
    #[serde(default)]
    pub after: Option<String>,
    #[serde(default)]
    pub before: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayHistoryObject {
    #[serde(default)]
    pub track: Option<TrackObject>,
    pub played_at: String,
    #[serde(default)]
    pub context: Option<Context>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Context {
    #[serde(rename = "type")]
    pub kind: String,
    pub uri: String,
    #[serde(default)]
    pub href: Option<String>,
}

use serde::{Deserialize, Serialize};

use super::common::Image;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimplifiedArtistObject {
    /// Local files have no id.
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimplifiedAlbumObject {
    pub name: String,
    #[serde(default)]
    pub images: Vec<Image>,
    #[serde(default)]
    pub release_date: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackObject {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub artists: Vec<SimplifiedArtistObject>,
    #[serde(default)]
    pub album: Option<SimplifiedAlbumObject>,
    pub duration_ms: u64,
    #[serde(default)]
    pub popularity: Option<u8>,
}

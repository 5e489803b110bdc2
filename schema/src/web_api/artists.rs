use serde::{Deserialize, Serialize};

use super::common::{Followers, Image};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtistObject {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub popularity: Option<u8>,
    #[serde(default)]
    pub followers: Option<Followers>,
    #[serde(default)]
    pub images: Vec<Image>,
}

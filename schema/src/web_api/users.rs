use serde::{Deserialize, Serialize};

use super::common::Image;

/// `GET /v1/me`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivateUserObject {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub images: Vec<Image>,
}

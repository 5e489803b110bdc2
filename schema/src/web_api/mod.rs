pub mod accounts;
pub mod artists;
pub mod common;
pub mod player;
pub mod playlists;
pub mod tracks;
pub mod users;

pub use accounts::{OAuthErrorResponse, TokenResponse};
pub use artists::ArtistObject;
pub use common::{ApiErrorResponse, Followers, Image, Paging};
pub use player::{Context, PlayHistoryObject, RecentlyPlayedResponse};
pub use playlists::SimplifiedPlaylistObject;
pub use tracks::{SimplifiedAlbumObject, SimplifiedArtistObject, TrackObject};
pub use users::PrivateUserObject;

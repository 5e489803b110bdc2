//! Wire types for the Spotify Web API and accounts service.
//!
//! These mirror the JSON documents exactly as the upstream sends them. Nothing
//! here is meant to travel past the client boundary; callers convert into
//! their own domain types right after parsing.

#[cfg(feature = "web_api")]
pub mod web_api;

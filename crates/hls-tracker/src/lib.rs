#![forbid(unsafe_code)]

//! Live HLS playlist tracking.
//!
//! Given the URL of a multivariant playlist, [`HlsPlaylistTracker`] fetches
//! it once, then keeps live snapshots of every referenced media playlist:
//! scheduling reloads (including RFC 8216 §6.2.5 blocking reloads, delta
//! updates and skip directives), detecting ended, stuck and reset streams,
//! and coordinating exclusion and fallback across variants.
//!
//! Playlist parsing and byte transport are consumed through seams
//! ([`PlaylistParserFactory`], [`PlaylistDataSource`]); a reqwest-backed
//! source is provided. Segment download, decryption and rendering are out of
//! scope and live downstream of the snapshots this crate exposes.

pub mod config;
pub mod error;
pub mod events;
pub mod parser;
pub mod playlist;
pub mod policy;
pub mod reconcile;
pub mod source;
pub mod test_utils;
pub mod tracker;

mod bundle;
mod loader;

pub use config::{
    DEFAULT_STUCK_TARGET_DURATION_COEFFICIENT, DEFAULT_USER_AGENT, HttpSourceConfig, TrackerConfig,
};
pub use error::{TrackerError, TrackerResult};
pub use events::{
    ListenerId, LoadEventDispatcher, LoadEventInfo, NullEventDispatcher, PlaylistEventListener,
    PlaylistExclusion, PrimaryPlaylistListener,
};
pub use parser::{ParsedPlaylist, PlaylistParser, PlaylistParserFactory};
pub use playlist::{
    MediaPart, MediaPlaylist, MediaSegment, MultivariantPlaylist, PlaylistType, RenditionReport,
    ServerControl, Variant,
};
pub use policy::{
    DefaultLoadErrorPolicy, FallbackOptions, FallbackSelection, FallbackType, LoadDataType,
    LoadErrorHandlingPolicy, LoadErrorInfo,
};
pub use reconcile::reconcile;
pub use source::{HttpPlaylistSource, LoadRequest, PlaylistDataSource};
pub use tracker::{HlsPlaylistTracker, TrackerBuilder};

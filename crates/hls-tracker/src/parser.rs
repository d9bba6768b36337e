// Parser seam. The tracker never interprets playlist bytes itself; it hands
// them to a parser produced by this factory and consumes the typed result.

use std::sync::Arc;

use url::Url;

use crate::error::TrackerResult;
use crate::playlist::{MediaPlaylist, MultivariantPlaylist};

/// The outcome of parsing playlist bytes.
#[derive(Debug, Clone)]
pub enum ParsedPlaylist {
    Multivariant(Arc<MultivariantPlaylist>),
    Media(Arc<MediaPlaylist>),
}

/// Parses one response body. A parser instance is created per load, so it
/// may carry the context it needs (the multivariant playlist, the previous
/// snapshot for delta-update resolution).
///
/// Failure modes the tracker reacts to specifically:
/// [`TrackerError::MalformedPlaylist`](crate::TrackerError::MalformedPlaylist)
/// and [`TrackerError::DeltaUpdateFailed`](crate::TrackerError::DeltaUpdateFailed)
/// (a server-sent delta that cannot be applied against the previous
/// snapshot, which triggers an immediate full reload).
pub trait PlaylistParser: Send {
    fn parse(&self, request_uri: &Url, bytes: &[u8]) -> TrackerResult<ParsedPlaylist>;
}

/// Creates parsers for the two load shapes the tracker performs.
pub trait PlaylistParserFactory: Send + Sync {
    /// Parser for the bootstrap load, which may yield either playlist kind.
    fn create_initial_parser(&self) -> Box<dyn PlaylistParser>;

    /// Parser for a media playlist reload. `previous` is the bundle's
    /// current snapshot and enables delta-update resolution.
    fn create_media_parser(
        &self,
        multivariant: &Arc<MultivariantPlaylist>,
        previous: Option<&Arc<MediaPlaylist>>,
    ) -> Box<dyn PlaylistParser>;
}

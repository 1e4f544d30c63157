use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::warn;
use url::Url;

use crate::config::{COLLECTION_LIKE, COLLECTION_REPOST};
use crate::error::AggregatorError;
use crate::event::{self, CommitMessage, Event};
use crate::handlers::RefKind;

pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Dials the Jetstream endpoint once. No authentication.
pub async fn connect(url: &str) -> Result<WsStream, AggregatorError> {
    let parsed = Url::parse(url).map_err(|e| AggregatorError::Other(format!("invalid jetstream url: {e}")))?;
    let (stream, _response) = tokio_tungstenite::connect_async(parsed).await?;
    Ok(stream)
}

/// Maps a commit's `collection` to the reference kind it should be dispatched
/// to, or `None` for anything this aggregator doesn't track.
pub fn collection_kind(collection: &str) -> Option<RefKind> {
    match collection {
        COLLECTION_LIKE => Some(RefKind::Like),
        COLLECTION_REPOST => Some(RefKind::Repost),
        _ => None,
    }
}

/// Parses one text frame into a commit message. Returns `None` for anything
/// that isn't a commit (identity/account frames) or that fails to parse;
/// parse errors are logged and swallowed here, never bubbled to the caller.
pub fn parse_commit(data: &str) -> Option<CommitMessage> {
    match event::parse(data) {
        Ok(Event::Commit(msg)) => Some(msg),
        Ok(_) => None,
        Err(e) => {
            warn!(error = %e, "failed to parse jetstream frame");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_kind_maps_known_collections() {
        assert_eq!(collection_kind("app.bsky.feed.like"), Some(RefKind::Like));
        assert_eq!(collection_kind("app.bsky.feed.repost"), Some(RefKind::Repost));
        assert_eq!(collection_kind("app.bsky.feed.post"), None);
    }

    #[test]
    fn parse_commit_extracts_commit_frames_only() {
        let commit = r#"{"did":"did:plc:a","time_us":1,"kind":"commit","commit":{"rev":"r","operation":"create","collection":"app.bsky.feed.like","rkey":"k","record":{"$type":"app.bsky.feed.like","subject":{"uri":"at://did:plc:p/app.bsky.feed.post/r1"}}}}"#;
        assert!(parse_commit(commit).is_some());

        let identity = r#"{"did":"did:plc:a","time_us":1,"kind":"identity","identity":{}}"#;
        assert!(parse_commit(identity).is_none());

        assert!(parse_commit("not json").is_none());
    }
}

//! SSE (Server-Sent Events) stream of cache statistics.
//!
//! Converts the server's stats watch channel into an SSE stream: one
//! `stats` event per published snapshot, starting with the current one.

use axum::response::sse::Event;
use futures::stream::Stream;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;

use crate::server::orchestrator::CacheStats;

/// Convert a stats receiver into an SSE stream.
pub fn stats_to_sse_stream(
    rx: watch::Receiver<CacheStats>,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    WatchStream::new(rx).map(|stats| {
        let data = serde_json::to_string(&stats).unwrap_or_else(|_| "{}".to_string());
        Ok(Event::default().event("stats").data(data))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(items: usize) -> CacheStats {
        CacheStats {
            node_name: "node".to_string(),
            used_bytes: 0,
            capacity_bytes: 100,
            items,
            max_items: 0,
            clients: 0,
            add_tasks: 0,
            get_tasks: 0,
            relays_pending: 0,
            relays_in_flight: 0,
            upstream: None,
        }
    }

    #[tokio::test]
    async fn test_stream_yields_current_then_updates() {
        let (tx, rx) = watch::channel(stats(1));
        let mut stream = Box::pin(stats_to_sse_stream(rx));

        assert!(stream.next().await.unwrap().is_ok());
        tx.send_replace(stats(2));
        assert!(stream.next().await.unwrap().is_ok());

        drop(tx);
        assert!(stream.next().await.is_none());
    }
}

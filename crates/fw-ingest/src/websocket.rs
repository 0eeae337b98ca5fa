//! WebSocket telemetry feed client.
//!
//! Connects to the feed, dispatches every text frame as one message and
//! reconnects with backoff whenever the connection drops. Only an invalid
//! URL or shutdown ends the loop.

use std::future::Future;
use std::pin::Pin;

use futures_util::{Stream, StreamExt};
use thiserror::Error;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

use crate::config::RetryPolicy;
use crate::gateway::Gateway;

#[derive(Debug, Error)]
pub enum WebSocketError {
    #[error("invalid websocket url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: tungstenite::error::UrlError,
    },
}

enum FeedEnd {
    Shutdown,
    Disconnected(String),
}

/// Consumes the feed at `url` until `shutdown` resolves.
pub async fn run_websocket<F>(
    url: &str,
    gateway: &mut Gateway,
    reconnect: &RetryPolicy,
    shutdown: F,
) -> Result<(), WebSocketError>
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut attempt: u32 = 0;

    loop {
        let connected = tokio::select! {
            () = shutdown.as_mut() => return Ok(()),
            result = connect_async(url) => result,
        };

        match connected {
            Ok((mut stream, _response)) => {
                info!(url, "connected to telemetry feed");
                attempt = 0;
                match read_feed(&mut stream, gateway, &mut shutdown).await {
                    FeedEnd::Shutdown => {
                        if let Err(err) = stream.close(None).await {
                            debug!(error = %err, "error closing websocket");
                        }
                        return Ok(());
                    }
                    FeedEnd::Disconnected(reason) => {
                        warn!(url, %reason, "telemetry feed disconnected");
                    }
                }
            }
            Err(tungstenite::Error::Url(source)) => {
                return Err(WebSocketError::InvalidUrl {
                    url: url.to_string(),
                    source,
                });
            }
            Err(err) => warn!(url, error = %err, "failed to connect to telemetry feed"),
        }

        let delay = reconnect.delay_for_attempt(attempt);
        attempt = attempt.saturating_add(1);
        debug!(
            url,
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "reconnecting"
        );
        tokio::select! {
            () = shutdown.as_mut() => return Ok(()),
            () = tokio::time::sleep(delay) => {}
        }
    }
}

async fn read_feed<S, F>(
    stream: &mut S,
    gateway: &mut Gateway,
    shutdown: &mut Pin<&mut F>,
) -> FeedEnd
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    F: Future<Output = ()>,
{
    loop {
        let next = tokio::select! {
            () = shutdown.as_mut() => return FeedEnd::Shutdown,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(Message::Text(text))) => {
                gateway.dispatch_raw(&text).await;
            }
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => {
                    gateway.dispatch_raw(&text).await;
                }
                Err(_) => {
                    warn!("dropping non-UTF-8 binary frame");
                    gateway.record_malformed();
                }
            },
            Some(Ok(Message::Close(frame))) => {
                return FeedEnd::Disconnected(format!("closed by server: {frame:?}"));
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => return FeedEnd::Disconnected(err.to_string()),
            None => return FeedEnd::Disconnected("stream ended".to_string()),
        }
    }
}

//! Feeding newline-delimited JSON through the pipeline.

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::gateway::{Dispatch, Gateway};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FeedSummary {
    pub lines: u64,
    pub malformed: u64,
}

/// Dispatches every non-blank line of `reader` as one message.
pub async fn feed_lines<R>(reader: R, gateway: &mut Gateway) -> std::io::Result<FeedSummary>
where
    R: AsyncBufRead + Unpin,
{
    let mut summary = FeedSummary::default();
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        summary.lines += 1;
        if gateway.dispatch_raw(line).await == Dispatch::Malformed {
            summary.malformed += 1;
        }
    }
    Ok(summary)
}

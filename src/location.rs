//! Location source: the newest raw fix, published on a watch channel.

use std::path::Path;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::io::AsyncBufReadExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::types::LocationFix;

pub struct LocationFeed {
    tx: watch::Sender<Option<LocationFix>>,
}

impl LocationFeed {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    pub fn publish(&self, fix: LocationFix) {
        self.tx.send_replace(Some(fix));
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<LocationFix>> {
        self.tx.subscribe()
    }

    pub fn latest(&self) -> Option<LocationFix> {
        self.tx.borrow().clone()
    }
}

impl Default for LocationFeed {
    fn default() -> Self {
        Self::new()
    }
}

/// Replay a recorded JSON-lines fix file into `feed`, keeping the original
/// spacing between fixes. Each fix is re-stamped with the current time so the
/// age check sees it as fresh. Returns the number of fixes published.
pub async fn replay_fixes(
    path: impl AsRef<Path>,
    feed: &LocationFeed,
    cancel: CancellationToken,
) -> std::io::Result<usize> {
    let file = tokio::fs::File::open(path.as_ref()).await?;
    let mut lines = tokio::io::BufReader::new(file).lines();
    let mut previous: Option<DateTime<Utc>> = None;
    let mut published = 0usize;
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let mut fix: LocationFix = match serde_json::from_str(&line) {
            Ok(fix) => fix,
            Err(e) => {
                warn!("[location] skipping line {}: {}", line_no, e);
                continue;
            }
        };

        if let Some(previous) = previous {
            let gap = (fix.captured_at - previous).to_std().unwrap_or_default();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(gap) => {}
            }
        }
        previous = Some(fix.captured_at);

        fix.captured_at = Utc::now();
        debug!(
            "[location] fix {:.6},{:.6} ±{:.1} m",
            fix.latitude, fix.longitude, fix.accuracy_m
        );
        feed.publish(fix);
        published += 1;
    }

    info!("[location] replay finished, {} fixes", published);
    Ok(published)
}

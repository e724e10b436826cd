//! Cached `Date` header value.
//!
//! Formatting an HTTP date on every response is wasted work; the value only
//! changes once a second. [`DateCache`] keeps the formatted value behind an
//! [`ArcSwap`] that a background task refreshes while the server is serving.
//! A reader that finds the value older than [`MAX_AGE`] refreshes it itself,
//! so the cache stays correct when no refresher runs.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use http::HeaderValue;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub(crate) const REFRESH_INTERVAL: Duration = Duration::from_millis(800);
const MAX_AGE: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub(crate) struct DateCache {
    current: ArcSwap<(Instant, HeaderValue)>,
}

impl DateCache {
    pub(crate) fn new() -> Self {
        Self { current: ArcSwap::from_pointee((Instant::now(), format_now())) }
    }

    pub(crate) fn header_value(&self) -> HeaderValue {
        let current = self.current.load();
        if current.0.elapsed() < MAX_AGE {
            return current.1.clone();
        }
        self.refresh()
    }

    fn refresh(&self) -> HeaderValue {
        let value = format_now();
        self.current.store(Arc::new((Instant::now(), value.clone())));
        value
    }

    /// Refreshes the value every `interval` until `cancel` fires.
    pub(crate) async fn run_refresher(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.refresh();
                }
            }
        }
        debug!("date refresher stopped");
    }
}

fn format_now() -> HeaderValue {
    let mut buf = faf_http_date::get_date_buff_no_key();
    faf_http_date::get_date_no_key(&mut buf);
    HeaderValue::from_bytes(&buf).unwrap_or_else(|_| HeaderValue::from_static("Thu, 01 Jan 1970 00:00:00 GMT"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_looks_like_imf_fixdate() {
        let value = DateCache::new().header_value();
        let text = value.to_str().unwrap();
        assert_eq!(text.len(), 29);
        assert!(text.ends_with(" GMT"));
        assert_eq!(&text[3..5], ", ");
    }

    #[tokio::test]
    async fn refresher_stops_on_cancel() {
        let cache = Arc::new(DateCache::new());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&cache).run_refresher(Duration::from_millis(5), cancel.clone()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        task.await.unwrap();
    }
}

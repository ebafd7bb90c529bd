use std::time::Duration;

use firewatch_fetch::FetchRequest;
use tracing::debug;

use crate::error::Result;
use crate::model::UpstreamIncident;
use crate::upstream::Upstream;

/// One decoded page of upstream records.
#[derive(Debug)]
pub struct Page {
    pub number: u32,
    pub records: Vec<UpstreamIncident>,
}

/// Walks `rel="next"` links until the server stops sending one.
///
/// Every page after the first is preceded by `delay`.
pub struct PageWalker<'a> {
    upstream: &'a Upstream,
    next: Option<FetchRequest>,
    delay: Duration,
    fetched: u32,
}

impl<'a> PageWalker<'a> {
    pub fn new(upstream: &'a Upstream, first: FetchRequest, delay: Duration) -> Self {
        Self {
            upstream,
            next: Some(first),
            delay,
            fetched: 0,
        }
    }

    /// Pages fetched so far.
    pub fn fetched(&self) -> u32 {
        self.fetched
    }

    /// Fetch the next page, or `None` once the last page has been returned.
    pub async fn next_page(&mut self) -> Option<Result<Page>> {
        let req = self.next.take()?;
        if self.fetched > 0 && !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let resp = match self.upstream.send(&req).await {
            Ok(resp) => resp,
            Err(e) => return Some(Err(e)),
        };
        self.fetched += 1;

        let links = resp.links();
        if let Some(next_url) = links.next.as_deref() {
            if next_url == req.url && req.query.is_empty() {
                debug!(url = next_url, "next link points at the current page; stopping");
            } else {
                match self.upstream.follow(next_url) {
                    Ok(next) => self.next = Some(next),
                    Err(e) => return Some(Err(e)),
                }
            }
        }

        let records = match resp.json::<Vec<UpstreamIncident>>() {
            Ok(records) => records,
            Err(e) => return Some(Err(e.into())),
        };
        debug!(
            page = self.fetched,
            records = records.len(),
            has_next = self.next.is_some(),
            "upstream page fetched"
        );
        Some(Ok(Page {
            number: self.fetched,
            records,
        }))
    }

    /// Drain every remaining page into one list.
    pub async fn collect_all(mut self) -> Result<Vec<UpstreamIncident>> {
        let mut all = Vec::new();
        while let Some(page) = self.next_page().await {
            all.extend(page?.records);
        }
        Ok(all)
    }
}

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;
use async_trait::async_trait;
use parking_lot::RwLock;

use surge_core::{CancelSignal, GroupTree, HttpClient, Options, Runner, Vu};
use surge_metrics::{Registry, Sample, SampleTags};

use super::HttpMetricIds;

/// The trivial runner: one GET of the target URL per iteration.
pub struct UrlRunner {
    url: Arc<str>,
    groups: Arc<GroupTree>,
    client: RwLock<Arc<HttpClient>>,
    ids: HttpMetricIds,
}

impl UrlRunner {
    pub fn new(url: &str, registry: &Registry) -> anyhow::Result<Self> {
        let parsed = url::Url::parse(url).context("failed to parse URL")?;
        anyhow::ensure!(
            matches!(parsed.scheme(), "http" | "https"),
            "unsupported URL scheme `{}` (expected http or https)",
            parsed.scheme()
        );

        Ok(Self {
            url: Arc::from(url),
            groups: Arc::new(GroupTree::default()),
            client: RwLock::new(Arc::new(HttpClient::default())),
            ids: HttpMetricIds::register(registry),
        })
    }
}

impl Runner for UrlRunner {
    fn options(&self) -> Options {
        Options::default()
    }

    fn apply_options(&self, options: &Options) -> anyhow::Result<()> {
        if let Some(max_redirects) = options.max_redirects.value {
            *self.client.write() = Arc::new(HttpClient::with_max_redirects(max_redirects as usize));
        }
        Ok(())
    }

    fn groups(&self) -> Arc<GroupTree> {
        self.groups.clone()
    }

    fn new_vu(&self) -> anyhow::Result<Box<dyn Vu>> {
        Ok(Box::new(UrlVu {
            url: self.url.clone(),
            client: self.client.read().clone(),
            ids: self.ids,
        }))
    }
}

struct UrlVu {
    url: Arc<str>,
    client: Arc<HttpClient>,
    ids: HttpMetricIds,
}

#[async_trait]
impl Vu for UrlVu {
    fn reconfigure(&mut self, _id: u64) -> anyhow::Result<()> {
        // Stateless; every user issues the same request.
        Ok(())
    }

    async fn run_once(&mut self, _cancel: &CancelSignal) -> anyhow::Result<Vec<Sample>> {
        let started = Instant::now();
        let response = self
            .client
            .get(&self.url)
            .await
            .with_context(|| format!("GET {} failed", self.url))?;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1e3;

        let tags: SampleTags = vec![
            (Arc::from("url"), self.url.clone()),
            (Arc::from("method"), Arc::from("GET")),
            (Arc::from("status"), Arc::from(response.status.to_string())),
        ];

        let failed = if response.status >= 400 { 1.0 } else { 0.0 };
        Ok(vec![
            Sample::with_tags(self.ids.reqs, 1.0, tags.clone()),
            Sample::with_tags(self.ids.duration, elapsed_ms, tags.clone()),
            Sample::with_tags(self.ids.failed, failed, tags),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_http_targets() {
        let registry = Registry::default();
        assert!(UrlRunner::new("ftp://example.test/", &registry).is_err());
        assert!(UrlRunner::new("not a url", &registry).is_err());
    }

    #[test]
    fn registers_the_http_metrics() {
        let registry = Registry::default();
        let _runner = UrlRunner::new("http://localhost:8080/", &registry).expect("runner builds");
        assert!(registry.lookup("http_reqs").is_some());
        assert!(registry.lookup("http_req_duration").is_some());
        assert!(registry.lookup("http_req_failed").is_some());
    }
}

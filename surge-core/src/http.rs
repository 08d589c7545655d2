use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::Request;
use hyper::body::Incoming;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("unsupported url scheme (expected http or https): {0}")]
    UnsupportedScheme(String),

    #[error("http request build failed: {0}")]
    RequestBuild(#[from] http::Error),

    #[error("http request failed: {0}")]
    Request(#[from] hyper_util::client::legacy::Error),

    #[error("http request timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to read response body: {0}")]
    BodyRead(#[from] hyper::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn body_utf8(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: http::Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn get(url: &str) -> Self {
        Self {
            method: http::Method::GET,
            url: url.to_string(),
            headers: Vec::new(),
            body: Bytes::new(),
            timeout: None,
        }
    }

    pub fn post(url: &str, body: Bytes) -> Self {
        Self {
            method: http::Method::POST,
            url: url.to_string(),
            headers: Vec::new(),
            body,
            timeout: None,
        }
    }
}

/// Shared HTTP/1.1 client for runners and collectors.
///
/// Redirects are followed up to `max_redirects`; past the cap the last 3xx
/// response is returned as-is.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    max_redirects: usize,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::with_max_redirects(10)
    }
}

impl HttpClient {
    pub fn with_max_redirects(max_redirects: usize) -> Self {
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();

        let inner = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            inner,
            max_redirects,
        }
    }

    pub async fn get(&self, url: &str) -> Result<HttpResponse> {
        self.request(HttpRequest::get(url)).await
    }

    pub async fn request(&self, req: HttpRequest) -> Result<HttpResponse> {
        let mut url = validate_url(&req.url)?;
        let mut redirects = 0usize;

        loop {
            let uri: hyper::Uri = url
                .as_str()
                .parse()
                .map_err(|_| Error::InvalidUrl(url.to_string()))?;

            let mut builder = Request::builder().method(req.method.clone()).uri(uri);
            for (k, v) in &req.headers {
                builder = builder.header(k.as_str(), v.as_str());
            }
            let request: Request<Full<Bytes>> = builder.body(Full::new(req.body.clone()))?;

            let res: hyper::Response<Incoming> = if let Some(timeout) = req.timeout {
                match tokio::time::timeout(timeout, self.inner.request(request)).await {
                    Ok(res) => res?,
                    Err(_) => return Err(Error::Timeout(timeout)),
                }
            } else {
                self.inner.request(request).await?
            };

            let status = res.status();
            if status.is_redirection() && redirects < self.max_redirects {
                if let Some(next) = redirect_target(&url, res.headers()) {
                    redirects += 1;
                    url = next;
                    continue;
                }
            }

            let (parts, body) = res.into_parts();
            let body = body.collect().await?.to_bytes();

            return Ok(HttpResponse {
                status: parts.status.as_u16(),
                body,
            });
        }
    }
}

fn validate_url(raw: &str) -> Result<url::Url> {
    let parsed = url::Url::parse(raw.trim()).map_err(|_| Error::InvalidUrl(raw.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        _ => Err(Error::UnsupportedScheme(raw.to_string())),
    }
}

/// Resolve the Location header against the current URL; relative targets
/// are joined, cross-scheme targets outside http(s) are ignored.
fn redirect_target(current: &url::Url, headers: &http::HeaderMap) -> Option<url::Url> {
    let location = headers.get(http::header::LOCATION)?.to_str().ok()?;
    let next = current.join(location).ok()?;
    matches!(next.scheme(), "http" | "https").then_some(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_accepts_http_and_https() {
        assert!(validate_url("http://localhost:8080/").is_ok());
        assert!(validate_url(" https://example.test/x ").is_ok());
        assert!(matches!(
            validate_url("ftp://example.test/"),
            Err(Error::UnsupportedScheme(_))
        ));
        assert!(matches!(
            validate_url("not a url"),
            Err(Error::InvalidUrl(_))
        ));
    }

    #[test]
    fn redirect_target_joins_relative_locations() {
        let current = url::Url::parse("http://example.test/a/b").unwrap();
        let mut headers = http::HeaderMap::new();
        headers.insert(http::header::LOCATION, "/c".parse().unwrap());

        let next = redirect_target(&current, &headers).expect("target");
        assert_eq!(next.as_str(), "http://example.test/c");
    }

    #[test]
    fn redirect_target_ignores_non_http_schemes() {
        let current = url::Url::parse("http://example.test/").unwrap();
        let mut headers = http::HeaderMap::new();
        headers.insert(http::header::LOCATION, "ftp://example.test/".parse().unwrap());

        assert!(redirect_target(&current, &headers).is_none());
    }
}

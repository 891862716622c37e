//! Tarball download.

use crate::error::{ErrorKind, Result};
use async_trait::async_trait;
use exn::ResultExt;
use url::Url;

/// Somewhere tarballs can be downloaded from.
#[async_trait]
pub trait TarballSource: Send + Sync {
    /// Download the tarball at `url`. Any non-2xx response is an error.
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>>;
}

/// [`TarballSource`] over plain HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpTarballSource {
    client: reqwest::Client,
}
impl HttpTarballSource {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TarballSource for HttpTarballSource {
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>> {
        let response =
            self.client.get(url.clone()).send().await.or_raise(|| ErrorKind::Transport(url.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            exn::bail!(ErrorKind::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let bytes = response.bytes().await.or_raise(|| ErrorKind::Transport(url.to_string()))?;
        tracing::debug!(url = %url, bytes = bytes.len(), "Downloaded tarball");
        Ok(bytes.to_vec())
    }
}

#[cfg(feature = "mock")]
pub use self::mock::MockTarballSource;

#[cfg(feature = "mock")]
mod mock {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    /// In-memory tarball source for testing. Unknown URLs answer 404.
    #[derive(Default)]
    pub struct MockTarballSource {
        tarballs: HashMap<String, Vec<u8>>,
        fetched: Mutex<Vec<String>>,
    }

    impl MockTarballSource {
        pub fn with_tarballs(tarballs: impl IntoIterator<Item = (impl Into<String>, impl Into<Vec<u8>>)>) -> Self {
            Self {
                tarballs: tarballs.into_iter().map(|(url, data)| (url.into(), data.into())).collect(),
                fetched: Mutex::new(Vec::new()),
            }
        }

        /// Every URL requested so far, in order.
        pub async fn fetched(&self) -> Vec<String> {
            self.fetched.lock().await.clone()
        }
    }

    #[async_trait]
    impl TarballSource for MockTarballSource {
        async fn fetch(&self, url: &Url) -> Result<Vec<u8>> {
            self.fetched.lock().await.push(url.to_string());
            match self.tarballs.get(url.as_str()) {
                Some(data) => Ok(data.clone()),
                None => exn::bail!(ErrorKind::Status {
                    status: 404,
                    url: url.to_string(),
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/foo/-/foo-1.0.0.tgz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"\x1f\x8bdata".to_vec()))
            .mount(&server)
            .await;
        let source = HttpTarballSource::new(reqwest::Client::new());
        let url = Url::parse(&format!("{}/foo/-/foo-1.0.0.tgz", server.uri())).unwrap();
        assert_eq!(source.fetch(&url).await.unwrap(), b"\x1f\x8bdata");
    }

    #[tokio::test]
    async fn test_not_found_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).respond_with(ResponseTemplate::new(404)).mount(&server).await;
        let source = HttpTarballSource::new(reqwest::Client::new());
        let url = Url::parse(&format!("{}/missing.tgz", server.uri())).unwrap();
        let err = source.fetch(&url).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Status { status: 404, .. }));
    }
}

//! Fragment download seam.

use std::future::Future;

use bytes::Bytes;

use crate::error::CdaiResult;
use crate::util::http::HttpClient;

/// One fetched fragment, as reported by the transport.
///
/// `bitrate` is populated by transports that know the served profile (a
/// recording relay stamps it on the response); plain CDN fetches leave it
/// `None` and the pipeline keeps its assumed bandwidth.
pub struct FetchOutcome {
    pub data: Bytes,
    pub effective_url: String,
    pub http_code: u16,
    pub download_time: f64,
    pub bitrate: Option<u64>,
}

pub trait FragmentFetcher: Send + Sync {
    fn fetch(
        &self,
        url: &str,
        range: Option<&str>,
    ) -> impl Future<Output = CdaiResult<FetchOutcome>> + Send;
}

/// Plain HTTP transport over the shared [`HttpClient`].
pub struct HttpFetcher {
    client: HttpClient,
}

impl HttpFetcher {
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }
}

impl FragmentFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, range: Option<&str>) -> CdaiResult<FetchOutcome> {
        let started = std::time::Instant::now();
        let response = self.client.get_data(url, range).await?;
        Ok(FetchOutcome {
            data: response.data,
            effective_url: response.effective_url,
            http_code: response.status.as_u16(),
            download_time: started.elapsed().as_secs_f64(),
            bitrate: None,
        })
    }
}

use std::{ops::Deref, sync::Arc};

use bytes::Bytes;
use reqwest::{header::RANGE, Client, ClientBuilder, IntoUrl, StatusCode};
use reqwest_cookie_store::{CookieStore, CookieStoreMutex};

use crate::error::{CdaiError, CdaiResult};

/// Shared HTTP client with a cookie store. Ad decision services and
/// relay caches commonly track sessions through cookies, so the store is
/// shared across manifest and fragment requests.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    cookies_store: Arc<CookieStoreMutex>,
}

/// A completed download, together with the URL it was actually served
/// from after redirects.
pub struct HttpResponseData {
    pub data: Bytes,
    pub effective_url: String,
    pub status: StatusCode,
}

impl HttpClient {
    pub fn new(builder: ClientBuilder) -> Self {
        let cookies_store = Arc::new(CookieStoreMutex::new(CookieStore::default()));
        let client = builder
            .cookie_provider(cookies_store.clone())
            .build()
            .unwrap();

        Self {
            client,
            cookies_store,
        }
    }

    pub fn add_cookies(&self, cookies: Vec<String>, url: impl IntoUrl) {
        let url = url.into_url().unwrap();
        let mut lock = self.cookies_store.lock().unwrap();
        for cookie in cookies {
            _ = lock.parse(&cookie, &url);
        }
    }

    /// Download a resource fully into memory, optionally with a byte range.
    ///
    /// Non-2xx statuses other than 204 are reported as [`CdaiError::HttpError`];
    /// 204 is surfaced to the caller since the relay uses it as a signal.
    pub async fn get_data(
        &self,
        url: impl IntoUrl,
        range: Option<&str>,
    ) -> CdaiResult<HttpResponseData> {
        let mut request = self.client.get(url);
        if let Some(range) = range {
            request = request.header(RANGE, range);
        }
        let response = request.send().await?;
        let status = response.status();
        let effective_url = response.url().to_string();
        if !status.is_success() {
            return Err(CdaiError::HttpError(status));
        }
        let data = response.bytes().await?;
        Ok(HttpResponseData {
            data,
            effective_url,
            status,
        })
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new(Client::builder())
    }
}

impl Deref for HttpClient {
    type Target = Client;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

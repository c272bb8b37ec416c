//! Remote endpoints and the blocking network primitives behind downloads.
//!
//! Network I/O runs on short-lived background threads; the scheduler thread
//! only polls for completion.

use std::{cell::Cell, io::Read, sync::Arc, thread, time::Duration};

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, TryRecvError};
use log::debug;
use reqwest::{blocking::Client, header::RANGE, StatusCode};
use url::Url;

use crate::error::{Error, Result};

/// Primary and fallback base URLs. Successive requests alternate between them.
#[derive(Debug)]
pub struct RemoteServices {
    primary: Url,
    fallback: Url,
    requests: Cell<u64>,
}

impl RemoteServices {
    pub fn new(primary: Url, fallback: Option<Url>) -> Self {
        let fallback = fallback.unwrap_or_else(|| primary.clone());
        Self {
            primary,
            fallback,
            requests: Cell::new(0),
        }
    }

    /// URL of `file_name` on the next server in rotation
    pub fn next_url(&self, file_name: &str) -> Result<Url> {
        let request = self.requests.get();
        self.requests.set(request + 1);
        let base = if request % 2 == 0 {
            &self.primary
        } else {
            &self.fallback
        };
        base.join(file_name).map_err(|e| Error::Http {
            url: format!("{base}{file_name}"),
            message: e.to_string(),
        })
    }
}

pub struct FetchResponse {
    /// The server honoured the requested range
    pub partial: bool,
    pub body: Box<dyn Read + Send>,
}

impl FetchResponse {
    pub fn into_bytes(mut self, url: &Url) -> Result<Bytes> {
        let mut buf = Vec::new();
        self.body.read_to_end(&mut buf).map_err(|e| Error::Http {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        Ok(Bytes::from(buf))
    }
}

/// Source of remote files. Implementations are called from background threads.
pub trait Fetcher: Send + Sync {
    /// Fetch `url`, starting at byte `offset` when it is non-zero
    fn fetch(&self, url: &Url, offset: u64, timeout: Duration) -> Result<FetchResponse>;
}

pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        // Short timeout for initial connection, the transfer timeout is per request
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(None)
            .build()
            .map_err(|e| Error::Http {
                url: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self { client })
    }
}

fn http_error(url: &Url, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout {
            url: url.to_string(),
        }
    } else {
        Error::Http {
            url: url.to_string(),
            message: e.to_string(),
        }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &Url, offset: u64, timeout: Duration) -> Result<FetchResponse> {
        let mut request = self.client.get(url.clone()).timeout(timeout);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        let response = request
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| http_error(url, e))?;

        Ok(FetchResponse {
            partial: response.status() == StatusCode::PARTIAL_CONTENT,
            body: Box::new(response),
        })
    }
}

/// Whole-body GET running on a background thread
pub struct WebRequest {
    url: Url,
    rx: Option<Receiver<Result<Bytes>>>,
    result: Option<Result<Bytes>>,
}

impl WebRequest {
    pub fn get(fetcher: Arc<dyn Fetcher>, url: Url, timeout: Duration) -> Self {
        let (tx, rx) = bounded(1);
        let thread_url = url.clone();
        let spawned = thread::Builder::new()
            .name("web-request".to_string())
            .spawn(move || {
                let result = fetcher
                    .fetch(&thread_url, 0, timeout)
                    .and_then(|response| response.into_bytes(&thread_url));
                // The request may have been dropped, nobody is listening then
                let _ = tx.send(result);
            });

        match spawned {
            Ok(_) => Self {
                url,
                rx: Some(rx),
                result: None,
            },
            Err(e) => Self {
                url: url.clone(),
                rx: None,
                result: Some(Err(Error::Http {
                    url: url.to_string(),
                    message: format!("Failed to spawn request thread: {e}"),
                })),
            },
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Non-blocking completion check
    pub fn poll(&mut self) -> bool {
        if self.result.is_some() {
            return true;
        }
        let Some(rx) = &self.rx else {
            return true;
        };
        match rx.try_recv() {
            Ok(result) => {
                debug!("Request finished: {}", self.url);
                self.result = Some(result);
                true
            }
            Err(TryRecvError::Empty) => false,
            Err(TryRecvError::Disconnected) => {
                self.result = Some(Err(Error::Http {
                    url: self.url.to_string(),
                    message: "Request thread exited without a result".to_string(),
                }));
                true
            }
        }
    }

    /// Result of a finished request, `None` while still running
    pub fn take_result(&mut self) -> Option<Result<Bytes>> {
        if self.poll() {
            self.result.take()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemoryFetcher;

    #[test]
    fn requests_alternate_between_servers() {
        let remote = RemoteServices::new(
            Url::parse("https://primary.example.com/pkg/").unwrap(),
            Some(Url::parse("https://fallback.example.com/pkg/").unwrap()),
        );
        let hosts: Vec<_> = (0..4)
            .map(|_| remote.next_url("a.bundle").unwrap())
            .map(|u| u.host_str().unwrap().to_string())
            .collect();
        assert_eq!(
            hosts,
            vec![
                "primary.example.com",
                "fallback.example.com",
                "primary.example.com",
                "fallback.example.com"
            ]
        );
    }

    #[test]
    fn web_request_completes_in_background() {
        let fetcher = Arc::new(MemoryFetcher::default());
        fetcher.insert("main.version", b"v2".to_vec());
        let url = Url::parse("https://cdn.example.com/main.version").unwrap();
        let mut request = WebRequest::get(fetcher, url, Duration::from_secs(1));

        let result = loop {
            if let Some(result) = request.take_result() {
                break result;
            }
            thread::sleep(Duration::from_millis(1));
        };
        assert_eq!(result.unwrap().as_ref(), b"v2");
    }
}

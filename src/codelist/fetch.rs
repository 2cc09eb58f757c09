use qu::ick_use::*;
use std::{
    thread,
    time::{Duration, Instant},
};

/// The result of fetching a remote resource. None of these are errors: callers decide whether a
/// missing resource matters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched {
    Body(Vec<u8>),
    RateLimited,
    Failed(String),
}

pub trait Fetch {
    fn fetch(&mut self, url: &str) -> Fetched;
}

impl<F: Fetch + ?Sized> Fetch for Box<F> {
    fn fetch(&mut self, url: &str) -> Fetched {
        (**self).fetch(url)
    }
}

/// Fetches over HTTP(S).
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .context("building http client")?;
        Ok(HttpFetcher { client })
    }
}

impl Fetch for HttpFetcher {
    fn fetch(&mut self, url: &str) -> Fetched {
        let response = match self.client.get(url).send() {
            Ok(response) => response,
            Err(e) => return Fetched::Failed(e.to_string()),
        };
        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Fetched::RateLimited;
        }
        if !status.is_success() {
            return Fetched::Failed(format!("HTTP {}", status));
        }
        match response.bytes() {
            Ok(body) => Fetched::Body(body.to_vec()),
            Err(e) => Fetched::Failed(e.to_string()),
        }
    }
}

/// Spaces out calls to another fetcher, and retries once after a pause if the remote reports we
/// are going too fast.
pub struct RateLimited<F> {
    inner: F,
    delay: Duration,
    backoff: Duration,
    last_call: Option<Instant>,
}

impl<F: Fetch> RateLimited<F> {
    pub fn new(inner: F, delay: Duration, backoff: Duration) -> Self {
        RateLimited {
            inner,
            delay,
            backoff,
            last_call: None,
        }
    }

    pub fn into_inner(self) -> F {
        self.inner
    }

    fn wait_turn(&mut self) {
        if let Some(last) = self.last_call {
            let elapsed = last.elapsed();
            if elapsed < self.delay {
                thread::sleep(self.delay - elapsed);
            }
        }
        self.last_call = Some(Instant::now());
    }
}

impl<F: Fetch> Fetch for RateLimited<F> {
    fn fetch(&mut self, url: &str) -> Fetched {
        self.wait_turn();
        match self.inner.fetch(url) {
            Fetched::RateLimited => {
                event!(
                    Level::WARN,
                    "rate limited fetching {}, waiting {:?} before retrying",
                    url,
                    self.backoff
                );
                thread::sleep(self.backoff);
                self.last_call = Some(Instant::now());
                self.inner.fetch(url)
            }
            other => other,
        }
    }
}

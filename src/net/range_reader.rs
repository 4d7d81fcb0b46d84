//! A sequential HTTPS object-storage reader that tolerates mid-stream truncation by reopening
//! with a `Range` header at the last acknowledged offset.
//!
//! The blocking HTTP work (`ureq`) always runs on a [`FiberQueueThreadPool`] worker, never on a
//! reactor thread; [`RangeReader::read`] is the only method a fiber actually suspends on.

use std::io::Read;
use std::sync::{Arc, Mutex as StdMutex};

use crate::error::{Error, Result};
use crate::threadpool::FiberQueueThreadPool;

/// Supplies the bearer token used to authenticate against the object store. Implementations are
/// expected to cache and refresh the token themselves; this crate only calls `token()` once per
/// request attempt.
pub trait TokenProvider: Send + Sync {
    fn token(&self) -> Result<String>;
}

/// A [`TokenProvider`] that always returns the same token, useful for tests and for stores that
/// don't require authentication.
pub struct StaticToken(pub String);

impl TokenProvider for StaticToken {
    fn token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Configuration for [`RangeReader`].
#[derive(Clone)]
pub struct RangeReaderConfig {
    /// Object store API root, e.g. `https://storage.googleapis.com`.
    pub base_url: String,
    pub bucket: String,
    pub object: String,
    /// Bounded retries for transient auth/transport errors when (re)opening the stream.
    pub max_retries: u32,
}

impl RangeReaderConfig {
    pub fn new(base_url: impl Into<String>, bucket: impl Into<String>, object: impl Into<String>) -> Self {
        RangeReaderConfig {
            base_url: base_url.into(),
            bucket: bucket.into(),
            object: object.into(),
            max_retries: 3,
        }
    }
}

struct State {
    reader: Option<Box<dyn Read + Send + Sync>>,
    offset: u64,
    size: Option<u64>,
    done: bool,
}

/// A sequential reader over a single object store body. Reads must be offered contiguous
/// offsets; see [`RangeReader::read`].
pub struct RangeReader {
    pool: Arc<FiberQueueThreadPool>,
    agent: ureq::Agent,
    url: String,
    token_provider: Arc<dyn TokenProvider>,
    max_retries: u32,
    state: StdMutex<State>,
}

impl RangeReader {
    pub fn new(
        pool: Arc<FiberQueueThreadPool>,
        config: RangeReaderConfig,
        token_provider: Arc<dyn TokenProvider>,
    ) -> Result<Self> {
        let url = build_url(&config.base_url, &config.bucket, &config.object)?;
        Ok(RangeReader {
            pool,
            agent: ureq::AgentBuilder::new().build(),
            url,
            token_provider,
            max_retries: config.max_retries.max(1),
            state: StdMutex::new(State {
                reader: None,
                offset: 0,
                size: None,
                done: false,
            }),
        })
    }

    /// The byte offset the next [`RangeReader::read`] must be called with.
    pub fn current_offset(&self) -> u64 {
        self.state.lock().unwrap().offset
    }

    /// Object length, once known from a response's `Content-Length` header. `None` until the
    /// first successful open, and permanently `None` if the store never sends the header; in
    /// that case reads simply continue until the transport reports EOF.
    pub fn size(&self) -> Option<u64> {
        self.state.lock().unwrap().size
    }

    /// Reads up to `buf.len()` bytes starting at `offset`, which must equal
    /// [`RangeReader::current_offset`]. Returns `Ok(0)` at end of stream.
    pub async fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        {
            let state = self.state.lock().unwrap();
            if offset != state.offset {
                return Err(Error::InvalidArgument(format!(
                    "RangeReader::read called at offset {offset}, current offset is {}",
                    state.offset
                )));
            }
            if state.done {
                return Ok(0);
            }
        }

        if self.state.lock().unwrap().reader.is_none() {
            self.open().await?;
        }

        loop {
            let reader = self
                .state
                .lock()
                .unwrap()
                .reader
                .take()
                .ok_or_else(|| Error::internal("RangeReader read invoked with no open reader"))?;

            let want = buf.len();
            let mut tmp = vec![0u8; want];
            let (reader, outcome) = self
                .pool
                .await_(move || {
                    let mut reader = reader;
                    let result = reader.read(&mut tmp[..want]);
                    (reader, result.map(|n| (n, tmp)))
                })
                .await;

            match outcome {
                Ok((0, _)) => {
                    let mut state = self.state.lock().unwrap();
                    state.done = true;
                    state.reader = None;
                    return Ok(0);
                }
                Ok((n, tmp)) => {
                    buf[..n].copy_from_slice(&tmp[..n]);
                    let mut state = self.state.lock().unwrap();
                    state.offset += n as u64;
                    state.reader = Some(reader);
                    return Ok(n);
                }
                Err(e) if is_resumable(&e) => {
                    log::warn!(
                        "range reader: resumable error at offset {}, reopening: {e}",
                        self.state.lock().unwrap().offset
                    );
                    self.reopen().await?;
                }
                Err(e) => {
                    self.state.lock().unwrap().reader = None;
                    return Err(Error::Transport(e));
                }
            }
        }
    }

    async fn open(&self) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let agent = self.agent.clone();
            let url = self.url.clone();
            let offset = self.state.lock().unwrap().offset;
            let token = self.token_provider.token()?;

            let result = self
                .pool
                .await_(move || -> std::result::Result<(Box<dyn Read + Send + Sync>, Option<u64>), ureq::Error> {
                    let mut req = agent.get(&url).set("Authorization", &format!("Bearer {token}"));
                    if offset > 0 {
                        req = req.set("Range", &format!("bytes={offset}-"));
                    }
                    let resp = req.call()?;
                    let size = resp
                        .header("Content-Length")
                        .and_then(|s| s.parse::<u64>().ok())
                        .map(|len| offset + len);
                    Ok((resp.into_reader(), size))
                })
                .await;

            match result {
                Ok((reader, size)) => {
                    let mut state = self.state.lock().unwrap();
                    state.reader = Some(reader);
                    state.size = size;
                    return Ok(());
                }
                Err(e) if attempt < self.max_retries => {
                    log::warn!("range reader: open attempt {attempt} failed, retrying: {e}");
                }
                Err(e) => return Err(Error::from(e)),
            }
        }
    }

    async fn reopen(&self) -> Result<()> {
        self.state.lock().unwrap().reader = None;
        self.open().await
    }
}

impl Drop for RangeReader {
    fn drop(&mut self) {
        let state = self.state.lock().unwrap();
        if !state.done && state.reader.is_some() {
            log::debug!(
                "range reader for {} dropped mid-body at offset {}; releasing handle without draining",
                self.url,
                state.offset
            );
        }
    }
}

fn is_resumable(e: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(e.kind(), UnexpectedEof | ConnectionReset | ConnectionAborted | BrokenPipe)
}

fn build_url(base_url: &str, bucket: &str, object: &str) -> Result<String> {
    let mut url = url::Url::parse(base_url).map_err(|e| Error::InvalidArgument(e.to_string()))?;
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| Error::InvalidArgument("base_url cannot be a base URL".into()))?;
        segments.push("storage").push("v1").push("b").push(bucket).push("o").push(object);
    }
    url.query_pairs_mut().append_pair("alt", "media");
    Ok(url.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_url_percent_encodes_object_path() {
        let url = build_url(
            "https://storage.googleapis.com",
            "my-bucket",
            "path/to object.txt",
        )
        .unwrap();
        assert!(url.starts_with("https://storage.googleapis.com/storage/v1/b/my-bucket/o/"));
        assert!(url.contains("alt=media"));
        assert!(!url.contains(' '));
    }

    #[test]
    fn is_resumable_classifies_truncation_errors() {
        let truncated = std::io::Error::from(std::io::ErrorKind::UnexpectedEof);
        let other = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert!(is_resumable(&truncated));
        assert!(!is_resumable(&other));
    }
}

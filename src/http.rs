//! HTTP execution layer.
//!
//! Wraps a pooled `reqwest::Client` with the behavior every caller needs:
//! bounded retry on transient failures, fixed inter-request wait, ranged
//! requests, streaming writes with resume, a low-speed abort and an
//! optional download rate cap.
//!
//! Retry policy: timeouts, connection failures, stalled transfers and
//! HTTP 429/5xx retry in place up to the configured limit with the
//! configured wait between attempts (no exponential backoff). 416 on a
//! range request never retries; the download paths treat it as "already
//! complete". Other 4xx are fatal for the unit.

use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};

use flate2::read::ZlibDecoder;
use thiserror::Error;

use crate::config::HttpConfig;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("HTTP {status} ({url})")]
    Status { status: u16, url: String },
    #[error("transfer stayed below {rate} B/s for {secs}s")]
    LowSpeed { rate: u64, secs: u64 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl HttpError {
    pub fn is_retryable(&self) -> bool {
        match self {
            HttpError::Transport(e) => !(e.is_builder() || e.is_redirect()),
            HttpError::Status { status, .. } => *status == 429 || *status >= 500,
            HttpError::LowSpeed { .. } => true,
            HttpError::Io(_) => false,
            HttpError::Parse(_) => false,
        }
    }

    pub fn is_range_not_satisfiable(&self) -> bool {
        matches!(self, HttpError::Status { status: 416, .. })
    }
}

/// Outcome of a streaming download.
#[derive(Debug, Default)]
pub struct DownloadOutcome {
    pub bytes_written: u64,
    /// Last-Modified of the server copy, unix seconds.
    pub server_mtime: Option<i64>,
    /// True when the server answered 416 to a resume at EOF.
    pub already_complete: bool,
}

#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    conf: HttpConfig,
}

impl HttpClient {
    pub fn new(conf: HttpConfig) -> anyhow::Result<HttpClient> {
        let mut builder = reqwest::Client::builder()
            .user_agent(conf.user_agent.clone())
            .connect_timeout(Duration::from_secs(conf.connect_timeout_secs.max(1)))
            .cookie_store(true)
            .gzip(true)
            .deflate(true);

        if !conf.verify_peer {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if !conf.ca_bundle.is_empty() {
            let pem = std::fs::read(&conf.ca_bundle)?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }

        Ok(HttpClient {
            client: builder.build()?,
            conf,
        })
    }

    pub fn inner(&self) -> &reqwest::Client {
        &self.client
    }

    async fn pre_request_wait(&self) {
        if self.conf.wait_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.conf.wait_ms)).await;
        }
    }

    /// One GET attempt; non-success statuses become `HttpError::Status`.
    async fn get_once(
        &self,
        url: &str,
        bearer: Option<&str>,
        range: Option<(u64, Option<u64>)>,
    ) -> Result<reqwest::Response, HttpError> {
        self.pre_request_wait().await;
        let mut req = self.client.get(url);
        if let Some(token) = bearer {
            req = req.bearer_auth(token);
        }
        if let Some((from, to)) = range {
            let value = match to {
                Some(to) => format!("bytes={}-{}", from, to),
                None => format!("bytes={}-", from),
            };
            req = req.header(reqwest::header::RANGE, value);
        }
        let resp = req.send().await.map_err(HttpError::Transport)?;
        let status = resp.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(HttpError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(resp)
    }

    /// GET into memory with bounded retry.
    pub async fn get_bytes(&self, url: &str, bearer: Option<&str>) -> Result<Vec<u8>, HttpError> {
        let mut attempt = 0u32;
        loop {
            let result = async {
                let resp = self.get_once(url, bearer, None).await?;
                resp.bytes().await.map_err(HttpError::Transport)
            }
            .await;

            match result {
                Ok(bytes) => return Ok(bytes.to_vec()),
                Err(e) if e.is_retryable() && attempt < self.conf.retries => {
                    log::debug!("retry {}/{} for {}: {}", attempt + 1, self.conf.retries, url, e);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn get_text(&self, url: &str, bearer: Option<&str>) -> Result<String, HttpError> {
        let bytes = self.get_bytes(url, bearer).await?;
        String::from_utf8(bytes).map_err(|e| HttpError::Parse(e.to_string()))
    }

    /// GET and parse JSON. Some endpoints serve zlib-framed bodies without
    /// a Content-Encoding header; on a parse failure the body is checked
    /// for a zlib header and decompressed once before giving up.
    pub async fn get_json(
        &self,
        url: &str,
        bearer: Option<&str>,
    ) -> Result<serde_json::Value, HttpError> {
        let bytes = self.get_bytes(url, bearer).await?;
        parse_json_lenient(&bytes)
    }

    /// Ranged GET appended to `buf`, retrying with the range start pushed
    /// forward by whatever already arrived. Used for depot chunks and zip
    /// members that are processed in memory.
    pub async fn download_range_to_buffer(
        &self,
        url: &str,
        bearer: Option<&str>,
        range: Option<(u64, u64)>,
        buf: &mut Vec<u8>,
        mut on_delta: impl FnMut(u64),
        mut on_retry: impl FnMut(u32, &HttpError),
    ) -> Result<DownloadOutcome, HttpError> {
        let base = buf.len() as u64;
        let mut attempt = 0u32;
        let mut outcome = DownloadOutcome::default();
        loop {
            let resumed = buf.len() as u64 - base;
            let req_range = match range {
                Some((from, to)) => Some((from + resumed, Some(to))),
                None if resumed > 0 => Some((resumed, None)),
                None => None,
            };

            let result = async {
                let resp = self.get_once(url, bearer, req_range).await?;
                outcome.server_mtime = server_mtime(&resp).or(outcome.server_mtime);
                self.stream_to(resp, |data| {
                    buf.extend_from_slice(data);
                    Ok(())
                }, &mut on_delta)
                .await
            }
            .await;

            match result {
                Ok(_) => {
                    outcome.bytes_written = buf.len() as u64 - base;
                    return Ok(outcome);
                }
                Err(e) if e.is_range_not_satisfiable() && resumed > 0 => {
                    // resume hit EOF; what we have is the whole range
                    outcome.bytes_written = resumed;
                    outcome.already_complete = true;
                    return Ok(outcome);
                }
                Err(e) if e.is_retryable() && attempt < self.conf.retries => {
                    attempt += 1;
                    on_retry(attempt, &e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Streaming GET into a file, seeking to `resume_from` and issuing a
    /// matching Range header. Retries push the resume point to the current
    /// file size. 416 at EOF reports `already_complete`.
    pub async fn download_to_file(
        &self,
        url: &str,
        bearer: Option<&str>,
        path: &Path,
        mut resume_from: u64,
        mut on_delta: impl FnMut(u64),
        mut on_retry: impl FnMut(u32, &HttpError),
    ) -> Result<DownloadOutcome, HttpError> {
        let mut attempt = 0u32;
        let mut outcome = DownloadOutcome::default();
        loop {
            let range = if resume_from > 0 {
                Some((resume_from, None))
            } else {
                None
            };

            let result = async {
                let resp = self.get_once(url, bearer, range).await?;
                outcome.server_mtime = server_mtime(&resp).or(outcome.server_mtime);

                let mut file = if resume_from > 0 {
                    let mut f = std::fs::OpenOptions::new().write(true).read(true).open(path)?;
                    use std::io::Seek;
                    f.seek(std::io::SeekFrom::Start(resume_from))?;
                    f
                } else {
                    std::fs::File::create(path)?
                };

                let n = self
                    .stream_to(resp, |data| file.write_all(data), &mut on_delta)
                    .await?;
                file.flush()?;
                Ok::<u64, HttpError>(n)
            }
            .await;

            match result {
                Ok(n) => {
                    outcome.bytes_written += n;
                    return Ok(outcome);
                }
                Err(e) if e.is_range_not_satisfiable() && resume_from > 0 => {
                    outcome.already_complete = true;
                    return Ok(outcome);
                }
                Err(e) if e.is_retryable() && attempt < self.conf.retries => {
                    attempt += 1;
                    on_retry(attempt, &e);
                    // if the file grew, pick up from there
                    if let Ok(meta) = std::fs::metadata(path) {
                        if meta.len() > resume_from {
                            outcome.bytes_written += meta.len() - resume_from;
                            resume_from = meta.len();
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Drains a response body through `write`, enforcing the low-speed
    /// abort and the optional rate cap. Returns bytes streamed.
    async fn stream_to(
        &self,
        mut resp: reqwest::Response,
        mut write: impl FnMut(&[u8]) -> std::io::Result<()>,
        on_delta: &mut impl FnMut(u64),
    ) -> Result<u64, HttpError> {
        let started = Instant::now();
        let mut window_start = Instant::now();
        let mut window_bytes = 0u64;
        let mut total = 0u64;

        loop {
            let chunk = tokio::select! {
                c = resp.chunk() => c.map_err(HttpError::Transport)?,
                _ = tokio::time::sleep(Duration::from_secs(self.conf.low_speed_timeout.max(1))) => {
                    // nothing arrived for the whole low-speed window
                    return Err(HttpError::LowSpeed {
                        rate: self.conf.low_speed_rate,
                        secs: self.conf.low_speed_timeout,
                    });
                }
            };
            let Some(chunk) = chunk else { break };

            write(&chunk)?;
            total += chunk.len() as u64;
            window_bytes += chunk.len() as u64;
            on_delta(chunk.len() as u64);

            let window_elapsed = window_start.elapsed();
            if window_elapsed >= Duration::from_secs(self.conf.low_speed_timeout.max(1)) {
                let rate = window_bytes as f64 / window_elapsed.as_secs_f64();
                if (rate as u64) < self.conf.low_speed_rate {
                    return Err(HttpError::LowSpeed {
                        rate: self.conf.low_speed_rate,
                        secs: self.conf.low_speed_timeout,
                    });
                }
                window_start = Instant::now();
                window_bytes = 0;
            }

            if self.conf.limit_rate_kbps > 0 {
                let budget = self.conf.limit_rate_kbps * 1024;
                let allowed = budget as f64 * started.elapsed().as_secs_f64();
                if (total as f64) > allowed {
                    let ahead = total as f64 - allowed;
                    tokio::time::sleep(Duration::from_secs_f64(ahead / budget as f64)).await;
                }
            }
        }

        Ok(total)
    }
}

fn server_mtime(resp: &reqwest::Response) -> Option<i64> {
    let value = resp
        .headers()
        .get(reqwest::header::LAST_MODIFIED)?
        .to_str()
        .ok()?;
    chrono::DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.timestamp())
}

/// Parses JSON, falling back to one zlib decompression when the body
/// starts with a zlib header.
pub fn parse_json_lenient(bytes: &[u8]) -> Result<serde_json::Value, HttpError> {
    match serde_json::from_slice(bytes) {
        Ok(v) => Ok(v),
        Err(first_err) => {
            if is_zlib_framed(bytes) {
                use std::io::Read;
                let mut decoder = ZlibDecoder::new(bytes);
                let mut decompressed = Vec::new();
                decoder
                    .read_to_end(&mut decompressed)
                    .map_err(|e| HttpError::Parse(format!("zlib decompression failed: {}", e)))?;
                serde_json::from_slice(&decompressed)
                    .map_err(|e| HttpError::Parse(e.to_string()))
            } else {
                Err(HttpError::Parse(first_err.to_string()))
            }
        }
    }
}

/// Recognizes the four common zlib stream headers.
pub fn is_zlib_framed(bytes: &[u8]) -> bool {
    if bytes.len() < 2 {
        return false;
    }
    matches!(
        (bytes[0], bytes[1]),
        (0x78, 0x01) | (0x78, 0x5e) | (0x78, 0x9c) | (0x78, 0xda)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses() {
        let e = |status| HttpError::Status { status, url: String::new() };
        assert!(e(500).is_retryable());
        assert!(e(503).is_retryable());
        assert!(e(429).is_retryable());
        assert!(!e(404).is_retryable());
        assert!(!e(416).is_retryable());
        assert!(e(416).is_range_not_satisfiable());
        assert!(HttpError::LowSpeed { rate: 200, secs: 30 }.is_retryable());
    }

    #[test]
    fn zlib_header_detection() {
        assert!(is_zlib_framed(&[0x78, 0x9c, 0x00]));
        assert!(is_zlib_framed(&[0x78, 0x01]));
        assert!(!is_zlib_framed(&[0x1f, 0x8b]));
        assert!(!is_zlib_framed(&[0x78]));
    }

    #[test]
    fn lenient_parse_plain_json() {
        let v = parse_json_lenient(br#"{"a":1}"#).unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn lenient_parse_zlib_json() {
        use flate2::write::ZlibEncoder;
        use flate2::Compression;
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(br#"{"depot":{"items":[]}}"#).unwrap();
        let compressed = enc.finish().unwrap();
        let v = parse_json_lenient(&compressed).unwrap();
        assert!(v["depot"]["items"].as_array().unwrap().is_empty());
    }

    #[test]
    fn lenient_parse_garbage_fails() {
        assert!(parse_json_lenient(b"not json at all").is_err());
    }
}

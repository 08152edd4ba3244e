use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{ETAG, HeaderName, LAST_MODIFIED};
use tracing::debug;

use crate::config::Settings;

pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

const DOWNLOAD_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextResponse {
    pub status: u16,
    pub body: String,
}

impl TextResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadResponse {
    pub status: u16,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    pub status: u16,
    pub bytes_written: u64,
    pub content_length: Option<u64>,
}

impl DownloadReport {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The plain HTTP surface the manifest client and acquisition workflow need.
///
/// Transport failures are errors; HTTP statuses are data, so callers decide
/// which statuses are fatal.
pub trait HttpTransport {
    fn get_text(&mut self, url: &str) -> Result<TextResponse>;
    fn head(&mut self, url: &str) -> Result<HeadResponse>;
    /// Streams the body of a successful GET to `dest`, reporting bytes-written
    /// over content-length as a fraction in `[0, 1]`. Nothing is written for
    /// a non-success status.
    fn download_to_file(
        &mut self,
        url: &str,
        dest: &Path,
        progress: &mut dyn FnMut(f64),
    ) -> Result<DownloadReport>;
}

pub struct ReqwestTransport {
    client: Client,
    request_timeout: Duration,
    download_timeout: Duration,
}

impl ReqwestTransport {
    pub fn new(settings: &Settings) -> Result<Self> {
        let request_timeout = Duration::from_millis(settings.timeout_ms);
        let client = Client::builder()
            .user_agent(settings.user_agent.clone())
            .connect_timeout(request_timeout)
            .timeout(Option::<Duration>::None)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            request_timeout,
            download_timeout: Duration::from_millis(settings.download_timeout_ms),
        })
    }
}

impl HttpTransport for ReqwestTransport {
    fn get_text(&mut self, url: &str) -> Result<TextResponse> {
        let response = self
            .client
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .with_context(|| format!("failed to GET {url}"))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .with_context(|| format!("failed to read body of {url}"))?;
        debug!(url, status, bytes = body.len(), "fetched text");
        Ok(TextResponse { status, body })
    }

    fn head(&mut self, url: &str) -> Result<HeadResponse> {
        let response = self
            .client
            .head(url)
            .timeout(self.request_timeout)
            .send()
            .with_context(|| format!("failed to HEAD {url}"))?;
        let header = |name: HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        Ok(HeadResponse {
            status: response.status().as_u16(),
            etag: header(ETAG),
            last_modified: header(LAST_MODIFIED),
        })
    }

    fn download_to_file(
        &mut self,
        url: &str,
        dest: &Path,
        progress: &mut dyn FnMut(f64),
    ) -> Result<DownloadReport> {
        let mut response = self
            .client
            .get(url)
            .timeout(self.download_timeout)
            .send()
            .with_context(|| format!("failed to GET {url}"))?;
        let status = response.status().as_u16();
        let content_length = response.content_length();
        if !response.status().is_success() {
            return Ok(DownloadReport {
                status,
                bytes_written: 0,
                content_length,
            });
        }

        let file =
            File::create(dest).with_context(|| format!("failed to create {}", dest.display()))?;
        let mut writer = BufWriter::new(file);
        let mut throttle = ProgressThrottle::new(PROGRESS_INTERVAL);
        let mut buffer = vec![0u8; DOWNLOAD_CHUNK_BYTES];
        let mut bytes_written = 0u64;
        loop {
            let read = response
                .read(&mut buffer)
                .with_context(|| format!("failed to read body of {url}"))?;
            if read == 0 {
                break;
            }
            writer
                .write_all(&buffer[..read])
                .with_context(|| format!("failed to write {}", dest.display()))?;
            bytes_written += read as u64;
            if let Some(fraction) = fraction_of(bytes_written, content_length)
                && throttle.ready(Instant::now())
            {
                progress(fraction);
            }
        }
        writer
            .flush()
            .with_context(|| format!("failed to flush {}", dest.display()))?;
        if let Some(fraction) = fraction_of(bytes_written, content_length) {
            progress(fraction);
        }

        Ok(DownloadReport {
            status,
            bytes_written,
            content_length,
        })
    }
}

/// Fraction complete, or `None` when the server sent no usable length.
pub fn fraction_of(bytes_written: u64, content_length: Option<u64>) -> Option<f64> {
    let total = content_length.filter(|total| *total > 0)?;
    Some((bytes_written as f64 / total as f64).clamp(0.0, 1.0))
}

/// Gate that opens at most once per interval.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    interval: Duration,
    last_emitted: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emitted: None,
        }
    }

    pub fn ready(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last_emitted
            && now.saturating_duration_since(last) < self.interval
        {
            return false;
        }
        self.last_emitted = Some(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use std::io::BufRead;
    use std::net::TcpListener;
    use std::thread;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn throttle_opens_once_per_interval() {
        let start = Instant::now();
        let mut throttle = ProgressThrottle::new(Duration::from_millis(250));
        assert!(throttle.ready(start));
        assert!(!throttle.ready(start + Duration::from_millis(100)));
        assert!(!throttle.ready(start + Duration::from_millis(249)));
        assert!(throttle.ready(start + Duration::from_millis(250)));
        assert!(!throttle.ready(start + Duration::from_millis(300)));
    }

    #[test]
    fn fraction_requires_positive_length() {
        assert_eq!(fraction_of(50, Some(200)), Some(0.25));
        assert_eq!(fraction_of(10, None), None);
        assert_eq!(fraction_of(10, Some(0)), None);
        assert_eq!(fraction_of(300, Some(200)), Some(1.0));
    }

    #[test]
    fn success_ranges() {
        let ok = TextResponse {
            status: 204,
            body: String::new(),
        };
        assert!(ok.is_success());
        let report = DownloadReport {
            status: 500,
            bytes_written: 0,
            content_length: None,
        };
        assert!(!report.is_success());
    }

    #[test]
    fn stalled_download_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut reader = std::io::BufReader::new(stream.try_clone().expect("clone"));
            let mut line = String::new();
            while reader.read_line(&mut line).expect("read request") > 2 {
                line.clear();
            }
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 4096\r\n\r\npartial")
                .expect("write head");
            stream.flush().expect("flush");
            thread::sleep(Duration::from_secs(3));
        });

        let mut settings = Settings::default();
        settings.download_timeout_ms = 300;
        let mut transport = ReqwestTransport::new(&settings).expect("transport");
        assert_eq!(transport.download_timeout, Duration::from_millis(300));

        let temp = tempdir().expect("tempdir");
        let started = Instant::now();
        let result = transport.download_to_file(
            &format!("http://127.0.0.1:{port}/docs.zip"),
            &temp.path().join("docs.zip"),
            &mut |_| {},
        );
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(2));
        server.join().expect("server");
    }
}

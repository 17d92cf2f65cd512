//! Remote blob-store adapter speaking an S3/OSS-compatible REST dialect.
//!
//! The ODB keeps blob payloads here; the loose store is only a local
//! cache. Requests are authenticated with an HMAC-SHA256 signature over
//! `verb\n/bucket/key\nexpires`; `share` issues the same signature as
//! query parameters, producing a presigned GET with a bounded lifetime.
//!
//! Multipart uploads fan parts out over N workers on a results channel.
//! The first failing part cancels its siblings and aborts the upload under
//! a fresh short-lived deadline, so cancellation of the calling request
//! cannot leak server-side partials.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::Stream;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tokio::io::AsyncSeekExt;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use crate::config::RemoteConfig;
use crate::errors::ZetaError;

/// Batched delete cap per request.
const DELETE_BATCH: usize = 200;
/// Deadline for the abort call issued after a failed multipart upload.
const ABORT_TIMEOUT: Duration = Duration::from_secs(10);

type HmacSha256 = Hmac<Sha256>;

/// Byte stream with a declared length.
pub struct SizedStream {
    pub size: u64,
    pub stream: Pin<Box<dyn Stream<Item = Result<Bytes, ZetaError>> + Send>>,
}

/// HEAD result.
#[derive(Debug, Clone)]
pub struct RemoteStat {
    pub size: u64,
    pub content_type: String,
    pub crc64: Option<String>,
}

/// Structured error record parsed from the vendor XML body.
#[derive(Debug, Clone)]
pub struct RemoteErrorInfo {
    pub status: u16,
    pub code: String,
    pub message: String,
    pub request_id: String,
    pub endpoint: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VendorErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    request_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InitiateMultipartUploadResult {
    upload_id: String,
}

#[derive(Clone)]
pub struct RemoteStore {
    http: reqwest::Client,
    endpoint: String,
    bucket: String,
    key_id: String,
    key_secret: String,
    max_part: u64,
    min_part: u64,
    workers: usize,
}

impl RemoteStore {
    pub fn new(cfg: &RemoteConfig) -> RemoteStore {
        RemoteStore {
            http: reqwest::Client::new(),
            endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
            bucket: cfg.bucket.clone(),
            key_id: cfg.access_key_id.clone(),
            key_secret: cfg.access_key_secret.clone(),
            max_part: cfg.max_part_size,
            min_part: cfg.min_part_size,
            workers: cfg.upload_workers.max(1),
        }
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, key)
    }

    fn resource(&self, key: &str) -> String {
        format!("/{}/{}", self.bucket, key)
    }

    /// HMAC-SHA256 over `verb\nresource\nexpires`, hex encoded.
    fn sign(&self, verb: &str, key: &str, expires: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(self.key_secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(verb.as_bytes());
        mac.update(b"\n");
        mac.update(self.resource(key).as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn authed(&self, req: reqwest::RequestBuilder, verb: &str, key: &str) -> reqwest::RequestBuilder {
        let expires = chrono::Utc::now().timestamp() + 300;
        req.header("x-zeta-key-id", &self.key_id)
            .header("x-zeta-expires", expires.to_string())
            .header("x-zeta-signature", self.sign(verb, key, expires))
    }

    /// Turn a non-success response into a classified error, consuming the
    /// vendor XML body when one is present.
    async fn classify(&self, key: &str, response: reqwest::Response) -> ZetaError {
        let status = response.status().as_u16();
        let body = response.bytes().await.unwrap_or_default();
        let parsed: Option<VendorErrorBody> = quick_xml::de::from_reader(body.as_ref()).ok();
        let info = RemoteErrorInfo {
            status,
            code: parsed.as_ref().map(|p| p.code.clone()).unwrap_or_default(),
            message: parsed
                .as_ref()
                .map(|p| p.message.clone())
                .unwrap_or_default(),
            request_id: parsed
                .as_ref()
                .map(|p| p.request_id.clone())
                .unwrap_or_default(),
            endpoint: self.endpoint.clone(),
        };
        classify_remote(key, info)
    }

    /// HEAD: size, content type and the store-side CRC-64 when published.
    pub async fn stat(&self, key: &str) -> Result<RemoteStat, ZetaError> {
        let response = self
            .authed(self.http.head(self.url(key)), "HEAD", key)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ZetaError::not_found(format!("remote object {key}")));
        }
        if !response.status().is_success() {
            return Err(self.classify(key, response).await);
        }
        let headers = response.headers();
        let size = headers
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let content_type = headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let crc64 = headers
            .get("x-zeta-hash-crc64")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        Ok(RemoteStat {
            size,
            content_type,
            crc64,
        })
    }

    /// True when the object exists; `NotFound` maps to `false`.
    pub async fn exists(&self, key: &str) -> Result<bool, ZetaError> {
        match self.stat(key).await {
            Ok(_) => Ok(true),
            Err(ZetaError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Range GET. The declared size comes from `Content-Range` when
    /// present, then `Content-Length`, then a re-stat.
    pub async fn open(
        &self,
        key: &str,
        start: u64,
        length: Option<u64>,
    ) -> Result<SizedStream, ZetaError> {
        let range = match length {
            Some(len) => format!("bytes={start}-{}", start + len - 1),
            None => format!("bytes={start}-"),
        };
        let response = self
            .authed(self.http.get(self.url(key)), "GET", key)
            .header(reqwest::header::RANGE, range)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ZetaError::not_found(format!("remote object {key}")));
        }
        if !response.status().is_success() {
            return Err(self.classify(key, response).await);
        }

        let declared = response
            .headers()
            .get(reqwest::header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range)
            .map(|(first, last, _total)| last - first + 1);
        let size = match declared {
            Some(size) => size,
            None => match response
                .headers()
                .get(reqwest::header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
            {
                Some(size) => size,
                None => self.stat(key).await?.size.saturating_sub(start),
            },
        };

        use futures::TryStreamExt;
        let stream = response.bytes_stream().map_err(ZetaError::from);
        Ok(SizedStream {
            size,
            stream: Box::pin(stream),
        })
    }

    /// Single PUT for in-memory payloads.
    pub async fn put(&self, key: &str, content: Bytes, mime: &str) -> Result<(), ZetaError> {
        let response = self
            .authed(self.http.put(self.url(key)), "PUT", key)
            .header(reqwest::header::CONTENT_TYPE, mime)
            .body(content)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.classify(key, response).await);
        }
        Ok(())
    }

    /// Single streamed PUT of a local file region.
    async fn put_file(
        &self,
        key: &str,
        path: &Path,
        offset: u64,
        len: u64,
        mime: &str,
        query: Option<&str>,
    ) -> Result<Option<String>, ZetaError> {
        let mut file = tokio::fs::File::open(path).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let limited = tokio::io::AsyncReadExt::take(file, len);
        let body = reqwest::Body::wrap_stream(ReaderStream::new(limited));

        let url = match query {
            Some(q) => format!("{}?{q}", self.url(key)),
            None => self.url(key),
        };
        let response = self
            .authed(self.http.put(url), "PUT", key)
            .header(reqwest::header::CONTENT_TYPE, mime)
            .header(reqwest::header::CONTENT_LENGTH, len.to_string())
            .body(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.classify(key, response).await);
        }
        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        Ok(etag)
    }

    /// Upload a region of a local file: a single PUT below the part
    /// threshold, a parallel multipart upload otherwise.
    pub async fn linear_upload(
        &self,
        key: &str,
        path: &Path,
        offset: u64,
        size: u64,
        mime: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ZetaError> {
        if size < self.max_part {
            self.put_file(key, path, offset, size, mime, None).await?;
            return Ok(());
        }
        self.multipart_upload(key, path, offset, size, mime, cancel)
            .await
    }

    async fn multipart_upload(
        &self,
        key: &str,
        path: &Path,
        base: u64,
        size: u64,
        mime: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ZetaError> {
        let upload_id = self.initiate_multipart(key, mime).await?;
        match self
            .upload_parts(key, path, base, size, mime, &upload_id, cancel)
            .await
        {
            Ok(parts) => self.complete_multipart(key, &upload_id, &parts).await,
            Err(e) => {
                // Abort with a fresh deadline: caller cancellation must not
                // leave a dangling upload on the store.
                if let Err(abort_err) = tokio::time::timeout(
                    ABORT_TIMEOUT,
                    self.abort_multipart(key, &upload_id),
                )
                .await
                .unwrap_or_else(|_| Err(ZetaError::Transient("abort timed out".into())))
                {
                    tracing::warn!(key, error = %abort_err, "multipart abort failed");
                }
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn upload_parts(
        &self,
        key: &str,
        path: &Path,
        base: u64,
        size: u64,
        mime: &str,
        upload_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<(u32, String)>, ZetaError> {
        let plan = plan_parts(size, self.max_part, self.min_part);
        let total = plan.len();
        let (job_tx, job_rx) = mpsc::channel::<(u32, u64, u64)>(total);
        for (idx, (offset, len)) in plan.iter().enumerate() {
            job_tx
                .send((idx as u32 + 1, base + *offset, *len))
                .await
                .expect("job channel sized for all parts");
        }
        drop(job_tx);

        let job_rx = Arc::new(tokio::sync::Mutex::new(job_rx));
        let (result_tx, mut result_rx) = mpsc::channel::<Result<(u32, String), ZetaError>>(total);
        let worker_cancel = cancel.child_token();

        for _ in 0..self.workers.min(total) {
            let store = self.clone();
            let key = key.to_string();
            let path = PathBuf::from(path);
            let mime = mime.to_string();
            let upload_id = upload_id.to_string();
            let jobs = Arc::clone(&job_rx);
            let results = result_tx.clone();
            let cancelled = worker_cancel.clone();
            tokio::spawn(async move {
                loop {
                    let job = { jobs.lock().await.recv().await };
                    let Some((number, offset, len)) = job else {
                        break;
                    };
                    let query = format!("partNumber={number}&uploadId={upload_id}");
                    let outcome = tokio::select! {
                        _ = cancelled.cancelled() => {
                            Err(ZetaError::Transient("part upload cancelled".into()))
                        }
                        r = store.put_file(&key, &path, offset, len, &mime, Some(&query)) => {
                            r.map(|etag| (number, etag.unwrap_or_default()))
                        }
                    };
                    let failed = outcome.is_err();
                    if results.send(outcome).await.is_err() || failed {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        let mut parts = Vec::with_capacity(total);
        let mut first_error = None;
        while let Some(outcome) = result_rx.recv().await {
            match outcome {
                Ok(part) => parts.push(part),
                Err(e) => {
                    // One failure cancels every sibling worker.
                    worker_cancel.cancel();
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        if parts.len() != total {
            return Err(ZetaError::Transient(format!(
                "multipart upload finished {}/{} parts",
                parts.len(),
                total
            )));
        }
        parts.sort_by_key(|(number, _)| *number);
        Ok(parts)
    }

    async fn initiate_multipart(&self, key: &str, mime: &str) -> Result<String, ZetaError> {
        let url = format!("{}?uploads", self.url(key));
        let response = self
            .authed(self.http.post(url), "POST", key)
            .header(reqwest::header::CONTENT_TYPE, mime)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.classify(key, response).await);
        }
        let body = response.bytes().await?;
        let parsed: InitiateMultipartUploadResult = quick_xml::de::from_reader(body.as_ref())
            .map_err(|e| ZetaError::Transient(format!("initiate multipart response: {e}")))?;
        Ok(parsed.upload_id)
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[(u32, String)],
    ) -> Result<(), ZetaError> {
        let mut xml = String::from("<CompleteMultipartUpload>");
        for (number, etag) in parts {
            xml.push_str(&format!(
                "<Part><PartNumber>{number}</PartNumber><ETag>{etag}</ETag></Part>"
            ));
        }
        xml.push_str("</CompleteMultipartUpload>");
        let url = format!("{}?uploadId={upload_id}", self.url(key));
        let response = self
            .authed(self.http.post(url), "POST", key)
            .header(reqwest::header::CONTENT_TYPE, "application/xml")
            .body(xml)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.classify(key, response).await);
        }
        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), ZetaError> {
        let url = format!("{}?uploadId={upload_id}", self.url(key));
        let response = self
            .authed(self.http.delete(url), "DELETE", key)
            .send()
            .await?;
        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(self.classify(key, response).await);
        }
        Ok(())
    }

    /// Presigned GET with a bounded lifetime.
    pub fn share(&self, key: &str, expires_at: chrono::DateTime<chrono::Utc>) -> String {
        let expires = expires_at.timestamp();
        let signature = self.sign("GET", key, expires);
        format!(
            "{}?x-zeta-key-id={}&x-zeta-expires={expires}&x-zeta-signature={signature}",
            self.url(key),
            self.key_id
        )
    }

    /// Batched delete, capped at 200 keys per request.
    pub async fn delete_many(&self, keys: &[String]) -> Result<(), ZetaError> {
        for batch in keys.chunks(DELETE_BATCH) {
            let mut xml = String::from("<Delete><Quiet>true</Quiet>");
            for key in batch {
                xml.push_str(&format!("<Object><Key>{key}</Key></Object>"));
            }
            xml.push_str("</Delete>");
            let url = format!("{}/{}?delete", self.endpoint, self.bucket);
            let response = self
                .authed(self.http.post(url), "POST", "")
                .header(reqwest::header::CONTENT_TYPE, "application/xml")
                .body(xml)
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(self.classify("", response).await);
            }
        }
        Ok(())
    }
}

/// `bytes <first>-<last>/<total>` or `bytes */<total>`.
fn parse_content_range(value: &str) -> Option<(u64, u64, u64)> {
    let rest = value.strip_prefix("bytes ")?;
    let (range, total) = rest.split_once('/')?;
    let total: u64 = total.parse().ok()?;
    if range == "*" {
        return Some((0, total.saturating_sub(1), total));
    }
    let (first, last) = range.split_once('-')?;
    Some((first.parse().ok()?, last.parse().ok()?, total))
}

/// Part layout: 1-based part numbers, every part `max_part` bytes except
/// the last, which absorbs a remainder smaller than `min_part` so it never
/// drops below the minimum.
fn plan_parts(size: u64, max_part: u64, min_part: u64) -> Vec<(u64, u64)> {
    let mut count = size / max_part;
    let rem = size % max_part;
    if rem > 0 {
        count += 1;
    }
    if count > 1 && rem > 0 && rem < min_part {
        count -= 1;
    }
    let mut parts = Vec::with_capacity(count as usize);
    for i in 0..count {
        let offset = i * max_part;
        let len = if i + 1 == count {
            size - offset
        } else {
            max_part
        };
        parts.push((offset, len));
    }
    parts
}

/// Map a structured vendor error to the crate's stable kinds.
fn classify_remote(key: &str, info: RemoteErrorInfo) -> ZetaError {
    tracing::debug!(
        key,
        status = info.status,
        code = %info.code,
        request_id = %info.request_id,
        endpoint = %info.endpoint,
        "remote store error"
    );
    match info.status {
        404 => ZetaError::not_found(format!("remote object {key}")),
        403 => ZetaError::PermissionDenied(format!("remote store denied {key}: {}", info.code)),
        409 => ZetaError::conflict(format!("remote store conflict on {key}: {}", info.code)),
        400..=499 => ZetaError::malformed(format!(
            "remote store rejected {key}: {} {}",
            info.code, info.message
        )),
        _ => ZetaError::Transient(format!(
            "remote store {} failed with {} ({})",
            info.endpoint, info.status, info.code
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Part plans: exact fits, small remainders folded into the last
    /// part, and large remainders standing alone.
    #[test]
    fn part_plan_respects_min_part() {
        // Exact multiple: equal parts.
        let parts = plan_parts(20, 10, 3);
        assert_eq!(parts, vec![(0, 10), (10, 10)]);

        // Remainder below min: folded into the last part.
        let parts = plan_parts(22, 10, 3);
        assert_eq!(parts, vec![(0, 10), (10, 12)]);

        // Remainder at or above min: its own trailing part.
        let parts = plan_parts(23, 10, 3);
        assert_eq!(parts, vec![(0, 10), (10, 10), (20, 3)]);

        // Every offset/length covers the input exactly once.
        for size in [1u64, 9, 10, 11, 19, 29, 30, 31] {
            let parts = plan_parts(size, 10, 3);
            let covered: u64 = parts.iter().map(|(_, l)| l).sum();
            assert_eq!(covered, size, "size {size}");
            assert!(parts.iter().rev().skip(1).all(|(_, l)| *l == 10));
            assert!(parts.last().unwrap().1 >= 3.min(size));
        }
    }

    /// Content-Range parsing handles both forms.
    #[test]
    fn content_range_forms() {
        assert_eq!(
            parse_content_range("bytes 1073741824-2147483647/10737418240"),
            Some((1073741824, 2147483647, 10737418240))
        );
        assert_eq!(
            parse_content_range("bytes */500"),
            Some((0, 499, 500))
        );
        assert_eq!(parse_content_range("chunks 0-1/2"), None);
    }

    /// Signatures are deterministic and presigned URLs embed them.
    #[test]
    fn share_url_is_signed() {
        let store = RemoteStore::new(&RemoteConfig {
            endpoint: "https://oss.example".into(),
            bucket: "zeta".into(),
            access_key_id: "AKID".into(),
            access_key_secret: "secret".into(),
            ..Default::default()
        });
        let expires = chrono::DateTime::from_timestamp(1_900_000_000, 0).unwrap();
        let url = store.share("repos/1/objects/ab/cd", expires);
        assert!(url.starts_with("https://oss.example/zeta/repos/1/objects/ab/cd?"));
        assert!(url.contains("x-zeta-key-id=AKID"));
        assert!(url.contains("x-zeta-expires=1900000000"));
        let sig = store.sign("GET", "repos/1/objects/ab/cd", 1_900_000_000);
        assert!(url.ends_with(&sig));
        // A different key signs differently.
        assert_ne!(sig, store.sign("GET", "repos/1/objects/ab/ce", 1_900_000_000));
    }

    /// Vendor XML bodies parse into the structured record.
    #[test]
    fn vendor_error_body_parses() {
        let xml = r#"<?xml version="1.0"?>
<Error>
  <Code>NoSuchKey</Code>
  <Message>The specified key does not exist.</Message>
  <RequestId>5C1A2B3C4D5E6F</RequestId>
</Error>"#;
        let parsed: VendorErrorBody = quick_xml::de::from_reader(xml.as_bytes()).unwrap();
        assert_eq!(parsed.code, "NoSuchKey");
        assert_eq!(parsed.request_id, "5C1A2B3C4D5E6F");
    }

    /// Status classes map to the crate's stable error kinds.
    #[test]
    fn remote_status_classification() {
        let info = |status| RemoteErrorInfo {
            status,
            code: "X".into(),
            message: String::new(),
            request_id: String::new(),
            endpoint: "e".into(),
        };
        assert_eq!(classify_remote("k", info(404)).status(), 404);
        assert_eq!(classify_remote("k", info(403)).status(), 403);
        assert_eq!(classify_remote("k", info(409)).status(), 409);
        assert_eq!(classify_remote("k", info(418)).status(), 400);
        assert_eq!(classify_remote("k", info(503)).status(), 500);
    }

    /// The multipart response XML parses to an upload id.
    #[test]
    fn initiate_response_parses() {
        let xml = r#"<InitiateMultipartUploadResult>
  <Bucket>zeta</Bucket>
  <Key>big.bin</Key>
  <UploadId>2~abcdef</UploadId>
</InitiateMultipartUploadResult>"#;
        let parsed: InitiateMultipartUploadResult =
            quick_xml::de::from_reader(xml.as_bytes()).unwrap();
        assert_eq!(parsed.upload_id, "2~abcdef");
    }
}

//! S3-compatible backend over presigned requests.
//!
//! Blobs larger than one transfer chunk go up as a multipart upload whose
//! parts are sent concurrently; everything else is a single PUT. Failures are
//! not retried here: a failed part fails the stage, and the next run resumes
//! from the ledger.

use rayon::prelude::*;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;
use std::time::Duration;

use rusty_s3::actions::{CreateMultipartUpload, ListObjectsV2, S3Action};
use rusty_s3::{Bucket, Credentials, UrlStyle};

use super::{aborted, ObjectStore, TransferObserver};
use crate::config::TransferConfig;
use crate::error::{FerryError, Result};

/// Duration for presigned URL validity.
const PRESIGN_DURATION: Duration = Duration::from_secs(3600);

/// S3 refuses multipart uploads with more parts than this.
const MAX_PARTS: u64 = 10_000;

/// Smallest part S3 accepts (except the last one).
const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

pub struct S3Store {
    bucket: Bucket,
    credentials: Credentials,
    agent: ureq::Agent,
    chunk_size: u64,
    workers: usize,
}

fn store_err(op: &str, key: &str, e: impl std::fmt::Display) -> FerryError {
    FerryError::Store(format!("S3 {op} {key}: {e}"))
}

impl S3Store {
    pub fn new(
        endpoint: &str,
        bucket_name: &str,
        region: &str,
        access_key_id: &str,
        secret_access_key: &str,
        transfer: &TransferConfig,
    ) -> Result<Self> {
        let base_url = endpoint
            .parse()
            .map_err(|e| FerryError::Config(format!("invalid S3 endpoint URL '{endpoint}': {e}")))?;

        // Endpoint is always explicit; use path-style addressing.
        let bucket = Bucket::new(
            base_url,
            UrlStyle::Path,
            bucket_name.to_string(),
            region.to_string(),
        )
        .map_err(|e| FerryError::Config(format!("failed to create S3 bucket handle: {e}")))?;

        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(300))
            .timeout_write(Duration::from_secs(300))
            .build();

        Ok(Self {
            bucket,
            credentials: Credentials::new(access_key_id, secret_access_key),
            agent,
            chunk_size: transfer.chunk_size.max(MIN_PART_SIZE),
            workers: transfer.worker_count(),
        })
    }

    /// Create the bucket if it does not exist yet.
    pub fn ensure_bucket(&self) -> Result<()> {
        let url = self
            .bucket
            .create_bucket(&self.credentials)
            .sign(PRESIGN_DURATION);
        match self.agent.put(url.as_str()).call() {
            Ok(_) => Ok(()),
            // BucketAlreadyOwnedByYou / BucketAlreadyExists
            Err(ureq::Error::Status(409, _)) => Ok(()),
            Err(e) => Err(store_err("CREATE BUCKET", self.bucket.name(), e)),
        }
    }

    /// Part size that keeps the upload under the part-count limit.
    fn part_size_for(&self, len: u64) -> u64 {
        self.chunk_size.max(len.div_ceil(MAX_PARTS))
    }

    fn put_single(&self, path: &Path, key: &str, observer: &dyn TransferObserver) -> Result<()> {
        if observer.should_abort() {
            return Err(aborted("PUT", key));
        }
        let data = fs::read(path)?;
        let url = self
            .bucket
            .put_object(Some(&self.credentials), key)
            .sign(PRESIGN_DURATION);
        self.agent
            .put(url.as_str())
            .send_bytes(&data)
            .map_err(|e| store_err("PUT", key, e))?;
        observer.on_bytes(data.len() as u64);
        Ok(())
    }

    fn put_multipart(
        &self,
        path: &Path,
        key: &str,
        len: u64,
        observer: &dyn TransferObserver,
    ) -> Result<()> {
        let url = self
            .bucket
            .create_multipart_upload(Some(&self.credentials), key)
            .sign(PRESIGN_DURATION);
        let body = self
            .agent
            .post(url.as_str())
            .call()
            .map_err(|e| store_err("CREATE MULTIPART", key, e))?
            .into_string()
            .map_err(|e| store_err("CREATE MULTIPART", key, e))?;
        let created = CreateMultipartUpload::parse_response(&body)
            .map_err(|e| store_err("CREATE MULTIPART", key, e))?;
        let upload_id = created.upload_id().to_string();

        match self.send_parts(path, key, &upload_id, len, observer) {
            Ok(etags) => self.complete_multipart(key, &upload_id, &etags),
            Err(e) => {
                let url = self
                    .bucket
                    .abort_multipart_upload(Some(&self.credentials), key, &upload_id)
                    .sign(PRESIGN_DURATION);
                if let Err(abort_err) = self.agent.delete(url.as_str()).call() {
                    tracing::warn!("S3 ABORT MULTIPART {key}: {abort_err}");
                }
                Err(e)
            }
        }
    }

    fn send_parts(
        &self,
        path: &Path,
        key: &str,
        upload_id: &str,
        len: u64,
        observer: &dyn TransferObserver,
    ) -> Result<Vec<String>> {
        let part_size = self.part_size_for(len);
        let ranges: Vec<(u16, u64, u64)> = (0..len)
            .step_by(part_size as usize)
            .enumerate()
            .map(|(i, off)| ((i + 1) as u16, off, part_size.min(len - off)))
            .collect();

        let input = File::open(path)?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .map_err(|e| store_err("PUT", key, e))?;

        pool.install(|| {
            ranges
                .par_iter()
                .map(|&(number, offset, n)| -> Result<String> {
                    if observer.should_abort() {
                        return Err(aborted("PUT", key));
                    }
                    let data = read_range(&input, offset, n)?;
                    let url = self
                        .bucket
                        .upload_part(Some(&self.credentials), key, number, upload_id)
                        .sign(PRESIGN_DURATION);
                    let resp = self
                        .agent
                        .put(url.as_str())
                        .send_bytes(&data)
                        .map_err(|e| store_err("UPLOAD PART", key, e))?;
                    let etag = resp
                        .header("ETag")
                        .ok_or_else(|| store_err("UPLOAD PART", key, "response has no ETag"))?
                        .to_string();
                    observer.on_bytes(n);
                    Ok(etag)
                })
                .collect()
        })
    }

    fn complete_multipart(&self, key: &str, upload_id: &str, etags: &[String]) -> Result<()> {
        let action = self.bucket.complete_multipart_upload(
            Some(&self.credentials),
            key,
            upload_id,
            etags.iter().map(String::as_str),
        );
        let url = action.sign(PRESIGN_DURATION);
        let body = action.body();
        self.agent
            .post(url.as_str())
            .send_string(&body)
            .map_err(|e| store_err("COMPLETE MULTIPART", key, e))?;
        Ok(())
    }
}

#[cfg(unix)]
fn read_range(input: &File, offset: u64, len: u64) -> Result<Vec<u8>> {
    use std::os::unix::fs::FileExt;
    let mut buf = vec![0u8; len as usize];
    input.read_exact_at(&mut buf, offset)?;
    Ok(buf)
}

#[cfg(not(unix))]
fn read_range(input: &File, offset: u64, len: u64) -> Result<Vec<u8>> {
    use std::io::{Seek, SeekFrom};
    let mut reader = input.try_clone()?;
    reader.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// Writer that reports every write to an observer and stops when asked.
struct ObservedWriter<'a, W> {
    inner: W,
    observer: &'a dyn TransferObserver,
}

impl<W: Write> Write for ObservedWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.observer.should_abort() {
            return Err(io::Error::new(io::ErrorKind::Other, "transfer aborted"));
        }
        let n = self.inner.write(buf)?;
        self.observer.on_bytes(n as u64);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl ObjectStore for S3Store {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let url = self
            .bucket
            .get_object(Some(&self.credentials), key)
            .sign(PRESIGN_DURATION);
        match self.agent.get(url.as_str()).call() {
            Ok(resp) => {
                let mut buf = Vec::new();
                resp.into_reader()
                    .read_to_end(&mut buf)
                    .map_err(|e| store_err("GET", key, e))?;
                Ok(Some(buf))
            }
            Err(ureq::Error::Status(404, _)) => Ok(None),
            Err(e) => Err(store_err("GET", key, e)),
        }
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let url = self
            .bucket
            .put_object(Some(&self.credentials), key)
            .sign(PRESIGN_DURATION);
        self.agent
            .put(url.as_str())
            .send_bytes(data)
            .map_err(|e| store_err("PUT", key, e))?;
        Ok(())
    }

    fn size(&self, key: &str) -> Result<Option<u64>> {
        let url = self
            .bucket
            .head_object(Some(&self.credentials), key)
            .sign(PRESIGN_DURATION);
        match self.agent.head(url.as_str()).call() {
            Ok(resp) => {
                let len = resp
                    .header("Content-Length")
                    .and_then(|v| v.parse::<u64>().ok())
                    .ok_or_else(|| store_err("HEAD", key, "missing Content-Length"))?;
                Ok(Some(len))
            }
            Err(ureq::Error::Status(404, _)) => Ok(None),
            Err(e) => Err(store_err("HEAD", key, e)),
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        let url = self
            .bucket
            .delete_object(Some(&self.credentials), key)
            .sign(PRESIGN_DURATION);
        match self.agent.delete(url.as_str()).call() {
            Ok(_) | Err(ureq::Error::Status(404, _)) => Ok(()),
            Err(e) => Err(store_err("DELETE", key, e)),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut action = self.bucket.list_objects_v2(Some(&self.credentials));
            action.query_mut().insert("prefix", prefix);
            if let Some(ref token) = continuation_token {
                action.query_mut().insert("continuation-token", token);
            }
            let url = action.sign(PRESIGN_DURATION);

            let body = self
                .agent
                .get(url.as_str())
                .call()
                .map_err(|e| store_err("LIST", prefix, e))?
                .into_string()
                .map_err(|e| store_err("LIST", prefix, e))?;
            let parsed = ListObjectsV2::parse_response(&body)
                .map_err(|e| store_err("LIST", prefix, format!("failed to parse response: {e}")))?;

            keys.extend(
                parsed
                    .contents
                    .into_iter()
                    .map(|obj| obj.key)
                    .filter(|k| !k.ends_with('/')),
            );

            match parsed.next_continuation_token {
                Some(token) => continuation_token = Some(token),
                None => break,
            }
        }

        Ok(keys)
    }

    fn upload_file(&self, path: &Path, key: &str, observer: &dyn TransferObserver) -> Result<()> {
        let len = fs::metadata(path)?.len();
        if len <= self.chunk_size {
            self.put_single(path, key, observer)
        } else {
            self.put_multipart(path, key, len, observer)
        }
    }

    fn download_file(
        &self,
        key: &str,
        path: &Path,
        observer: &dyn TransferObserver,
    ) -> Result<()> {
        let url = self
            .bucket
            .get_object(Some(&self.credentials), key)
            .sign(PRESIGN_DURATION);
        let resp = self
            .agent
            .get(url.as_str())
            .call()
            .map_err(|e| store_err("GET", key, e))?;

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;
        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        let mut writer = ObservedWriter {
            inner: io::BufWriter::new(tmp),
            observer,
        };
        io::copy(&mut resp.into_reader(), &mut writer).map_err(|e| store_err("GET", key, e))?;
        let tmp = writer
            .inner
            .into_inner()
            .map_err(|e| store_err("GET", key, e.error()))?;
        tmp.persist(path).map_err(|e| FerryError::Io(e.error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(chunk_size: u64) -> S3Store {
        let transfer = TransferConfig {
            chunk_size,
            workers: 2,
            ..TransferConfig::default()
        };
        S3Store::new(
            "http://127.0.0.1:9000",
            "ingest",
            "us-east-1",
            "key",
            "secret",
            &transfer,
        )
        .unwrap()
    }

    #[test]
    fn rejects_invalid_endpoint() {
        let err = S3Store::new("not a url", "b", "r", "k", "s", &TransferConfig::default());
        assert!(matches!(err, Err(FerryError::Config(_))));
    }

    #[test]
    fn part_size_respects_minimum_and_part_limit() {
        let s = store(1024);
        assert_eq!(s.part_size_for(1), MIN_PART_SIZE);
        let huge = MIN_PART_SIZE * MAX_PARTS * 3;
        let part = s.part_size_for(huge);
        assert!(huge.div_ceil(part) <= MAX_PARTS);
    }
}

use std::io::Read;
use std::path::Path;
use std::time::Duration;

use crate::error::{HaulError, Result};
use crate::storage::{check_compose_fanin, glob_match, sort_by_version, ObjectStore};

const API_BASE: &str = "https://storage.googleapis.com/storage/v1";
const UPLOAD_BASE: &str = "https://storage.googleapis.com/upload/storage/v1";

/// Google Cloud Storage over the JSON API.
///
/// No retry loop lives here: the upload pipeline owns retries, so each
/// method performs exactly one request round-trip per page.
pub struct GcsStore {
    agent: ureq::Agent,
    token: String,
}

impl GcsStore {
    pub fn new(token: &str) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(300))
            .timeout_write(Duration::from_secs(300))
            .build();
        Self {
            agent,
            token: token.to_string(),
        }
    }

    fn auth(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn err(op: &str, uri: &str, e: ureq::Error) -> HaulError {
        HaulError::Storage(format!("GCS {op} {uri}: {e}"))
    }
}

/// Split `gs://bucket/object` into `(bucket, object)`.
fn parse_gs(uri: &str) -> Result<(&str, &str)> {
    let rest = uri
        .strip_prefix("gs://")
        .ok_or_else(|| HaulError::Storage(format!("not a gs:// URI: '{uri}'")))?;
    let (bucket, object) = rest.split_once('/').unwrap_or((rest, ""));
    if bucket.is_empty() || object.is_empty() {
        return Err(HaulError::Storage(format!(
            "gs:// URI needs bucket and object: '{uri}'"
        )));
    }
    Ok((bucket, object))
}

/// Percent-encode an object name for use as a single URL path segment.
fn encode_object(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for &b in name.as_bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Whether an HTTP error is transient (callers may choose to retry).
pub fn is_retryable(err: &ureq::Error) -> bool {
    match err {
        ureq::Error::Transport(_) => true,
        ureq::Error::Status(code, _) => *code == 429 || *code >= 500,
    }
}

impl ObjectStore for GcsStore {
    fn exists(&self, uri: &str) -> Result<bool> {
        let (bucket, object) = parse_gs(uri)?;
        let url = format!("{API_BASE}/b/{bucket}/o/{}", encode_object(object));
        match self
            .agent
            .get(&url)
            .set("Authorization", &self.auth())
            .call()
        {
            Ok(_) => Ok(true),
            Err(ureq::Error::Status(404, _)) => Ok(false),
            Err(e) => Err(Self::err("HEAD", uri, e)),
        }
    }

    fn upload(&self, local: &Path, uri: &str) -> Result<()> {
        let mut file = std::fs::File::open(local)?;
        self.upload_stream(&mut file, uri)
    }

    fn upload_stream(&self, reader: &mut dyn Read, uri: &str) -> Result<()> {
        let (bucket, object) = parse_gs(uri)?;
        let url = format!(
            "{UPLOAD_BASE}/b/{bucket}/o?uploadType=media&name={}",
            encode_object(object)
        );
        self.agent
            .post(&url)
            .set("Authorization", &self.auth())
            .set("Content-Type", "application/octet-stream")
            .send(reader)
            .map_err(|e| Self::err("PUT", uri, e))?;
        Ok(())
    }

    fn list(&self, prefix: &str, glob: &str) -> Result<Vec<String>> {
        let (bucket, object_prefix) = parse_gs(prefix)?;
        // Anchor at the directory boundary so `parts` never matches a
        // sibling like `parts-old`.
        let object_prefix = format!("{}/", object_prefix.trim_end_matches('/'));
        let object_prefix = object_prefix.as_str();
        let mut uris = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut req = self
                .agent
                .get(&format!("{API_BASE}/b/{bucket}/o"))
                .set("Authorization", &self.auth())
                .query("prefix", object_prefix)
                .query("fields", "items(name),nextPageToken");
            if let Some(ref token) = page_token {
                req = req.query("pageToken", token);
            }
            let body: serde_json::Value = req
                .call()
                .map_err(|e| Self::err("LIST", prefix, e))?
                .into_json()
                .map_err(HaulError::Io)?;

            if let Some(items) = body.get("items").and_then(|v| v.as_array()) {
                for item in items {
                    let Some(name) = item.get("name").and_then(|v| v.as_str()) else {
                        continue;
                    };
                    let base = name.rsplit('/').next().unwrap_or(name);
                    if glob_match(glob, base) {
                        uris.push(format!("gs://{bucket}/{name}"));
                    }
                }
            }
            match body.get("nextPageToken").and_then(|v| v.as_str()) {
                Some(token) => page_token = Some(token.to_string()),
                None => break,
            }
        }
        sort_by_version(&mut uris);
        Ok(uris)
    }

    fn compose(&self, target: &str, sources: &[String]) -> Result<()> {
        check_compose_fanin(sources)?;
        let (bucket, target_object) = parse_gs(target)?;

        let mut source_objects = Vec::with_capacity(sources.len());
        for source in sources {
            let (source_bucket, source_object) = parse_gs(source)?;
            if source_bucket != bucket {
                return Err(HaulError::ComposeFailed(format!(
                    "source '{source}' is not in bucket '{bucket}'"
                )));
            }
            source_objects.push(serde_json::json!({ "name": source_object }));
        }

        let url = format!(
            "{API_BASE}/b/{bucket}/o/{}/compose",
            encode_object(target_object)
        );
        let body = serde_json::json!({
            "sourceObjects": source_objects,
            "destination": { "contentType": "application/octet-stream" },
        });
        self.agent
            .post(&url)
            .set("Authorization", &self.auth())
            .send_json(body)
            .map_err(|e| HaulError::ComposeFailed(format!("{target}: {e}")))?;
        Ok(())
    }

    fn delete(&self, uri: &str) -> Result<()> {
        let (bucket, object) = parse_gs(uri)?;
        let url = format!("{API_BASE}/b/{bucket}/o/{}", encode_object(object));
        match self
            .agent
            .delete(&url)
            .set("Authorization", &self.auth())
            .call()
        {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(404, _)) => Ok(()),
            Err(e) => Err(Self::err("DELETE", uri, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_gs_splits_bucket_and_object() {
        let (b, o) = parse_gs("gs://bkt/runs/R1/parts/1_part-1.tar.gz").unwrap();
        assert_eq!(b, "bkt");
        assert_eq!(o, "runs/R1/parts/1_part-1.tar.gz");
    }

    #[test]
    fn parse_gs_rejects_bucket_only_and_foreign_schemes() {
        assert!(parse_gs("gs://bkt").is_err());
        assert!(parse_gs("gs://bkt/").is_err());
        assert!(parse_gs("/local/path").is_err());
    }

    #[test]
    fn object_names_are_path_encoded() {
        assert_eq!(encode_object("a/b c.tar.gz"), "a%2Fb%20c.tar.gz");
        assert_eq!(encode_object("plain-name_1.0~x"), "plain-name_1.0~x");
    }
}

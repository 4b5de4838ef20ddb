pub mod gcs_backend;
pub mod local_backend;

use std::cmp::Ordering;
use std::io::Read;
use std::path::Path;

use url::Url;

use crate::error::{HaulError, Result};

/// Hard bound on the number of sources a single compose call may carry,
/// matching the store's server-side limit.
pub const COMPOSE_FANIN_MAX: usize = 32;

/// Abstract object store addressed by full URIs (`gs://bucket/key` or a
/// local filesystem path for tests and dev runs).
///
/// Every operation is idempotent at the caller's level: callers check
/// `exists` before paying cost, and transient failures are retried by the
/// upload pipeline, not here.
pub trait ObjectStore: Send + Sync {
    /// Check whether an object exists.
    fn exists(&self, uri: &str) -> Result<bool>;

    /// Upload a local file, creating or overwriting the object.
    fn upload(&self, local: &Path, uri: &str) -> Result<()>;

    /// Streaming upload of arbitrary bytes.
    fn upload_stream(&self, reader: &mut dyn Read, uri: &str) -> Result<()>;

    /// List objects under a prefix whose basename matches `glob`
    /// (`*`-wildcards only), ordered by version order of the basename.
    fn list(&self, prefix: &str, glob: &str) -> Result<Vec<String>>;

    /// Server-side concatenation of `sources` (left to right) into `target`.
    /// Fails when `sources.len() > COMPOSE_FANIN_MAX`.
    fn compose(&self, target: &str, sources: &[String]) -> Result<()>;

    /// Delete an object. Deleting a missing object is not an error.
    fn delete(&self, uri: &str) -> Result<()>;

    /// Delete several objects.
    fn delete_many(&self, uris: &[String]) -> Result<()> {
        for uri in uris {
            self.delete(uri)?;
        }
        Ok(())
    }
}

/// Shared fan-in guard for compose implementations.
pub(crate) fn check_compose_fanin(sources: &[String]) -> Result<()> {
    if sources.len() > COMPOSE_FANIN_MAX {
        return Err(HaulError::ComposeFailed(format!(
            "{} sources exceeds the per-call fan-in bound of {COMPOSE_FANIN_MAX}",
            sources.len()
        )));
    }
    if sources.is_empty() {
        return Err(HaulError::ComposeFailed("no sources".into()));
    }
    Ok(())
}

/// Parsed destination prefix.
#[derive(Debug, Clone, PartialEq)]
pub enum Destination {
    /// Local filesystem directory (bare path or `file://`).
    Local { root: String },
    /// Google Cloud Storage: `gs://bucket[/prefix]`.
    Gcs { bucket: String, root: String },
}

/// Parse a destination prefix into its components.
pub fn parse_destination(raw: &str) -> Result<Destination> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(HaulError::BadArguments(
            "destination prefix must not be empty".into(),
        ));
    }

    if !trimmed.contains("://") {
        return Ok(Destination::Local {
            root: trimmed.to_string(),
        });
    }

    let url = Url::parse(trimmed)
        .map_err(|e| HaulError::BadArguments(format!("invalid destination '{trimmed}': {e}")))?;
    match url.scheme() {
        "file" => Ok(Destination::Local {
            root: url.path().to_string(),
        }),
        "gs" => {
            let bucket = url
                .host_str()
                .ok_or_else(|| HaulError::BadArguments("gs:// URL is missing a bucket".into()))?
                .to_string();
            let root = url.path().trim_matches('/').to_string();
            Ok(Destination::Gcs { bucket, root })
        }
        other => Err(HaulError::BadArguments(format!(
            "unsupported destination scheme: '{other}'"
        ))),
    }
}

/// Build a store for a destination. The controller only ever talks to the
/// trait object.
pub fn store_for_destination(
    dest: &Destination,
    gcs_bearer_token: Option<&str>,
) -> Result<Box<dyn ObjectStore>> {
    match dest {
        Destination::Local { .. } => Ok(Box::new(local_backend::LocalStore::new())),
        Destination::Gcs { .. } => {
            let token = gcs_bearer_token.ok_or_else(|| {
                HaulError::Config("gs:// destination requires a bearer token".into())
            })?;
            Ok(Box::new(gcs_backend::GcsStore::new(token)))
        }
    }
}

/// Final path segment of a URI or path.
pub(crate) fn basename(uri: &str) -> &str {
    uri.rsplit('/').next().unwrap_or(uri)
}

/// Natural/version ordering: digit runs compare numerically, everything
/// else bytewise. `2_part` sorts before `10_part`.
pub fn version_cmp(a: &str, b: &str) -> Ordering {
    let (mut ab, mut bb) = (a.as_bytes(), b.as_bytes());
    loop {
        match (ab.first(), bb.first()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(&x), Some(&y)) => {
                if x.is_ascii_digit() && y.is_ascii_digit() {
                    let (na, rest_a) = take_number(ab);
                    let (nb, rest_b) = take_number(bb);
                    match na.cmp(&nb) {
                        Ordering::Equal => {
                            ab = rest_a;
                            bb = rest_b;
                        }
                        ord => return ord,
                    }
                } else {
                    match x.cmp(&y) {
                        Ordering::Equal => {
                            ab = &ab[1..];
                            bb = &bb[1..];
                        }
                        ord => return ord,
                    }
                }
            }
        }
    }
}

fn take_number(bytes: &[u8]) -> (u128, &[u8]) {
    let end = bytes
        .iter()
        .position(|b| !b.is_ascii_digit())
        .unwrap_or(bytes.len());
    let mut value: u128 = 0;
    for &b in &bytes[..end] {
        value = value.saturating_mul(10).saturating_add((b - b'0') as u128);
    }
    (value, &bytes[end..])
}

/// `*`-only glob matching against a basename.
pub(crate) fn glob_match(pattern: &str, name: &str) -> bool {
    fn inner(p: &[u8], n: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&p[1..], n) || (!n.is_empty() && inner(p, &n[1..])),
            (Some(&pc), Some(&nc)) if pc == nc => inner(&p[1..], &n[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), name.as_bytes())
}

/// Sort URIs by version order of their final path segment.
pub(crate) fn sort_by_version(uris: &mut [String]) {
    uris.sort_by(|a, b| version_cmp(basename(a), basename(b)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_local_bare_path() {
        let d = parse_destination("/data/uploads/").unwrap();
        assert_eq!(
            d,
            Destination::Local {
                root: "/data/uploads".into()
            }
        );
    }

    #[test]
    fn parse_gs_with_prefix() {
        let d = parse_destination("gs://my-bucket/runs/2024").unwrap();
        assert_eq!(
            d,
            Destination::Gcs {
                bucket: "my-bucket".into(),
                root: "runs/2024".into()
            }
        );
    }

    #[test]
    fn parse_gs_bucket_only() {
        let d = parse_destination("gs://my-bucket").unwrap();
        assert_eq!(
            d,
            Destination::Gcs {
                bucket: "my-bucket".into(),
                root: String::new()
            }
        );
    }

    #[test]
    fn parse_rejects_unknown_scheme() {
        assert!(parse_destination("s3://bucket/x").is_err());
        assert!(parse_destination("   ").is_err());
    }

    #[test]
    fn version_order_is_numeric_aware() {
        let mut v = vec![
            "s/10_part-1.tar.gz".to_string(),
            "s/2_part-1.tar.gz".to_string(),
            "s/1_part-1.tar.gz".to_string(),
        ];
        sort_by_version(&mut v);
        assert_eq!(
            v,
            vec![
                "s/1_part-1.tar.gz".to_string(),
                "s/2_part-1.tar.gz".to_string(),
                "s/10_part-1.tar.gz".to_string(),
            ]
        );
    }

    #[test]
    fn version_cmp_mixed_text() {
        assert_eq!(version_cmp("C9.1", "C10.1"), Ordering::Less);
        assert_eq!(version_cmp("C10.2", "C10.10"), Ordering::Less);
        assert_eq!(version_cmp("a", "b"), Ordering::Less);
        assert_eq!(version_cmp("a1", "a1"), Ordering::Equal);
    }

    #[test]
    fn glob_star_suffix() {
        assert!(glob_match("*.tar.gz", "170000_part-1.tar.gz"));
        assert!(!glob_match("*.tar.gz", "x.tar.gz.tmp"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("a*c", "abc"));
        assert!(!glob_match("a*c", "abd"));
    }

    #[test]
    fn fanin_guard() {
        let ok: Vec<String> = (0..32).map(|i| format!("s{i}")).collect();
        assert!(check_compose_fanin(&ok).is_ok());
        let over: Vec<String> = (0..33).map(|i| format!("s{i}")).collect();
        assert!(check_compose_fanin(&over).is_err());
        assert!(check_compose_fanin(&[]).is_err());
    }
}

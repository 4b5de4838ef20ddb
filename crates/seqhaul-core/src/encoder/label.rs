//! Volume-label encoding for chunk provenance.
//!
//! A tar volume label holds at most 99 bytes, so the provenance record
//! degrades through three forms: compact JSON, pipe-delimited, and a
//! gzip+base64 envelope as the last resort.

use std::io::Write;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const LABEL_MAX: usize = 99;

/// Provenance carried by every chunk's volume label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMeta {
    #[serde(rename = "r")]
    pub run_id_short: String,
    /// Unix epoch seconds of the snapshot.
    #[serde(rename = "t")]
    pub timestamp: i64,
    /// Increment number, 1-based.
    #[serde(rename = "i")]
    pub increment: u64,
    #[serde(rename = "h")]
    pub host: String,
    #[serde(rename = "u")]
    pub user: String,
    #[serde(rename = "ip")]
    pub ip: String,
    /// 1 when launched from cron, else 0.
    #[serde(rename = "c")]
    pub cron: u8,
}

/// Encode the label, degrading until it fits in 99 bytes. Every form,
/// including the compressed last resort, honors the bound.
pub fn encode_label(meta: &ChunkMeta) -> Result<String> {
    let json = serde_json::to_string(meta)?;
    if json.len() <= LABEL_MAX {
        return Ok(json);
    }

    let piped = pipe_form(meta);
    if piped.len() <= LABEL_MAX {
        return Ok(piped);
    }

    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(json.as_bytes())?;
    let enveloped = format!("gz:{}", BASE64.encode(gz.finish()?));
    if enveloped.len() <= LABEL_MAX {
        return Ok(enveloped);
    }

    // Even compressed the record is too big. Shed identity detail until
    // the pipe form fits; the numeric fields alone stay far under the
    // limit, so the empty-cap pass always succeeds.
    let mut shortened = meta.clone();
    for cap in [32, 16, 8, 4] {
        shorten_fields(&mut shortened, cap);
        let piped = pipe_form(&shortened);
        if piped.len() <= LABEL_MAX {
            return Ok(piped);
        }
    }
    shorten_fields(&mut shortened, 0);
    Ok(pipe_form(&shortened))
}

fn pipe_form(meta: &ChunkMeta) -> String {
    format!(
        "{}|{}|{}|{}|{}|{}|{}",
        meta.run_id_short, meta.timestamp, meta.increment, meta.host, meta.user, meta.ip, meta.cron
    )
}

fn shorten_fields(meta: &mut ChunkMeta, cap: usize) {
    for field in [
        &mut meta.run_id_short,
        &mut meta.host,
        &mut meta.user,
        &mut meta.ip,
    ] {
        // Pop chars rather than slice so multibyte values stay valid.
        while field.len() > cap {
            field.pop();
        }
    }
}

/// Decode any of the three label forms.
pub fn decode_label(label: &str) -> Option<ChunkMeta> {
    if let Some(b64) = label.strip_prefix("gz:") {
        let compressed = BASE64.decode(b64).ok()?;
        let mut gz = flate2::read::GzDecoder::new(compressed.as_slice());
        let mut json = String::new();
        std::io::Read::read_to_string(&mut gz, &mut json).ok()?;
        return serde_json::from_str(&json).ok();
    }
    if label.starts_with('{') {
        return serde_json::from_str(label).ok();
    }
    let mut parts = label.split('|');
    Some(ChunkMeta {
        run_id_short: parts.next()?.to_string(),
        timestamp: parts.next()?.parse().ok()?,
        increment: parts.next()?.parse().ok()?,
        host: parts.next()?.to_string(),
        user: parts.next()?.to_string(),
        ip: parts.next()?.to_string(),
        cron: parts.next()?.parse().ok()?,
    })
}

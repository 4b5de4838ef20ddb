//! Provenance sidecars published next to the final archive.

use serde::Serialize;
use tracing::info;

use crate::config::UploaderConfig;
use crate::error::Result;
use crate::paths::RunPaths;
use crate::storage::ObjectStore;

/// Everything the provenance JSON records about a completed upload.
#[derive(Debug, Serialize)]
pub struct Provenance<'a> {
    pub run_basename: &'a str,
    pub run_path: &'a str,
    pub destination: &'a str,
    pub started_at: String,
    pub finished_at: String,
    pub duration_secs: u64,
    pub increments: u64,
    pub total_source_bytes: u64,
    pub cron_invoked: bool,
    pub host: &'a str,
    pub user: &'a str,
    pub ip: &'a str,
    pub os: &'a str,
    pub arch: &'a str,
    pub uploader_version: &'a str,
    pub config: &'a UploaderConfig,
    pub exclusions: &'a [String],
}

/// Publish the README, provenance JSON, and table-import TSV.
pub fn emit_all(
    store: &dyn ObjectStore,
    paths: &RunPaths,
    provenance: &Provenance<'_>,
    terra_table: &str,
) -> Result<()> {
    let readme = readme_text(&paths.run_id);
    store.upload_stream(&mut readme.as_bytes(), &paths.readme_uri())?;

    let json = serde_json::to_vec_pretty(provenance)?;
    store.upload_stream(&mut json.as_slice(), &paths.metadata_uri())?;

    let tsv = terra_tsv(terra_table, &paths.run_id, &paths.final_uri());
    store.upload_stream(&mut tsv.as_bytes(), &paths.terra_uri())?;

    info!(run = %paths.run_id, "sidecars published");
    Ok(())
}

fn readme_text(run_id: &str) -> String {
    format!(
        "{run_id}.tar.gz is a concatenation of gzipped incremental tar\n\
         segments produced while the sequencer was still writing.\n\
         \n\
         Extract with any tar that accepts multi-member gzip input:\n\
         \n\
             tar -xzf {run_id}.tar.gz --ignore-zeros\n\
         \n\
         Later segments may re-deliver files that grew between snapshots;\n\
         extraction order guarantees the newest version wins.\n"
    )
}

/// Two-line tabular import file. LF endings only; the data row carries
/// the run id and archive URI, every other column stays empty.
fn terra_tsv(table: &str, run_id: &str, final_uri: &str) -> String {
    format!(
        "entity:{table}_id\tbiosample_attributes\tflowcell_tar\tsamplesheets\tsample_rename_map_tsv\n\
         {run_id}\t\t{final_uri}\t\t\n"
    )
}

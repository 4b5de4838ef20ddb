//! Remote object layout for one run.

use crate::storage::Destination;

/// All object URIs published for a run live under
/// `<destination_prefix>/<run_id>/`.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub run_id: String,
    remote_dir: String,
}

impl RunPaths {
    pub fn new(run_id: &str, destination: &Destination) -> Self {
        let remote_dir = match destination {
            Destination::Local { root } => format!("{root}/{run_id}"),
            Destination::Gcs { bucket, root } if root.is_empty() => {
                format!("gs://{bucket}/{run_id}")
            }
            Destination::Gcs { bucket, root } => format!("gs://{bucket}/{root}/{run_id}"),
        };
        Self {
            run_id: run_id.to_string(),
            remote_dir,
        }
    }

    /// Truncated run id used in volume labels, where space is scarce.
    pub fn run_id_short(&self) -> &str {
        self.run_id.get(..16).unwrap_or(&self.run_id)
    }

    pub fn final_uri(&self) -> String {
        format!("{}/{}.tar.gz", self.remote_dir, self.run_id)
    }

    pub fn parts_prefix(&self) -> String {
        format!("{}/parts", self.remote_dir)
    }

    pub fn samplesheet_uri(&self) -> String {
        format!("{}/{}_SampleSheet.csv", self.remote_dir, self.run_id)
    }

    pub fn runinfo_uri(&self) -> String {
        format!("{}/{}_RunInfo.xml", self.remote_dir, self.run_id)
    }

    pub fn readme_uri(&self) -> String {
        format!("{}/{}.tar.gz.README.txt", self.remote_dir, self.run_id)
    }

    pub fn metadata_uri(&self) -> String {
        format!("{}/{}.upload_metadata.json", self.remote_dir, self.run_id)
    }

    pub fn terra_uri(&self) -> String {
        format!("{}/{}.terra.tsv", self.remote_dir, self.run_id)
    }
}

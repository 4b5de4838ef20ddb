//! Static and dynamic exclusion planning for one snapshot.
//!
//! Dynamic rules only apply to non-final snapshots: the newest cycle
//! directory is still being written by the instrument, and very recently
//! modified files may be mid-write. The final snapshot takes everything,
//! so nothing deferred here is ever lost.

use std::path::Path;
use std::time::{Duration, SystemTime};

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use tracing::debug;

use crate::error::{HaulError, Result};

/// Lane directories holding per-cycle base-call output.
const BASECALLS_SUBDIR: &str = "Data/Intensities/BaseCalls";

/// Materialized exclusion set consumed by the encoder.
#[derive(Debug, Clone)]
pub struct ExclusionPlan {
    /// Gitignore-style patterns: bare names match anywhere, anchored
    /// patterns pin the newest cycle directory per lane.
    pub patterns: Vec<String>,
    /// Files with mtime at or after this instant are deferred.
    pub recent_cutoff: Option<SystemTime>,
}

impl ExclusionPlan {
    /// Compute the plan for one snapshot.
    pub fn compute(
        source_root: &Path,
        static_exclusions: &[String],
        recent_window: Duration,
        is_final: bool,
    ) -> Self {
        let mut patterns: Vec<String> = static_exclusions.to_vec();
        let mut recent_cutoff = None;

        if !is_final {
            if let Some((major, minor)) = newest_cycle(source_root) {
                debug!(major, minor, "deferring newest base-call cycle");
                patterns.push(format!("/{BASECALLS_SUBDIR}/L*/C{major}.{minor}/"));
            }
            recent_cutoff = SystemTime::now().checked_sub(recent_window);
        }

        Self {
            patterns,
            recent_cutoff,
        }
    }

    /// Build the matcher for this plan, rooted at the source.
    pub fn matcher(&self, source_root: &Path) -> Result<Gitignore> {
        let mut builder = GitignoreBuilder::new(source_root);
        for pattern in &self.patterns {
            builder
                .add_line(None, pattern)
                .map_err(|e| HaulError::Config(format!("invalid exclude pattern '{pattern}': {e}")))?;
        }
        builder
            .build()
            .map_err(|e| HaulError::Config(format!("exclude matcher build failed: {e}")))
    }

    /// Whether a file modified at `mtime` falls inside the deferral window.
    pub fn is_too_recent(&self, mtime: SystemTime) -> bool {
        match self.recent_cutoff {
            Some(cutoff) => mtime >= cutoff,
            None => false,
        }
    }
}

/// Highest `C<major>.<minor>` cycle directory across all lanes, or `None`
/// when the base-call tree does not exist yet.
fn newest_cycle(source_root: &Path) -> Option<(u32, u32)> {
    let basecalls = source_root.join(BASECALLS_SUBDIR);
    let lanes = std::fs::read_dir(&basecalls).ok()?;

    let mut newest: Option<(u32, u32)> = None;
    for lane in lanes.flatten() {
        let name = lane.file_name();
        if !name.to_string_lossy().starts_with('L') {
            continue;
        }
        let Ok(cycles) = std::fs::read_dir(lane.path()) else {
            continue;
        };
        for cycle in cycles.flatten() {
            let cycle_name = cycle.file_name();
            if let Some(version) = parse_cycle_name(&cycle_name.to_string_lossy()) {
                if newest.map_or(true, |best| version > best) {
                    newest = Some(version);
                }
            }
        }
    }
    newest
}

/// Parse `C<major>.<minor>`, e.g. `C102.1` -> `(102, 1)`.
fn parse_cycle_name(name: &str) -> Option<(u32, u32)> {
    let rest = name.strip_prefix('C')?;
    let (major, minor) = rest.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch_dir(path: &Path) {
        std::fs::create_dir_all(path).unwrap();
    }

    #[test]
    fn parse_cycle_names() {
        assert_eq!(parse_cycle_name("C1.1"), Some((1, 1)));
        assert_eq!(parse_cycle_name("C102.3"), Some((102, 3)));
        assert_eq!(parse_cycle_name("C1"), None);
        assert_eq!(parse_cycle_name("X1.1"), None);
        assert_eq!(parse_cycle_name("C1.x"), None);
    }

    #[test]
    fn newest_cycle_spans_lanes() {
        let dir = tempfile::tempdir().unwrap();
        let bc = dir.path().join(BASECALLS_SUBDIR);
        touch_dir(&bc.join("L001/C1.1"));
        touch_dir(&bc.join("L001/C9.1"));
        touch_dir(&bc.join("L002/C10.1"));
        touch_dir(&bc.join("L002/C2.1"));
        assert_eq!(newest_cycle(dir.path()), Some((10, 1)));
    }

    #[test]
    fn newest_cycle_absent_tree() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(newest_cycle(dir.path()), None);
    }

    #[test]
    fn final_plan_has_no_dynamic_rules() {
        let dir = tempfile::tempdir().unwrap();
        touch_dir(&dir.path().join(BASECALLS_SUBDIR).join("L001/C5.1"));
        let statics = vec!["Logs".to_string()];

        let plan = ExclusionPlan::compute(dir.path(), &statics, Duration::from_secs(180), true);
        assert_eq!(plan.patterns, statics);
        assert!(plan.recent_cutoff.is_none());
        assert!(!plan.is_too_recent(SystemTime::now()));
    }

    #[test]
    fn non_final_plan_defers_newest_cycle_and_recent_files() {
        let dir = tempfile::tempdir().unwrap();
        let bc = dir.path().join(BASECALLS_SUBDIR);
        touch_dir(&bc.join("L001/C3.1"));
        touch_dir(&bc.join("L002/C7.1"));

        let plan = ExclusionPlan::compute(
            dir.path(),
            &["Logs".to_string()],
            Duration::from_secs(180),
            false,
        );
        assert!(plan
            .patterns
            .iter()
            .any(|p| p.contains("L*/C7.1")));
        assert!(plan.is_too_recent(SystemTime::now()));
        let old = SystemTime::now() - Duration::from_secs(3600);
        assert!(!plan.is_too_recent(old));
    }

    #[test]
    fn matcher_excludes_static_names_anywhere() {
        let dir = tempfile::tempdir().unwrap();
        let plan = ExclusionPlan {
            patterns: vec!["Logs".to_string(), "Thumbnail_Images".to_string()],
            recent_cutoff: None,
        };
        let matcher = plan.matcher(dir.path()).unwrap();
        assert!(matcher
            .matched_path_or_any_parents(Path::new("Logs"), true)
            .is_ignore());
        assert!(matcher
            .matched_path_or_any_parents(Path::new("Data/Logs/x.txt"), false)
            .is_ignore());
        assert!(!matcher
            .matched_path_or_any_parents(Path::new("Data/RunInfo.xml"), false)
            .is_ignore());
    }

    #[test]
    fn matcher_pins_cycle_dir_per_lane() {
        let dir = tempfile::tempdir().unwrap();
        let plan = ExclusionPlan {
            patterns: vec![format!("/{BASECALLS_SUBDIR}/L*/C7.1/")],
            recent_cutoff: None,
        };
        let matcher = plan.matcher(dir.path()).unwrap();
        let hit = Path::new("Data/Intensities/BaseCalls/L001/C7.1");
        let miss = Path::new("Data/Intensities/BaseCalls/L001/C6.1");
        assert!(matcher.matched_path_or_any_parents(hit, true).is_ignore());
        assert!(!matcher.matched_path_or_any_parents(miss, true).is_ignore());
    }
}

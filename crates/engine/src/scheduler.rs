//! Scheduler profile names read from a `KubeSchedulerConfiguration`.
//!
//! Pods handled by one of these profiles are expected to get bound by the destination's
//! scheduler, so pod readiness waits for `spec.nodeName`.

use std::io::ErrorKind;
use std::path::Path;

use kcopy_core::{CopyError, CopyOutcome};
use serde::Deserialize;
use tracing::{info, warn};

pub const DEFAULT_SCHEDULER_NAME: &str = "default-scheduler";

#[derive(Debug, Deserialize)]
struct SchedulerConfigFile {
    #[serde(default)]
    profiles: Vec<ProfileEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileEntry {
    scheduler_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerProfiles {
    names: Vec<String>,
}

impl SchedulerProfiles {
    pub fn parse(yaml: &str) -> CopyOutcome<Self> {
        let file: SchedulerConfigFile = serde_yaml::from_str(yaml)
            .map_err(|e| CopyError::Configuration(format!("invalid scheduler configuration: {e}")))?;
        let mut names: Vec<String> = file
            .profiles
            .into_iter()
            .map(|p| p.scheduler_name.unwrap_or_else(|| DEFAULT_SCHEDULER_NAME.to_string()))
            .collect();
        // kube-scheduler runs a single default profile when none are configured
        if names.is_empty() {
            names.push(DEFAULT_SCHEDULER_NAME.to_string());
        }
        names.sort();
        names.dedup();
        Ok(Self { names })
    }

    /// Load the file if given; a missing file means "no profiles known".
    pub fn load_optional(path: Option<&Path>) -> CopyOutcome<Self> {
        let Some(path) = path else { return Ok(Self::default()) };
        match std::fs::read_to_string(path) {
            Ok(body) => {
                let profiles = Self::parse(&body)?;
                info!(path = %path.display(), profiles = ?profiles.names, "scheduler configuration loaded");
                Ok(profiles)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(path = %path.display(), "scheduler configuration not found; pod readiness checks presence only");
                Ok(Self::default())
            }
            Err(e) => Err(CopyError::Configuration(format!("reading scheduler configuration {}: {e}", path.display()))),
        }
    }

    pub fn names(&self) -> &[String] { &self.names }

    pub fn is_empty(&self) -> bool { self.names.is_empty() }

    /// Whether a pod with this `spec.schedulerName` is expected to be bound.
    pub fn schedules(&self, scheduler_name: Option<&str>) -> bool {
        let name = scheduler_name.unwrap_or(DEFAULT_SCHEDULER_NAME);
        self.names.iter().any(|n| n == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_profile_names() {
        let yaml = r#"
apiVersion: kubescheduler.config.k8s.io/v1
kind: KubeSchedulerConfiguration
profiles:
  - schedulerName: default-scheduler
  - schedulerName: bin-packing
    plugins:
      score:
        enabled:
          - name: NodeResourcesFit
"#;
        let p = SchedulerProfiles::parse(yaml).unwrap();
        assert_eq!(p.names(), ["bin-packing".to_string(), "default-scheduler".to_string()]);
        assert!(p.schedules(None));
        assert!(p.schedules(Some("bin-packing")));
        assert!(!p.schedules(Some("other")));
    }

    #[test]
    fn no_profiles_means_default_profile() {
        let p = SchedulerProfiles::parse("apiVersion: kubescheduler.config.k8s.io/v1\nkind: KubeSchedulerConfiguration\n").unwrap();
        assert_eq!(p.names(), [DEFAULT_SCHEDULER_NAME.to_string()]);
    }

    #[test]
    fn missing_file_is_empty_and_garbage_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("none.yaml");
        assert!(SchedulerProfiles::load_optional(Some(&missing)).unwrap().is_empty());
        assert!(SchedulerProfiles::load_optional(None).unwrap().is_empty());
        let bad = dir.path().join("bad.yaml");
        std::fs::write(&bad, "profiles: 12\n").unwrap();
        assert!(matches!(SchedulerProfiles::load_optional(Some(&bad)), Err(CopyError::Configuration(_))));
    }
}

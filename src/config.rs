//! Invocation settings and environment-driven toggles.
//!
//! Three environment variables influence a run, each with a single
//! documented effect:
//!
//! | Variable | Effect |
//! |----------|--------|
//! | `VERSION` | Overrides the version used for the target output tag |
//! | `REPORT` | `true` switches the vulnerability scan from gate mode to full-report mode |
//! | `POLICY_TEST` | `true` enables the cluster admission-policy dry-run sub-check |

use std::path::PathBuf;

/// Default location of the durable baseline record.
pub const DEFAULT_BASELINE_PATH: &str = "builddata/baseline.json";

/// Default build template and its pinned output.
pub const DEFAULT_TEMPLATE_PATH: &str = "docker/hardened.Dockerfile";
pub const DEFAULT_OUTPUT_PATH: &str = "docker/hardened.pinned.Dockerfile";

/// Well-known location of the ephemeral per-run build metadata.
pub const DEFAULT_METADATA_PATH: &str = "builddata/buildmeta.json";

/// Default pod manifest for the admission-policy dry-run.
pub const DEFAULT_POLICY_MANIFEST: &str = "policy/pod-readonly.yaml";

/// Environment-driven toggles, read once per invocation.
#[derive(Debug, Clone, Default)]
pub struct EnvToggles {
    pub version_override: Option<String>,
    pub report_mode: bool,
    pub policy_test: bool,
}

impl EnvToggles {
    pub fn from_env() -> Self {
        Self {
            version_override: std::env::var("VERSION").ok().filter(|v| !v.is_empty()),
            report_mode: flag_set("REPORT"),
            policy_test: flag_set("POLICY_TEST"),
        }
    }
}

fn flag_set(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Resolved per-invocation settings: the tracked upstream image, the
/// hardened output repository, and all file locations.
#[derive(Debug, Clone)]
pub struct Settings {
    pub repository: String,
    pub tag: String,
    pub image_repo: String,
    pub baseline_path: PathBuf,
    pub template_path: PathBuf,
    pub output_path: PathBuf,
    pub metadata_path: PathBuf,
    pub policy_manifest: PathBuf,
    pub toggles: EnvToggles,
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; each touches only its own
    // variable and removes it afterwards.

    #[test]
    fn test_flag_set_accepts_mixed_case_true() {
        std::env::set_var("HARDPIN_TEST_FLAG_A", "TRUE");
        assert!(flag_set("HARDPIN_TEST_FLAG_A"));
        std::env::set_var("HARDPIN_TEST_FLAG_A", " true ");
        assert!(flag_set("HARDPIN_TEST_FLAG_A"));
        std::env::remove_var("HARDPIN_TEST_FLAG_A");
    }

    #[test]
    fn test_flag_set_rejects_other_values() {
        std::env::set_var("HARDPIN_TEST_FLAG_B", "1");
        assert!(!flag_set("HARDPIN_TEST_FLAG_B"));
        std::env::set_var("HARDPIN_TEST_FLAG_B", "yes");
        assert!(!flag_set("HARDPIN_TEST_FLAG_B"));
        std::env::remove_var("HARDPIN_TEST_FLAG_B");
        assert!(!flag_set("HARDPIN_TEST_FLAG_B"));
    }
}

//! External tool availability detection.
//!
//! The pipeline delegates to three external tools: `docker` (engine, buildx,
//! manifest inspection), `trivy` (vulnerability scanning), and `kubectl`
//! (admission-policy dry-runs). This module probes whether each is installed
//! and reachable on `$PATH` so the `doctor` command can produce actionable
//! diagnostics instead of an opaque OS error mid-run.
//!
//! Each tool is probed by spawning it with a version flag. A non-zero exit
//! code is acceptable; only a launch failure counts as "unavailable".

use crate::exec;

/// Summary of which external tools are available on `$PATH`.
#[derive(Debug, Clone)]
pub struct ToolAvailability {
    /// `docker` is installed and executable.
    pub docker: bool,
    /// `trivy` is installed and executable.
    pub trivy: bool,
    /// `kubectl` is installed and executable.
    pub kubectl: bool,
}

impl ToolAvailability {
    /// True when everything the full pipeline can reach for is present.
    pub fn all_available(&self) -> bool {
        self.docker && self.trivy && self.kubectl
    }

    /// True when the tools every run needs unconditionally are present.
    /// `kubectl` is only exercised when the admission dry-run is enabled.
    pub fn required_available(&self) -> bool {
        self.docker && self.trivy
    }

    /// Returns a human-readable summary of missing tools with install hints.
    pub fn missing_tools_report(&self) -> Vec<String> {
        let mut missing = Vec::new();
        if !self.docker {
            missing.push(
                "docker: not found. Install: https://docs.docker.com/engine/install/".to_string(),
            );
        }
        if !self.trivy {
            missing.push(
                "trivy: not found. Install: https://aquasecurity.github.io/trivy/latest/getting-started/installation/"
                    .to_string(),
            );
        }
        if !self.kubectl {
            missing.push(
                "kubectl: not found (only needed for POLICY_TEST=true). Install: https://kubernetes.io/docs/tasks/tools/"
                    .to_string(),
            );
        }
        missing
    }
}

/// Probes `$PATH` for the external tools the pipeline delegates to.
///
/// This function never fails; a missing tool is reported as `false`, not as
/// an error.
pub fn detect_tools() -> ToolAvailability {
    ToolAvailability {
        docker: exec::probe("docker", &["version", "--format", "{{.Client.Version}}"]),
        trivy: exec::probe("trivy", &["--version"]),
        kubectl: exec::probe("kubectl", &["version", "--client"]),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_tools_does_not_panic() {
        // Smoke test: detect_tools must never fail, even when no tools
        // are installed.
        let tools = detect_tools();
        let _ = tools.all_available();
    }

    #[test]
    fn test_missing_tools_report_lists_all_when_none_available() {
        let tools = ToolAvailability {
            docker: false,
            trivy: false,
            kubectl: false,
        };
        let report = tools.missing_tools_report();
        assert_eq!(report.len(), 3);
        assert!(report[0].contains("docker"));
        assert!(report[1].contains("trivy"));
        assert!(report[2].contains("kubectl"));
    }

    #[test]
    fn test_missing_tools_report_empty_when_all_available() {
        let tools = ToolAvailability {
            docker: true,
            trivy: true,
            kubectl: true,
        };
        assert!(tools.missing_tools_report().is_empty());
    }

    #[test]
    fn test_required_does_not_include_kubectl() {
        let tools = ToolAvailability {
            docker: true,
            trivy: true,
            kubectl: false,
        };
        assert!(tools.required_available());
        assert!(!tools.all_available());
    }
}

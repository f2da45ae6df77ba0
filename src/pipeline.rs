//! The hardened-image stage machine.
//!
//! Linear, no branching: Prepare -> Build -> Verify -> Promote -> Clean.
//! The first four are hard gates; a failure aborts the run immediately,
//! labelled with the failing stage. Clean always gets its attempt in a full
//! run, but its own failure is downgraded to a warning and can neither mask
//! an earlier failure nor turn a failed run into a success.
//!
//! The orchestrator drives a [`Stages`] implementation so tests can observe
//! ordering with a recording mock; [`DockerStages`] is the real thing.

use crate::baseline::BaselineStore;
use crate::config::Settings;
use crate::error::{Error, Result, Stage};
use crate::exec;
use crate::pin::{self, BuildMetadata, DockerVersionProbe, PrepareRequest};
use crate::verify::{self, VerifyContext};
use std::fs;
use std::process::Command;
use std::time::Instant;

/// How Build materializes the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    /// Multi-architecture build for both allow-listed platforms.
    MultiArch,
    /// Single-arch build loaded into the local engine, for pre-publication
    /// validation. Never pushes.
    LocalOnly,
}

/// The stage surface the orchestrator sequences.
pub trait Stages {
    fn prepare(&mut self) -> Result<()>;
    fn build(&mut self, mode: BuildMode) -> Result<()>;
    fn verify(&mut self) -> Result<()>;
    fn promote(&mut self) -> Result<()>;
    fn clean(&mut self) -> Result<()>;
}

/// Full pipeline: all four gates, then Clean regardless of the gate result.
pub fn run_full(stages: &mut dyn Stages) -> Result<()> {
    let start = Instant::now();
    println!("Running full hardened image pipeline...");

    let gated = run_gates(stages);

    if let Err(e) = stages.clean() {
        eprintln!("cleanup stage warning: {e}");
    }

    gated?;
    println!(
        "Hardened image pipeline completed successfully in {}s",
        start.elapsed().as_secs()
    );
    Ok(())
}

/// Test variant: Prepare, local-only Build, Verify. No Promote, no Clean.
pub fn run_test(stages: &mut dyn Stages) -> Result<()> {
    let start = Instant::now();
    println!("Running hardened image build and verification...");

    stages.prepare().map_err(|e| e.in_stage(Stage::Prepare))?;
    stages
        .build(BuildMode::LocalOnly)
        .map_err(|e| e.in_stage(Stage::Build))?;
    stages.verify().map_err(|e| e.in_stage(Stage::Verify))?;

    println!(
        "Hardened image build and verification completed in {}s",
        start.elapsed().as_secs()
    );
    Ok(())
}

fn run_gates(stages: &mut dyn Stages) -> Result<()> {
    stages.prepare().map_err(|e| e.in_stage(Stage::Prepare))?;
    stages
        .build(BuildMode::MultiArch)
        .map_err(|e| e.in_stage(Stage::Build))?;
    stages.verify().map_err(|e| e.in_stage(Stage::Verify))?;
    stages.promote().map_err(|e| e.in_stage(Stage::Promote))?;
    Ok(())
}

/// Docker-backed stage implementations.
pub struct DockerStages {
    settings: Settings,
    run_id: String,
}

impl DockerStages {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            run_id: pin::new_run_id(),
        }
    }

    /// Reloads the metadata artifact, refusing one from a different run.
    fn metadata(&self) -> Result<BuildMetadata> {
        BuildMetadata::load(&self.settings.metadata_path, &self.run_id)
    }

    fn platforms_for(&self, mode: BuildMode, meta: &BuildMetadata) -> String {
        match mode {
            BuildMode::MultiArch => "linux/amd64,linux/arm64".to_string(),
            BuildMode::LocalOnly => format!("linux/{}", meta.architecture),
        }
    }
}

impl Stages for DockerStages {
    fn prepare(&mut self) -> Result<()> {
        println!("Preparing hardened build file...");
        let store = BaselineStore::new(&self.settings.baseline_path);
        let baseline = store.load()?;

        if let Some(parent) = self.settings.metadata_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| Error::io(format!("create {}", parent.display()), e))?;
            }
        }

        pin::prepare(
            &PrepareRequest {
                template_path: &self.settings.template_path,
                output_path: &self.settings.output_path,
                metadata_path: &self.settings.metadata_path,
                image_repo: &self.settings.image_repo,
                local_arch: crate::digest::local_arch(),
                version_override: self.settings.toggles.version_override.as_deref(),
                run_id: &self.run_id,
            },
            &baseline,
            &DockerVersionProbe::default(),
        )?;
        Ok(())
    }

    fn build(&mut self, mode: BuildMode) -> Result<()> {
        let meta = self.metadata()?;
        let platforms = self.platforms_for(mode, &meta);
        println!(
            "Building hardened image {} ({platforms})...",
            meta.target_tag
        );

        let mut cmd = Command::new("docker");
        cmd.args(["buildx", "build", "--file"])
            .arg(&self.settings.output_path)
            .args(["--platform", &platforms, "--tag", &meta.target_tag]);
        if mode == BuildMode::LocalOnly {
            cmd.arg("--load");
        }
        cmd.arg(".");

        exec::run_streamed(&mut cmd, "docker")?;
        println!("Build complete: {}", meta.target_tag);
        Ok(())
    }

    fn verify(&mut self) -> Result<()> {
        let meta = self.metadata()?;
        verify::verify_image(&VerifyContext {
            tag: &meta.target_tag,
            report_mode: self.settings.toggles.report_mode,
            policy_test: self.settings.toggles.policy_test,
            policy_manifest: &self.settings.policy_manifest,
        })
    }

    fn promote(&mut self) -> Result<()> {
        let meta = self.metadata()?;
        println!("Promoting verified image {}...", meta.target_tag);
        exec::run_streamed(
            Command::new("docker").args(["push", &meta.target_tag]),
            "docker",
        )?;
        println!("Image promoted successfully.");
        Ok(())
    }

    fn clean(&mut self) -> Result<()> {
        let mut first_err = None;
        for path in [&self.settings.output_path, &self.settings.metadata_path] {
            match fs::remove_file(path) {
                Ok(()) => println!("Removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    eprintln!("Failed to remove {}: {e}", path.display());
                    if first_err.is_none() {
                        first_err = Some(Error::io(format!("remove {}", path.display()), e));
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct Recording {
        calls: RefCell<Vec<&'static str>>,
        fail_at: Option<&'static str>,
        fail_clean: bool,
    }

    impl Recording {
        fn record(&self, name: &'static str) -> Result<()> {
            self.calls.borrow_mut().push(name);
            if self.fail_at == Some(name) {
                return Err(Error::PolicyViolation {
                    check: "test".into(),
                    detail: format!("{name} forced to fail"),
                });
            }
            Ok(())
        }
    }

    impl Stages for Recording {
        fn prepare(&mut self) -> Result<()> {
            self.record("prepare")
        }
        fn build(&mut self, _mode: BuildMode) -> Result<()> {
            self.record("build")
        }
        fn verify(&mut self) -> Result<()> {
            self.record("verify")
        }
        fn promote(&mut self) -> Result<()> {
            self.record("promote")
        }
        fn clean(&mut self) -> Result<()> {
            self.calls.borrow_mut().push("clean");
            if self.fail_clean {
                return Err(Error::io(
                    "remove pinned file",
                    std::io::Error::other("disk says no"),
                ));
            }
            Ok(())
        }
    }

    #[test]
    fn test_full_run_executes_all_stages_in_order() {
        let mut stages = Recording::default();
        run_full(&mut stages).unwrap();
        assert_eq!(
            *stages.calls.borrow(),
            vec!["prepare", "build", "verify", "promote", "clean"]
        );
    }

    #[test]
    fn test_verify_failure_skips_promote_but_cleans() {
        let mut stages = Recording {
            fail_at: Some("verify"),
            ..Recording::default()
        };
        let err = run_full(&mut stages).unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Verify));
        assert_eq!(
            *stages.calls.borrow(),
            vec!["prepare", "build", "verify", "clean"]
        );
    }

    #[test]
    fn test_prepare_failure_still_cleans() {
        let mut stages = Recording {
            fail_at: Some("prepare"),
            ..Recording::default()
        };
        let err = run_full(&mut stages).unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Prepare));
        assert_eq!(*stages.calls.borrow(), vec!["prepare", "clean"]);
    }

    #[test]
    fn test_clean_failure_is_downgraded() {
        let mut stages = Recording {
            fail_clean: true,
            ..Recording::default()
        };
        // All gates passed; a clean failure must not fail the run.
        run_full(&mut stages).unwrap();
    }

    #[test]
    fn test_clean_failure_never_masks_gate_failure() {
        let mut stages = Recording {
            fail_at: Some("build"),
            fail_clean: true,
            ..Recording::default()
        };
        let err = run_full(&mut stages).unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Build));
    }

    #[test]
    fn test_test_variant_omits_promote_and_clean() {
        let mut stages = Recording::default();
        run_test(&mut stages).unwrap();
        assert_eq!(
            *stages.calls.borrow(),
            vec!["prepare", "build", "verify"]
        );
    }
}

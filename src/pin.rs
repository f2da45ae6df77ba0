//! Build-file pinning and the Prepare stage.
//!
//! The build template is parsed into a structured document: an ordered list
//! of stages, each with a base reference, an optional alias, and a verbatim
//! body. Pinning the upstream base to a content digest and inserting the
//! init-config stage are structural edits with well-defined failure, not
//! substring surgery. If the init stage must be added and no insertion
//! anchor exists, Prepare fails rather than emitting an invalid build file.

use crate::baseline::BaselineRecord;
use crate::error::{Error, Result};
use crate::exec;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use time::OffsetDateTime;

/// Alias of the stage that produces default runtime configuration.
pub const INIT_STAGE_ALIAS: &str = "init-config";

/// Sentinel recorded when the upstream version probe fails. Best-effort by
/// design: the sentinel is surfaced in metadata and operator output, and is
/// never used as an image tag.
pub const UNKNOWN_VERSION: &str = "unknown";

/// Version used for the target tag when nothing better is known.
const FALLBACK_TAG_VERSION: &str = "dev";

/// Bound on the version probe; exceeding it is a distinct `Timeout`, not a
/// generic tool failure.
const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(30);

const INIT_ANCHOR: &str = "--from=init-config";

/// One build stage: `FROM [flags] <base> [AS <alias>]` plus its body lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildStage {
    pub base: String,
    pub alias: Option<String>,
    /// Flags between FROM and the base reference (e.g. `--platform=...`).
    pub flags: Vec<String>,
    pub body: Vec<String>,
}

impl BuildStage {
    fn from_line(&self) -> String {
        let mut line = String::from("FROM");
        for flag in &self.flags {
            line.push(' ');
            line.push_str(flag);
        }
        line.push(' ');
        line.push_str(&self.base);
        if let Some(alias) = &self.alias {
            line.push_str(" AS ");
            line.push_str(alias);
        }
        line
    }
}

/// Ordered-stage representation of a build template.
#[derive(Debug, Clone, Default)]
pub struct BuildFile {
    /// Lines before the first FROM (comments, syntax directives, ARGs).
    pub preamble: Vec<String>,
    pub stages: Vec<BuildStage>,
}

impl BuildFile {
    pub fn parse(text: &str) -> Self {
        let mut preamble = Vec::new();
        let mut stages: Vec<BuildStage> = Vec::new();

        for line in text.lines() {
            let trimmed = line.trim_start();
            let is_from = trimmed.len() >= 5
                && trimmed.get(..4).is_some_and(|kw| kw.eq_ignore_ascii_case("FROM"))
                && trimmed.as_bytes()[4].is_ascii_whitespace();

            if is_from {
                stages.push(parse_from_line(trimmed));
            } else if let Some(stage) = stages.last_mut() {
                stage.body.push(line.to_string());
            } else {
                preamble.push(line.to_string());
            }
        }

        BuildFile { preamble, stages }
    }

    pub fn render(&self) -> String {
        let mut out = Vec::new();
        out.extend(self.preamble.iter().cloned());
        for stage in &self.stages {
            out.push(stage.from_line());
            out.extend(stage.body.iter().cloned());
        }
        let mut text = out.join("\n");
        text.push('\n');
        text
    }

    /// Rewrites every stage based on `upstream_repo` (any tag or digest) to
    /// the pinned reference. A stage with no alias gets `base` so downstream
    /// `COPY --from=` references have a stable name; an existing alias is
    /// kept. Returns the number of stages rewritten.
    pub fn pin_base(&mut self, upstream_repo: &str, pinned_ref: &str) -> usize {
        let mut rewritten = 0;
        for stage in &mut self.stages {
            if base_matches(&stage.base, upstream_repo) {
                stage.base = pinned_ref.to_string();
                if stage.alias.is_none() {
                    stage.alias = Some("base".to_string());
                }
                rewritten += 1;
            }
        }
        rewritten
    }

    pub fn has_stage(&self, alias: &str) -> bool {
        self.stages
            .iter()
            .any(|s| s.alias.as_deref() == Some(alias))
    }

    /// Guarantees the init-config stage exists: already present is a no-op,
    /// otherwise it is inserted immediately before the first stage that
    /// copies from it. No copying stage means the template cannot use the
    /// init output at all, which is an error rather than a silently broken
    /// build file. Returns whether an insertion happened.
    pub fn ensure_init_stage(&mut self, init: BuildStage) -> Result<bool> {
        if self.has_stage(INIT_STAGE_ALIAS) {
            return Ok(false);
        }

        let anchor = self.stages.iter().position(|stage| {
            stage
                .body
                .iter()
                .any(|line| line.contains(INIT_ANCHOR))
        });
        match anchor {
            Some(index) => {
                self.stages.insert(index, init);
                Ok(true)
            }
            None => Err(Error::Parse {
                what: "build template".into(),
                detail: format!(
                    "no stage references {INIT_ANCHOR}; cannot place the {INIT_STAGE_ALIAS} stage"
                ),
            }),
        }
    }
}

fn parse_from_line(trimmed: &str) -> BuildStage {
    let mut tokens = trimmed.split_whitespace().skip(1).peekable();

    let mut flags = Vec::new();
    while let Some(token) = tokens.peek() {
        if token.starts_with("--") {
            flags.push((*token).to_string());
            tokens.next();
        } else {
            break;
        }
    }

    let base = tokens.next().unwrap_or_default().to_string();
    let alias = match tokens.next() {
        Some(kw) if kw.eq_ignore_ascii_case("AS") => tokens.next().map(str::to_string),
        _ => None,
    };

    BuildStage {
        base,
        alias,
        flags,
        body: Vec::new(),
    }
}

/// True when `base` references `repo` exactly, with or without a tag or
/// digest suffix. Prefix matching alone would also hit `repo-extra`.
fn base_matches(base: &str, repo: &str) -> bool {
    match base.strip_prefix(repo) {
        Some(rest) => rest.is_empty() || rest.starts_with(':') || rest.starts_with('@'),
        None => false,
    }
}

/// Default init-config stage inserted when the template lacks one.
pub fn default_init_stage() -> BuildStage {
    BuildStage {
        base: "busybox:1.36".to_string(),
        alias: Some(INIT_STAGE_ALIAS.to_string()),
        flags: Vec::new(),
        body: vec![
            "WORKDIR /defaults/config".to_string(),
            "RUN set -eux; \\".to_string(),
            "    mkdir -p /defaults/config && \\".to_string(),
            "    printf 'generated=default\\n' > /defaults/config/runtime.cfg".to_string(),
            String::new(),
        ],
    }
}

/// Ephemeral per-run build context, written by Prepare and consumed
/// read-only by Build, Verify, and Promote within the same run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildMetadata {
    pub base_digest: String,
    pub architecture: String,
    pub detected_version: String,
    pub target_tag: String,
    #[serde(with = "time::serde::rfc3339")]
    pub built_at: OffsetDateTime,
    /// Identity of the pipeline run that produced this file. Later stages
    /// refuse metadata from a different run, so a stale file left behind by
    /// an interrupted run never satisfies them.
    pub run_id: String,
}

impl BuildMetadata {
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut json = serde_json::to_vec_pretty(self).map_err(|e| Error::Parse {
            what: "build metadata".into(),
            detail: e.to_string(),
        })?;
        json.push(b'\n');
        fs::write(path, json).map_err(|e| Error::io(format!("write {}", path.display()), e))
    }

    /// Loads the metadata file and rejects it unless it belongs to
    /// `expected_run_id`.
    pub fn load(path: &Path, expected_run_id: &str) -> Result<Self> {
        let data = match fs::read(path) {
            Ok(d) => d,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::NotFound(format!(
                    "build metadata {}",
                    path.display()
                )))
            }
            Err(e) => return Err(Error::io(format!("read {}", path.display()), e)),
        };
        let meta: BuildMetadata = serde_json::from_slice(&data).map_err(|e| Error::Parse {
            what: "build metadata".into(),
            detail: e.to_string(),
        })?;
        if meta.run_id != expected_run_id {
            return Err(Error::Parse {
                what: "build metadata".into(),
                detail: format!(
                    "run id {:?} does not match current run {:?}; stale artifact from an earlier run",
                    meta.run_id, expected_run_id
                ),
            });
        }
        Ok(meta)
    }
}

/// A fresh run identity for one pipeline invocation.
pub fn new_run_id() -> String {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    format!("{}-{:x}", std::process::id(), nanos)
}

/// Best-effort extraction of a human-readable version from the upstream
/// image.
pub trait VersionProbe {
    fn probe(&self, base_ref: &str) -> Result<String>;
}

/// Runs the pinned base image with `--version` and a bounded wait.
pub struct DockerVersionProbe {
    pub timeout: Duration,
}

impl Default for DockerVersionProbe {
    fn default() -> Self {
        Self {
            timeout: VERSION_PROBE_TIMEOUT,
        }
    }
}

impl VersionProbe for DockerVersionProbe {
    fn probe(&self, base_ref: &str) -> Result<String> {
        let out = exec::output_with_deadline(
            Command::new("docker").args(["run", "--rm", base_ref, "--version"]),
            "docker",
            &format!("probing version of {base_ref}"),
            self.timeout,
        )?;
        let text = String::from_utf8_lossy(&out);
        parse_version_output(&text).ok_or_else(|| Error::Parse {
            what: "version output".into(),
            detail: format!("no version line in {:?}", text.trim()),
        })
    }
}

fn parse_version_output(text: &str) -> Option<String> {
    for line in text.lines() {
        if let Some(rest) = line.trim().strip_prefix("Version:") {
            let version = rest.split_whitespace().next()?;
            return Some(version.to_string());
        }
    }
    None
}

/// Inputs for one Prepare invocation.
pub struct PrepareRequest<'a> {
    pub template_path: &'a Path,
    pub output_path: &'a Path,
    pub metadata_path: &'a Path,
    /// Repository of the hardened output image, used for the target tag.
    pub image_repo: &'a str,
    pub local_arch: &'a str,
    pub version_override: Option<&'a str>,
    pub run_id: &'a str,
}

/// Prepare: pin the template's upstream base to the baseline digest for the
/// local architecture, guarantee the init-config stage, and record build
/// metadata for the downstream stages. Fails before touching any output
/// file when the baseline has no entry for the architecture.
pub fn prepare(
    req: &PrepareRequest<'_>,
    baseline: &BaselineRecord,
    prober: &dyn VersionProbe,
) -> Result<BuildMetadata> {
    let digest = baseline
        .digests
        .get(req.local_arch)
        .ok_or_else(|| Error::MissingArchEntry {
            arch: req.local_arch.to_string(),
        })?;

    let pinned_ref = format!("{}@{}", baseline.repository, digest);

    let detected_version = match prober.probe(&pinned_ref) {
        Ok(version) => version,
        Err(e) => {
            println!("Warning: could not detect upstream version automatically: {e}");
            UNKNOWN_VERSION.to_string()
        }
    };

    let template = match fs::read_to_string(req.template_path) {
        Ok(t) => t,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(Error::NotFound(format!(
                "build template {}",
                req.template_path.display()
            )))
        }
        Err(e) => {
            return Err(Error::io(
                format!("read {}", req.template_path.display()),
                e,
            ))
        }
    };

    let mut buildfile = BuildFile::parse(&template);
    let pinned = buildfile.pin_base(&baseline.repository, &pinned_ref);
    if pinned == 0 {
        println!(
            "Warning: template declares no stage based on {}; nothing was pinned",
            baseline.repository
        );
    }
    if buildfile.ensure_init_stage(default_init_stage())? {
        println!("Inserted missing {INIT_STAGE_ALIAS} stage into build file.");
    }

    fs::write(req.output_path, buildfile.render())
        .map_err(|e| Error::io(format!("write {}", req.output_path.display()), e))?;

    let tag_version = req
        .version_override
        .map(str::to_string)
        .or_else(|| {
            (detected_version != UNKNOWN_VERSION).then(|| detected_version.clone())
        })
        .unwrap_or_else(|| FALLBACK_TAG_VERSION.to_string());

    let metadata = BuildMetadata {
        base_digest: digest.clone(),
        architecture: req.local_arch.to_string(),
        detected_version,
        target_tag: format!("{}:{}", req.image_repo, tag_version),
        built_at: OffsetDateTime::now_utc(),
        run_id: req.run_id.to_string(),
    };
    metadata.write(req.metadata_path)?;

    println!(
        "Pinned build file created for {} -> {} (upstream version {})",
        req.local_arch, digest, metadata.detected_version
    );
    Ok(metadata)
}

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use hardpin::baseline::BaselineStore;
use hardpin::config::{
    EnvToggles, Settings, DEFAULT_BASELINE_PATH, DEFAULT_METADATA_PATH, DEFAULT_OUTPUT_PATH,
    DEFAULT_POLICY_MANIFEST, DEFAULT_TEMPLATE_PATH,
};
use hardpin::digest::{local_arch, DockerCli, ImageRef};
use hardpin::pipeline::{self, DockerStages};
use hardpin::reconcile::{DriftScope, ReconcileOutcome, Reconciler, Verdict};
use hardpin::toolcheck;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "hardpin", about = "Digest-pinned hardened image pipeline", version)]
struct Cli {
    #[command(flatten)]
    opts: GlobalOpts,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Args)]
struct GlobalOpts {
    /// Upstream image repository to track (e.g. `library/nginx`)
    #[arg(long, global = true, default_value = "factoriotools/factorio")]
    repository: String,

    /// Upstream tag the baseline follows
    #[arg(long, global = true, default_value = "stable")]
    tag: String,

    /// Repository for the hardened output image.
    /// Defaults to `<repository basename>-hardened`.
    #[arg(long, global = true)]
    image_repo: Option<String>,

    /// Baseline record location
    #[arg(long, global = true, default_value = DEFAULT_BASELINE_PATH)]
    baseline: PathBuf,

    /// Build template to pin
    #[arg(long, global = true, default_value = DEFAULT_TEMPLATE_PATH)]
    template: PathBuf,

    /// Where the pinned build file is written
    #[arg(long, global = true, default_value = DEFAULT_OUTPUT_PATH)]
    output: PathBuf,

    /// Per-run build metadata location
    #[arg(long, global = true, default_value = DEFAULT_METADATA_PATH)]
    metadata: PathBuf,

    /// Pod manifest for the admission-policy dry-run
    #[arg(long, global = true, default_value = DEFAULT_POLICY_MANIFEST)]
    policy_manifest: PathBuf,
}

impl GlobalOpts {
    fn settings(&self) -> Settings {
        let image_repo = self.image_repo.clone().unwrap_or_else(|| {
            let basename = self
                .repository
                .rsplit('/')
                .next()
                .unwrap_or(&self.repository);
            format!("{basename}-hardened")
        });
        Settings {
            repository: self.repository.clone(),
            tag: self.tag.clone(),
            image_repo,
            baseline_path: self.baseline.clone(),
            template_path: self.template.clone(),
            output_path: self.output.clone(),
            metadata_path: self.metadata.clone(),
            policy_manifest: self.policy_manifest.clone(),
            toggles: EnvToggles::from_env(),
        }
    }
}

#[derive(Subcommand)]
enum Cmd {
    /// Baseline digest record operations
    #[command(subcommand)]
    Baseline(BaselineCmd),

    /// Hardened image pipeline
    #[command(subcommand)]
    Pipeline(PipelineCmd),

    /// Check that the required external tools are installed
    Doctor,
}

#[derive(Subcommand)]
enum BaselineCmd {
    /// Print the stored baseline record
    Show,
    /// Classify upstream state against the baseline (read-only)
    Compare,
    /// Re-establish the baseline from the registry
    Sync,
    /// Compare, then sync only when needed
    Reconcile,
}

#[derive(Subcommand)]
enum PipelineCmd {
    /// Full run: prepare, build, verify, promote, clean
    Run,
    /// Local validation: prepare, single-arch build, verify
    Test,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.opts.settings();

    match cli.cmd {
        Cmd::Baseline(cmd) => baseline_cmd(cmd, &settings),
        Cmd::Pipeline(cmd) => pipeline_cmd(cmd, settings),
        Cmd::Doctor => doctor(),
    }
}

fn baseline_cmd(cmd: BaselineCmd, settings: &Settings) -> Result<()> {
    let store = BaselineStore::new(&settings.baseline_path);
    let source = DockerCli;
    let image = ImageRef::new(&settings.repository, &settings.tag);
    let reconciler = Reconciler::new(&store, &source, image);

    match cmd {
        BaselineCmd::Show => {
            // Read-only inspection: an absent baseline is a normal state,
            // not a failure.
            match store.load() {
                Ok(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                Err(hardpin::error::Error::NoBaseline(path)) => {
                    println!(
                        "No baseline recorded at {}; run `baseline sync` to create one.",
                        path.display()
                    );
                }
                Err(e) => return Err(e.into()),
            }
            Ok(())
        }
        BaselineCmd::Compare => {
            print_verdict(&reconciler.compare(local_arch())?);
            Ok(())
        }
        BaselineCmd::Sync => {
            let record = reconciler.sync()?;
            print_record_summary(&record);
            Ok(())
        }
        BaselineCmd::Reconcile => {
            match reconciler.reconcile(local_arch())? {
                ReconcileOutcome::AlreadyCurrent => {
                    println!("Baseline is current; nothing to do.");
                }
                ReconcileOutcome::Initialized(record) => {
                    println!("No baseline existed; initialized from the registry.");
                    print_record_summary(&record);
                }
                ReconcileOutcome::Resynced { verdict, record } => {
                    print_verdict(&verdict);
                    println!("Baseline resynchronized.");
                    print_record_summary(&record);
                }
            }
            Ok(())
        }
    }
}

fn print_verdict(verdict: &Verdict) {
    match verdict {
        Verdict::UpToDate => println!("Baseline matches upstream."),
        Verdict::Drifted { scope, old, new } => {
            let what = match scope {
                DriftScope::ManifestList => "manifest list".to_string(),
                DriftScope::Arch(arch) => format!("architecture {arch}"),
            };
            println!("Drift detected ({what}):");
            println!("  recorded: {old}");
            println!("  upstream: {new}");
        }
        Verdict::NoBaseline => {
            println!("No baseline recorded yet; run `baseline sync` to create one.");
        }
        Verdict::MissingArchEntry { arch } => {
            println!("Baseline has no entry for architecture {arch}; a sync will add it.");
        }
    }
}

fn print_record_summary(record: &hardpin::baseline::BaselineRecord) {
    println!("{}:{}", record.repository, record.tag);
    println!("  manifest list: {}", record.manifest_list);
    for (arch, digest) in &record.digests {
        println!("  {arch}: {digest}");
    }
}

fn pipeline_cmd(cmd: PipelineCmd, settings: Settings) -> Result<()> {
    let mut stages = DockerStages::new(settings);
    match cmd {
        PipelineCmd::Run => pipeline::run_full(&mut stages)?,
        PipelineCmd::Test => pipeline::run_test(&mut stages)?,
    }
    Ok(())
}

fn doctor() -> Result<()> {
    let tools = toolcheck::detect_tools();
    let missing = tools.missing_tools_report();
    if missing.is_empty() {
        println!("All external tools available (docker, trivy, kubectl).");
        return Ok(());
    }
    for line in &missing {
        eprintln!("{line}");
    }
    if !tools.required_available() {
        return Err(anyhow!("required external tools are missing"));
    }
    println!("Required tools are available; optional tools missing (see above).");
    Ok(())
}

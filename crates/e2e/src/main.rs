//! Gallery harness entry point
//!
//! Exit status: 0 when every example passed or was skipped, 1 when any
//! example failed, 2 when the harness itself could not run.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gallery_e2e::manifest::{filter_examples, Manifest};
use gallery_e2e::playwright::Browser;
use gallery_e2e::{DiffMode, HarnessConfig, SuiteRunner};

#[derive(Parser, Debug)]
#[command(name = "gallery-e2e")]
#[command(author, version, about = "Visual regression runner for gallery examples", long_about = None)]
struct Args {
    /// Harness configuration file (TOML)
    #[arg(short, long, default_value = "gallery-harness.toml")]
    config: PathBuf,

    /// Examples manifest (YAML)
    #[arg(short, long)]
    manifest: Option<PathBuf>,

    /// Root of the example gallery
    #[arg(long)]
    examples_dir: Option<PathBuf>,

    /// Output directory for screenshots, diffs and results
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Examples run concurrently
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Run only examples whose path contains this string
    #[arg(short, long)]
    filter: Option<String>,

    /// How image differences affect the verdict
    #[arg(long, value_enum)]
    diff: Option<DiffMode>,

    /// Reference images: HTTP(S) base URL or local directory
    #[arg(long, env = "GALLERY_REFERENCE_SOURCE")]
    reference: Option<String>,

    /// Reference version prefix
    #[arg(long)]
    reference_version: Option<String>,

    /// Browser used for snapshots
    #[arg(long, value_enum)]
    browser: Option<Browser>,

    /// Render budget inside the browser, in milliseconds
    #[arg(long)]
    wait_ms: Option<u64>,

    /// Notebook server port
    #[arg(long)]
    notebook_port: Option<u16>,

    /// Show every browser message and resource line
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

impl Args {
    fn apply(&self, config: &mut HarnessConfig) {
        if let Some(manifest) = &self.manifest {
            config.manifest = manifest.clone();
        }
        if let Some(dir) = &self.examples_dir {
            config.examples_dir = dir.clone();
        }
        if let Some(output) = &self.output {
            config.artifacts_dir = output.clone();
        }
        if let Some(jobs) = self.jobs {
            config.jobs = jobs;
        }
        if let Some(mode) = self.diff {
            config.diff.mode = mode;
        }
        if let Some(source) = &self.reference {
            config.reference.source = Some(source.clone());
        }
        if let Some(version) = &self.reference_version {
            config.reference.version = version.clone();
        }
        if let Some(browser) = self.browser {
            config.capture.browser = browser;
        }
        if let Some(wait_ms) = self.wait_ms {
            config.capture.wait_ms = wait_ms;
        }
        if let Some(port) = self.notebook_port {
            config.notebook.port = port;
        }
        config.verbose |= self.verbose;
    }
}

fn init_logging(verbose: bool, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(false))
            .with(filter)
            .init();
    }
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.json);

    let result = tokio::runtime::Runtime::new()
        .context("failed to create tokio runtime")
        .and_then(|rt| rt.block_on(async_main(args)));

    match result {
        Ok(true) => std::process::exit(0),
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(2);
        }
    }
}

async fn async_main(args: Args) -> anyhow::Result<bool> {
    info!("Gallery harness v{}", gallery_common::VERSION);

    let mut config = HarnessConfig::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    args.apply(&mut config);
    config.validate()?;

    let manifest = Manifest::from_file(&config.manifest)?;
    let mut examples = manifest
        .resolve(&config.examples_dir, &config.artifact_layout())
        .context("failed to resolve examples")?;
    if let Some(pattern) = &args.filter {
        examples = filter_examples(examples, pattern);
    }

    let runner = SuiteRunner::new(config)?;
    let results = runner.run_all(&examples).await;
    runner.write_results(&results)?;

    Ok(results.success())
}

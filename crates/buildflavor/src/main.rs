use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use buildflavor::config::{self, Overrides, Setup};
use buildflavor::executor::{self, CleanPolicy, ExecCtx, StdoutSink};
use buildflavor::invocation::Environment;
use buildflavor::{Error, Result};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// TOML flavor catalog (replaces the built-in libmpdclient table)
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,
    /// Source tree to configure (default: current directory)
    #[arg(long, global = true)]
    source_root: Option<PathBuf>,
    /// Base directory for install prefixes
    #[arg(long, global = true)]
    prefix_root: Option<PathBuf>,
    /// Configure tool to invoke
    #[arg(long, global = true)]
    tool: Option<String>,
    #[command(subcommand)]
    cmd: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Remove stale build dirs and configure every flavor (the default)
    Run {
        /// Print what would run without cleaning or spawning anything
        #[arg(long)]
        dry_run: bool,
        /// Only configure these flavors (repeatable; catalog order is kept)
        #[arg(long = "only", value_name = "FLAVOR")]
        only: Vec<String>,
        /// Fail when a stale build dir exists but cannot be removed
        #[arg(long)]
        strict_clean: bool,
    },
    /// Print the resolved invocations in catalog order
    Plan {
        /// Print JSON instead of shell-like lines
        #[arg(long)]
        json: bool,
        #[arg(long = "only", value_name = "FLAVOR")]
        only: Vec<String>,
    },
    /// Print the fully-resolved catalog as TOML (after extends)
    Resolve,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let setup = load_setup(&args)?;
    match args.cmd.unwrap_or(Command::Run {
        dry_run: false,
        only: Vec::new(),
        strict_clean: false,
    }) {
        Command::Run {
            dry_run,
            only,
            strict_clean,
        } => cmd_run(&setup, dry_run, &only, strict_clean),
        Command::Plan { json, only } => cmd_plan(&setup, json, &only),
        Command::Resolve => cmd_resolve(&setup),
    }
}

fn load_setup(args: &Args) -> Result<Setup> {
    let cwd = std::env::current_dir().map_err(|e| Error::io(format!("cwd error: {e}")))?;
    let doc = match &args.catalog {
        Some(p) => Some(config::load(p)?),
        None => None,
    };
    let overrides = Overrides {
        source_root: args.source_root.clone(),
        prefix_root: args.prefix_root.clone(),
        tool: args.tool.clone(),
    };
    config::setup(doc.as_ref(), &overrides, &cwd)
}

fn cmd_run(setup: &Setup, dry_run: bool, only: &[String], strict_clean: bool) -> Result<()> {
    let catalog = setup.catalog.select(only)?;
    let clean = if strict_clean {
        CleanPolicy::Strict
    } else {
        CleanPolicy::BestEffort
    };
    let sink = Arc::new(StdoutSink::default());
    let mut ctx = ExecCtx::new(dry_run, sink).with_clean_policy(clean);
    executor::execute_catalog(&catalog, &setup.roots, &setup.settings, &mut ctx)?;
    Ok(())
}

fn cmd_plan(setup: &Setup, json: bool, only: &[String]) -> Result<()> {
    let catalog = setup.catalog.select(only)?;
    let plan = executor::plan_catalog(
        &catalog,
        &setup.roots,
        &setup.settings,
        &Environment::ambient(),
    )?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    for (i, inv) in plan.iter().enumerate() {
        println!("{:>2}. {:<10} {}", i + 1, inv.flavor, inv.display_line());
    }
    Ok(())
}

fn cmd_resolve(setup: &Setup) -> Result<()> {
    let s = toml::to_string_pretty(&setup.to_catalog_file())?;
    print!("{s}");
    Ok(())
}

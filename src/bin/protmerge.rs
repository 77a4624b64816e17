use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use protmerge::blast::BlastHttpClient;
use protmerge::clock::{Clock, SystemClock};
use protmerge::config::{ConfigLoader, ResolvedConfig};
use protmerge::error::ProtmergeError;
use protmerge::governor::RateGovernor;
use protmerge::output::{JsonOutput, LogProgress};
use protmerge::pipeline::{CancellationToken, Pipeline};
use protmerge::rcsb::RcsbHttpClient;
use protmerge::uniprot::UniprotHttpClient;

#[derive(Parser)]
#[command(name = "protmerge")]
#[command(about = "Merge UniProt, physicochemical, BLAST homology and PDB annotations per protein")]
#[command(version, author)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Annotate a list of UniProt accessions")]
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// UniProt accessions; replace `identifiers` from the config file.
    ids: Vec<String>,

    #[arg(long)]
    config: Option<String>,

    /// File with one accession per line; `#` starts a comment.
    #[arg(long)]
    ids_file: Option<PathBuf>,

    #[arg(long)]
    homology: bool,

    /// Search the PDB for experimental structures.
    #[arg(long)]
    structure: bool,

    #[arg(long)]
    no_identity: bool,

    #[arg(long)]
    no_physicochemical: bool,

    #[arg(long)]
    workers: Option<usize>,

    #[arg(long)]
    output: Option<PathBuf>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<ProtmergeError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &ProtmergeError) -> u8 {
    match error {
        ProtmergeError::InvalidConfig(_)
        | ProtmergeError::MissingConfig
        | ProtmergeError::ConfigRead(_)
        | ProtmergeError::ConfigParse(_)
        | ProtmergeError::EmptyWorklist => 2,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run_pipeline(args),
    }
}

fn run_pipeline(args: RunArgs) -> miette::Result<()> {
    let mut resolved = ConfigLoader::resolve_or_default(args.config.as_deref())?;
    apply_overrides(&mut resolved, &args)?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let governor = Arc::new(RateGovernor::new(resolved.rate, Arc::clone(&clock)));
    let uniprot = UniprotHttpClient::new()?;
    let blast = BlastHttpClient::new(resolved.pipeline.homology.clone())?;
    let rcsb = RcsbHttpClient::new()?;
    let pipeline = Pipeline::new(uniprot, blast, rcsb, governor, clock, resolved.pipeline);

    let (sink, logger) = LogProgress::spawn();
    let result = pipeline.run(&resolved.identifiers, &CancellationToken::new(), &sink);
    drop(sink);
    if logger.join().is_err() {
        tracing::warn!("progress logger stopped early");
    }
    let output = result?;
    JsonOutput::print_run(&output, args.output.as_deref())?;
    Ok(())
}

fn apply_overrides(resolved: &mut ResolvedConfig, args: &RunArgs) -> miette::Result<()> {
    let mut ids = args.ids.clone();
    if let Some(path) = &args.ids_file {
        let content = fs::read_to_string(path).into_diagnostic()?;
        ids.extend(read_id_lines(&content));
    }
    if !ids.is_empty() {
        resolved.identifiers = ids;
    }

    let options = &mut resolved.pipeline.options;
    if args.homology {
        options.homology = true;
    }
    if args.structure {
        options.structure = true;
    }
    if args.no_identity {
        options.identity = false;
    }
    if args.no_physicochemical {
        options.physicochemical = false;
    }
    if !options.any() {
        return Err(ProtmergeError::InvalidConfig(
            "at least one analysis must be enabled".to_string(),
        )
        .into());
    }

    if let Some(workers) = args.workers {
        if workers == 0 {
            return Err(
                ProtmergeError::InvalidConfig("workers must be at least 1".to_string()).into(),
            );
        }
        resolved.pipeline.workers = workers;
    }
    Ok(())
}

fn read_id_lines(content: &str) -> impl Iterator<Item = String> + '_ {
    content
        .lines()
        .map(|line| line.split('#').next().unwrap_or_default().trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
}

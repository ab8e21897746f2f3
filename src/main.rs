use clap::{Parser, Subcommand};
use quire::{Engine, EngineError, ExecutionPlan, ModuleRegistry, config, output};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "quire")]
#[command(about = "Pipeline engine for static site generation")]
#[command(long_about = "\
Pipeline engine for static site generation

A project is a quire.toml listing named pipelines. Each pipeline runs four
phases in order, each a list of modules:

  Input → Process → PostProcess → Output

A pipeline that depends on another waits for it and starts from its output
documents. Independent pipelines run concurrently.

  [[pipelines]]
  name = \"posts\"
  input = [{ module = \"ReadFiles\", dir = \"posts\", extensions = [\"md\"] }]
  process = [{ module = \"SetDestination\", extension = \"html\" }]
  output = [{ module = \"WriteFiles\" }]

Run 'quire gen-config' to generate a documented quire.toml.")]
#[command(version = quire::version())]
struct Cli {
    /// Project configuration file
    #[arg(long, default_value = config::CONFIG_FILENAME, global = true)]
    config: PathBuf,

    /// More logging (-v info, -vv debug, -vvv trace). RUST_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute every pipeline
    Build {
        /// Ignore and don't update the phase cache
        #[arg(long)]
        no_cache: bool,
    },
    /// Validate the configuration and print the execution plan
    Check,
    /// Print a stock quire.toml with all options documented
    GenConfig,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Build { no_cache } => {
            let project = config::load_config(&cli.config)?;
            init_thread_pool(&project.engine);
            let pipelines = project.build_pipelines(&ModuleRegistry::standard())?;
            if pipelines.is_empty() {
                warn!(config = %cli.config.display(), "no pipelines configured");
            }
            let engine = Engine::with_config(
                pipelines,
                project.services(),
                project.engine_config(quire::version(), no_cache),
            )?;

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            let outcome = runtime.block_on(async {
                let cancel = engine.cancellation();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("interrupt received, cancelling");
                        cancel.cancel();
                    }
                });
                engine.execute().await
            });

            match outcome {
                Ok(results) => {
                    output::print_summary(&results);
                    info!(output = %project.output_dir().display(), "build complete");
                }
                Err(EngineError::Failed(report)) => {
                    output::print_failures(&report);
                    std::process::exit(1);
                }
                Err(EngineError::Cancelled) => {
                    eprintln!("Build cancelled");
                    std::process::exit(130);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Command::Check => {
            let project = config::load_config(&cli.config)?;
            let pipelines = project.build_pipelines(&ModuleRegistry::standard())?;
            let plan = ExecutionPlan::build(&pipelines)?;
            output::print_plan(&plan);
            println!("==> Configuration is valid");
        }
        Command::GenConfig => {
            print!("{}", config::stock_config_toml());
        }
    }

    Ok(())
}

/// WARN by default; each `-v` raises one level. `RUST_LOG` wins when set.
fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Initialize the rayon pool used for fingerprint hashing.
///
/// Caps at the number of available CPU cores; the user can constrain down, not up.
fn init_thread_pool(engine: &config::EngineSection) {
    let threads = config::effective_threads(engine);
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
        .ok();
}

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fragsuite::config::Config;
use fragsuite::report::print_summary;
use fragsuite::suite::{self, SuiteOptions};
use fragsuite::{mods, runtime};
use tracing_subscriber::EnvFilter;

// Use mimalloc as the global allocator for the binary (non-Windows only)
#[cfg(not(windows))]
#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(
    name = "fragsuite",
    author,
    version,
    disable_version_flag = true,
    about = "Runs packet-modification test suites against a command"
)]
struct Cli {
    /// Print the version and exit
    #[arg(short = 'v', long = "version", action = clap::ArgAction::SetTrue)]
    print_version: bool,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// List the available modifications
    List,
    /// Show the usage of one or more modifications
    Usage {
        /// Modification names (lower_snake or UpperCamel)
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Validate a configuration file without running anything
    Checkconfig {
        /// The configuration file to check
        config: PathBuf,
    },
    /// Run the test suite described by a configuration file
    Start {
        /// The configuration file to run
        config: PathBuf,
        /// Seed for every randomised modification (random when omitted)
        #[arg(long)]
        seed: Option<u64>,
        /// First test index to run
        #[arg(long)]
        from: Option<u64>,
        /// Last test index to run (inclusive)
        #[arg(long)]
        to: Option<u64>,
        /// Expand and print the tests without executing them
        #[arg(long)]
        dry_run: bool,
        /// Log at debug level
        #[arg(long)]
        verbose: bool,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<ExitCode> {
    let args = Cli::parse();

    let verbose = matches!(&args.command, Some(Cmd::Start { verbose: true, .. }));
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if args.print_version {
        println!(
            "{} ({}@{}{}) [{}]",
            env!("CARGO_PKG_VERSION"),
            env!("GIT_BRANCH"),
            env!("GIT_HASH"),
            env!("GIT_DIRTY"),
            env!("CARGO_PKG_NAME")
        );
        return Ok(ExitCode::SUCCESS);
    }

    match args.command {
        None => {
            use clap::CommandFactory;
            Cli::command().print_help().ok();
            Ok(ExitCode::FAILURE)
        }
        Some(Cmd::List) => {
            let mut names: Vec<&str> = mods::list().iter().map(|kind| kind.name).collect();
            names.sort_unstable();
            println!("Found {} available modifications:", names.len());
            for name in names {
                println!("  - {name}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Some(Cmd::Usage { names }) => {
            let mut ok = true;
            for name in names {
                match mods::usage(&name) {
                    Ok(text) => println!("{text}\n"),
                    Err(err) => {
                        eprintln!("{err}");
                        ok = false;
                    }
                }
            }
            Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
        Some(Cmd::Checkconfig { config }) => {
            let cfg = match Config::load(&config) {
                Ok(cfg) => cfg,
                Err(err) => {
                    eprintln!("{err}");
                    return Ok(ExitCode::FAILURE);
                }
            };
            match suite::checkconfig(&cfg) {
                Ok((_, count)) => {
                    println!("configuration OK: {count} test(s)");
                    Ok(ExitCode::SUCCESS)
                }
                Err(err) => {
                    eprintln!("{err}");
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Some(Cmd::Start {
            config,
            seed,
            from,
            to,
            dry_run,
            ..
        }) => {
            let cfg = Config::load(&config).context("load configuration")?;
            let env = build_env()?;
            let aggregator = suite::run_suite(
                &cfg,
                SuiteOptions {
                    seed,
                    from,
                    to,
                    dry_run,
                },
                &env,
            )
            .await?;
            if !dry_run {
                print_summary(&aggregator);
            }
            Ok(if aggregator.all_passed() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

#[cfg(target_os = "linux")]
fn build_env() -> Result<runtime::TestEnv> {
    Ok(runtime::TestEnv::system())
}

#[cfg(not(target_os = "linux"))]
fn build_env() -> Result<runtime::TestEnv> {
    anyhow::bail!("packet diversion requires Linux (iptables + NFQUEUE)")
}

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod flows;
mod render;

use flows::{run_inspect, run_install, run_pack, run_uninstall, InstallArgs, PackArgs, UninstallArgs};
use render::{current_output_style, render_error_line, OutputStyle};

const LOG_ENV: &str = "RETRACE_LOG";

#[derive(Parser, Debug)]
#[command(name = "retrace")]
#[command(about = "Self-contained installer with a journaled uninstall", long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[arg(short = 'u', long = "uninstall", value_name = "JOURNAL")]
    uninstall: Option<PathBuf>,
    #[arg(long, value_name = "INSTALLER", conflicts_with = "uninstall")]
    bundle: Option<PathBuf>,
    #[arg(long, value_name = "DIR", conflicts_with = "uninstall")]
    target_dir: Option<PathBuf>,
    #[arg(long, value_name = "DIR")]
    registry_root: Option<PathBuf>,
    #[arg(long, requires = "uninstall")]
    keep_self: bool,
    #[arg(long, requires = "uninstall")]
    strict: bool,
    #[arg(long)]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Pack {
        #[arg(long)]
        stub: PathBuf,
        #[arg(long)]
        setup: PathBuf,
        #[arg(long)]
        archive: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
    Inspect {
        installer: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli, style: OutputStyle) -> Result<ExitCode> {
    match cli.command {
        Some(Commands::Pack {
            stub,
            setup,
            archive,
            output,
        }) => run_pack(
            PackArgs {
                stub: &stub,
                setup: &setup,
                archive: &archive,
                output: &output,
            },
            style,
        ),
        Some(Commands::Inspect { installer, json }) => run_inspect(installer.as_deref(), json),
        None => match cli.uninstall.as_deref() {
            Some(journal) => run_uninstall(
                UninstallArgs {
                    journal,
                    registry_root: cli.registry_root.as_deref(),
                    keep_self: cli.keep_self,
                    strict: cli.strict,
                    json: cli.json,
                },
                style,
            ),
            None => run_install(
                InstallArgs {
                    bundle: cli.bundle.as_deref(),
                    target_dir: cli.target_dir.as_deref(),
                    registry_root: cli.registry_root.as_deref(),
                    json: cli.json,
                },
                style,
            ),
        },
    }
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    let style = current_output_style();

    match run(cli, style) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{}", render_error_line(style, &format!("{err:#}")));
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests;

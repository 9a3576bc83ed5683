use clap::Parser;
use colored::*;
use layerscan::cli::Cli;
use layerscan::error::LayerscanError;
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = Cli::parse();
    layerscan::logging::init(cli.quiet, cli.verbose);

    match cli.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {:#}", "Error:".red().bold(), err);
            let code = err
                .downcast_ref::<LayerscanError>()
                .map(LayerscanError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}

use std::process::ExitCode;

use clap::Parser;
use widget_host_lib::cli::CliArgs;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // Install the global crash handler first, before anything else
    widget_host_lib::crash_handler::install_crash_handler();

    let args = CliArgs::parse();
    widget_host_lib::logging::init(args.verbose);

    match widget_host_lib::run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

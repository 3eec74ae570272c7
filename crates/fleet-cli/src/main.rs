mod cli;
mod deploy;
mod logging;

use fleet_core::domain::TaskStatus;

#[tokio::main]
async fn main() {
    match run_main().await {
        Ok(TaskStatus::Completed) => {}
        Ok(status) => {
            eprintln!("fleet: deployment {status}");
            std::process::exit(2);
        }
        Err(err) => {
            eprintln!("fleet error: {err:?}");
            std::process::exit(1);
        }
    }
}

async fn run_main() -> anyhow::Result<TaskStatus> {
    let args = cli::parse();
    logging::init_logging(args.log_level)?;
    match args.command {
        cli::Command::Deploy(deploy) => deploy::run(deploy).await,
    }
}

use std::io::{Read, Write};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use eyre::{eyre, Result, WrapErr};
use fleetconf_runtime::{ConfigStore, ConnectionPool, FleetConfig, Outcome, SshConnector};

use crate::app::{Args, Command};

mod app;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    fleetconf_runtime::init_tracing();
    let args = Args::parse();

    let config_path = match args.config {
        Some(path) => path,
        None => FleetConfig::default_path()
            .ok_or_else(|| eyre!("could not determine the config directory; pass --config"))?,
    };
    let config = FleetConfig::load(&config_path)
        .await
        .wrap_err_with(|| format!("loading {}", config_path.display()))?;
    tracing::debug!("Managing {} on {}", config.config_dir, config.endpoint);

    let pool = Arc::new(ConnectionPool::new(
        SshConnector::new(config.host_key.clone()),
        config.pool.clone(),
    ));
    let store = ConfigStore::new(pool.clone(), config.store_config().await?);

    let result = run(&store, args.command).await;
    pool.shutdown().await;
    result
}

async fn run(store: &ConfigStore<SshConnector>, command: Command) -> Result<ExitCode> {
    match command {
        Command::List => {
            for file in store.list_all().await? {
                println!("{}\t{}", file.size, file.name);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Read { names } => {
            let contents = match store.read(&names).await? {
                Outcome::Done(contents) => contents,
                Outcome::Rejected(rejection) => return Ok(rejected(rejection)),
            };

            let mut stdout = std::io::stdout().lock();
            for (name, content) in &contents {
                if contents.len() > 1 {
                    writeln!(stdout, "==> {name} <==")?;
                }
                stdout.write_all(content)?;
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Create { name, file } => {
            let content = read_input(&file)?;
            finish(store.create(&name, &content).await?)
        }
        Command::Update { name, current, new } => {
            let current = read_input(&current)?;
            let new = read_input(&new)?;
            finish(store.update(&name, &current, &new).await?)
        }
        Command::Restart => match store.restart().await? {
            Outcome::Done(output) => {
                print!("{output}");
                Ok(ExitCode::SUCCESS)
            }
            Outcome::Rejected(rejection) => Ok(rejected(rejection)),
        },
    }
}

fn finish(outcome: Outcome<()>) -> Result<ExitCode> {
    match outcome {
        Outcome::Done(()) => Ok(ExitCode::SUCCESS),
        Outcome::Rejected(rejection) => Ok(rejected(rejection)),
    }
}

fn rejected(rejection: fleetconf_runtime::Rejection) -> ExitCode {
    eprintln!("rejected: {rejection}");
    ExitCode::from(2)
}

fn read_input(path: &Path) -> Result<Vec<u8>> {
    if path == Path::new("-") {
        let mut buf = Vec::new();
        std::io::stdin().read_to_end(&mut buf)?;
        return Ok(buf);
    }
    std::fs::read(path).wrap_err_with(|| format!("reading {}", path.display()))
}

use std::process;

use clap::Parser;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use metalanchor::cli::{
    env_file_from_args, format_check, format_plan, plan, CheckArgs, Cli, Commands, PlanArgs,
};
use metalanchor::config::load_config_file;
use metalanchor::version::version_string;

#[tokio::main]
async fn main() {
    // Load .env before parsing so env-backed arguments can come from it
    let env_loaded = env_file_from_args(std::env::args_os())
        .map(|path| dotenvy::from_path(&path).map_err(|e| (path, e)));

    let cli = Cli::parse();

    // Initialize logging
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    if let Some(Err((env_file, e))) = env_loaded {
        error!("Failed to load env file {}: {}", env_file.display(), e);
        process::exit(1);
    }

    debug!("metalanchor {}", version_string());

    let result = match cli.command {
        Commands::Check(args) => run_check(args),
        Commands::Plan(args) => run_plan(args).await,
        Commands::Version => {
            println!("metalanchor {}", version_string());
            Ok(())
        }
    };

    if let Err(e) = result {
        error!("{:#}", e);
        process::exit(1);
    }
}

fn run_check(args: CheckArgs) -> anyhow::Result<()> {
    let config = load_config_file(&args.config)
        .map_err(|e| anyhow::anyhow!("{}: {}", args.config.display(), e))?;
    info!(
        pools = config.pools.len(),
        peers = config.peers.len(),
        "Configuration is valid"
    );

    if args.json {
        println!("{}", serde_json::to_string_pretty(&config)?);
    } else {
        print!("{}", format_check(&config, &args.config.display().to_string()));
    }
    Ok(())
}

async fn run_plan(args: PlanArgs) -> anyhow::Result<()> {
    let config = load_config_file(&args.config)
        .map_err(|e| anyhow::anyhow!("{}: {}", args.config.display(), e))?;
    let entries = plan(&config, &args.services).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        print!("{}", format_plan(&entries));
    }
    Ok(())
}

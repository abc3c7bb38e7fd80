use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use estuary::app::AppContext;
use estuary::cli::{commands, Cli, Commands, UserAction};
use estuary::config::Config;
use estuary::daemon::Daemon;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let ctx = AppContext::new(config)?;

    match cli.command {
        Commands::Serve => {
            Daemon::new(ctx).run().await?;
        }
        Commands::Add { url, user } => {
            commands::add_feed(&ctx, &url, user.as_deref()).await?;
        }
        Commands::Remove { url } => {
            commands::remove_feed(&ctx, &url).await?;
        }
        Commands::Discover { query } => {
            commands::discover(&ctx, &query).await?;
        }
        Commands::List { articles } => {
            if articles {
                commands::list_articles(&ctx)?;
            } else {
                commands::list_feeds(&ctx)?;
            }
        }
        Commands::User { action } => match action {
            UserAction::Add { login } => commands::add_user(&ctx, &login)?,
        },
    }

    Ok(())
}

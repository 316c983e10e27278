use anyhow::{bail, Context};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use clip_aggregator::{
    server, ClipAggregator, ClipFeed, ClipQuery, HelixClient, HelixConfig, HttpClipFeed, LocalClipFeed, Reconciler,
    SortMode, StreamConfig, SystemClock,
};
use futures::StreamExt;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "clip-aggregator", about = "Aggregate highlight clips across channels")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP clip server
    Serve {
        #[command(flatten)]
        helix: HelixArgs,
        #[arg(long, env = "CLIPS_BIND", default_value = "127.0.0.1:3000")]
        bind: String,
    },
    /// Run the pipeline once in-process and print NDJSON to stdout
    Fetch {
        #[command(flatten)]
        helix: HelixArgs,
        #[command(flatten)]
        query: QueryArgs,
    },
    /// Query a clip server (or the in-process pipeline) and print the merged result
    Watch {
        #[command(flatten)]
        query: QueryArgs,
        #[arg(long, default_value = "views")]
        sort: SortMode,
        #[arg(long, default_value = "http://127.0.0.1:3000")]
        server: String,
        /// Skip the server and run the aggregator in this process
        #[arg(long)]
        local: bool,
        #[command(flatten)]
        helix: HelixArgs,
    },
}

#[derive(Args, Clone)]
struct HelixArgs {
    #[arg(long, env = "HELIX_CLIENT_ID", default_value = "")]
    client_id: String,
    #[arg(long, env = "HELIX_CLIENT_SECRET", default_value = "", hide_env_values = true)]
    client_secret: String,
    #[arg(long, env = "HELIX_API_URL", default_value = "https://api.twitch.tv/helix")]
    api_url: String,
    #[arg(long, env = "HELIX_TOKEN_URL", default_value = "https://id.twitch.tv/oauth2/token")]
    token_url: String,
    #[arg(long, default_value_t = 3)]
    max_retries: u32,
}

impl HelixArgs {
    fn build_aggregator(&self) -> anyhow::Result<Arc<ClipAggregator>> {
        if self.client_id.is_empty() || self.client_secret.is_empty() {
            bail!("HELIX_CLIENT_ID and HELIX_CLIENT_SECRET must be set");
        }

        let config = HelixConfig {
            api_base_url: self.api_url.clone(),
            token_url: self.token_url.clone(),
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            max_retries: self.max_retries,
            ..HelixConfig::default()
        };
        let client = HelixClient::new(config).context("building upstream client")?;

        Ok(Arc::new(ClipAggregator::from_api(
            Arc::new(client),
            Arc::new(SystemClock),
            StreamConfig::default(),
        )))
    }
}

#[derive(Args, Clone)]
struct QueryArgs {
    /// Comma-separated channel names
    #[arg(long, value_delimiter = ',', required = true)]
    channels: Vec<String>,
    /// First day, yyyy-MM-dd
    #[arg(long)]
    from: NaiveDate,
    /// Last day, yyyy-MM-dd
    #[arg(long)]
    to: NaiveDate,
    #[arg(long, default_value_t = 0)]
    min_views: u64,
}

impl QueryArgs {
    fn to_query(&self) -> anyhow::Result<ClipQuery> {
        Ok(ClipQuery::new(self.channels.clone(), self.from, self.to, self.min_views)?)
    }
}

/// Cancelled on Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            trigger.cancel();
        }
    });
    token
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { helix, bind } => {
            let aggregator = helix.build_aggregator()?;
            let listener = tokio::net::TcpListener::bind(&bind)
                .await
                .with_context(|| format!("binding {}", bind))?;
            server::serve(listener, aggregator, shutdown_token()).await?;
        }
        Command::Fetch { helix, query } => {
            let aggregator = helix.build_aggregator()?;
            let query = query.to_query()?;
            let mut lines = aggregator.stream(&query, shutdown_token()).await?;
            let mut stdout = tokio::io::stdout();
            while let Some(line) = lines.next().await {
                stdout.write_all(&line).await?;
            }
            stdout.flush().await?;
        }
        Command::Watch {
            query,
            sort,
            server,
            local,
            helix,
        } => {
            let feed: Arc<dyn ClipFeed> = if local {
                Arc::new(LocalClipFeed::new(helix.build_aggregator()?))
            } else {
                Arc::new(HttpClipFeed::new(&server)?)
            };
            let reconciler = Arc::new(Reconciler::new(feed));

            let mut updates = reconciler.subscribe();
            let progress = tokio::spawn(async move {
                while updates.changed().await.is_ok() {
                    let view = updates.borrow_and_update().clone();
                    info!("{} clips so far ({:?})", view.clips.len(), view.phase);
                    if !view.loading {
                        break;
                    }
                }
            });

            reconciler.watch(query.to_query()?, sort).await;

            let interrupt = shutdown_token();
            let view = tokio::select! {
                view = reconciler.settled() => view?,
                _ = interrupt.cancelled() => {
                    reconciler.cancel().await;
                    reconciler.current()
                }
            };
            progress.abort();

            if let Some(err) = &view.error {
                error!("Query failed: {}", err);
            }
            for clip in &view.clips {
                println!(
                    "{:>9}  {}  {:<20}  {}  {}",
                    clip.view_count,
                    clip.created_at.format("%Y-%m-%d %H:%M"),
                    clip.channel_name,
                    clip.title,
                    clip.url
                );
            }
            if view.error.is_some() {
                bail!("query failed");
            }
        }
    }

    Ok(())
}

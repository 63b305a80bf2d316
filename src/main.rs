use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use dividend_relay::browser::WebDriverLauncher;
use dividend_relay::config::{Config, LineConfig};
use dividend_relay::export::{DEFAULT_ENCODING, RawTable};
use dividend_relay::mail::ImapMailbox;
use dividend_relay::notify::formatter::{self, DEFAULT_PAGE_SIZE};
use dividend_relay::notify::{Deliver, Formatter, LineMessenger};
use dividend_relay::records;
use dividend_relay::run::{RunCoordinator, RunMode, RunRequest, RunSettings, Runner};
use dividend_relay::server;

#[derive(Parser, Debug)]
#[command(name = "dividend-relay", version, about = "Brokerage dividend export to chat")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the HTTP trigger endpoints.
    Serve,
    /// Run once and print the outcome as JSON.
    Run {
        /// First settlement date (YYYY/MM/DD).
        #[arg(long)]
        from: Option<String>,
        /// Last settlement date (YYYY/MM/DD).
        #[arg(long)]
        to: Option<String>,
        /// Stop after the portal session is ready.
        #[arg(long, default_value_t = false)]
        auth_only: bool,
        /// Print the notification instead of pushing it.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Parse a saved export and print its text rendering.
    RenderCsv {
        path: PathBuf,
        #[arg(long, default_value = DEFAULT_ENCODING)]
        encoding: String,
        /// Also push the card to the configured LINE user.
        #[arg(long, default_value_t = false)]
        send: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve => serve().await,
        Commands::Run {
            from,
            to,
            auth_only,
            dry_run,
        } => {
            let mode = if auth_only { RunMode::AuthOnly } else { RunMode::Full };
            run_once(RunRequest {
                from,
                to,
                mode,
                dry_run,
            })
            .await
        }
        Commands::RenderCsv {
            path,
            encoding,
            send,
        } => render_csv(path, encoding, send).await,
    }
}

fn coordinator(config: &Config) -> anyhow::Result<RunCoordinator> {
    let launcher = Arc::new(WebDriverLauncher::new(config.webdriver.clone()));
    let mailbox = Arc::new(ImapMailbox::new(config.imap.clone()));
    let deliverer = Arc::new(LineMessenger::new(config.line.access_token.clone()));
    Ok(RunCoordinator::new(
        launcher,
        mailbox,
        deliverer,
        RunSettings::from_config(config),
    )?)
}

async fn serve() -> anyhow::Result<()> {
    let config = Config::from_env().context("loading configuration")?;
    let runner: Arc<dyn Runner> = Arc::new(coordinator(&config)?);
    let app = server::routes(runner);

    let port = config.server.port;
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .with_context(|| format!("binding port {port}"))?;
    eprintln!("💴 dividend-relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Webhook: http://0.0.0.0:{port}/api/dividend-webhook");
    eprintln!("   WebDriver: {}", config.webdriver.url);
    tracing::info!(port, "HTTP server started");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn run_once(request: RunRequest) -> anyhow::Result<()> {
    let config = Config::from_env().context("loading configuration")?;
    let outcome = coordinator(&config)?.run(request).await;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if outcome.is_error() {
        anyhow::bail!("run finished with status {}", outcome.status());
    }
    Ok(())
}

async fn render_csv(path: PathBuf, encoding: String, send: bool) -> anyhow::Result<()> {
    let bytes = tokio::fs::read(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let text = RawTable { bytes, encoding }.decode()?;
    let parsed = records::parse(&text);

    let payload = Formatter::new(DEFAULT_PAGE_SIZE).format(&parsed.summary, &parsed.records);
    println!("{}", formatter::to_text(&payload));

    if send {
        let line = LineConfig::from_env().context("loading LINE configuration")?;
        let messenger = LineMessenger::new(line.access_token);
        messenger
            .deliver(&line.user_id, &formatter::to_message(&payload))
            .await?;
        eprintln!("   Sent {} record(s) to LINE", payload.record_count());
    }
    Ok(())
}

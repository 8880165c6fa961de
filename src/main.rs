use anyhow::Context;
use clap::Parser;
use scalpbot::api::{AsterDexClient, ExchangeClient, PaperExchange};
use scalpbot::{Bot, BotConfig};
use std::path::PathBuf;
use std::sync::Arc;

/// Perpetual-futures scalping bot
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// TOML config file (optional, env vars override it)
    #[arg(long, default_value = "config/scalpbot.toml")]
    config: PathBuf,

    /// Trade against the in-memory paper exchange using live market data
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let args = Args::parse();
    let mut config = BotConfig::load(Some(&args.config))
        .with_context(|| format!("loading config from {}", args.config.display()))?;
    if args.dry_run {
        config.dry_run = true;
    }

    tracing::info!("🚀 scalpbot starting");
    tracing::info!(
        "📊 Symbols: {} | {}x leverage | {}% margin per trade | TP {}% / SL {}%",
        config.symbol_names().join(", "),
        config.leverage,
        config.margin_per_trade.percent(),
        config.take_profit_pct,
        config.stop_loss_pct
    );

    let exchange: Arc<dyn ExchangeClient> = if config.dry_run {
        tracing::info!(
            "🧪 Dry run: paper trading with {:.2} USDT",
            config.paper_balance
        );
        let market_data = AsterDexClient::public(&config.base_url, config.request_timeout)
            .context("building market data client")?;
        Arc::new(PaperExchange::new(config.paper_balance).with_market_data(Arc::new(market_data)))
    } else {
        let credentials = config
            .credentials
            .clone()
            .context("credentials are required outside dry run")?;
        Arc::new(
            AsterDexClient::new(&config.base_url, credentials, config.request_timeout)
                .context("building exchange client")?,
        )
    };

    let handle = Bot::start(config, exchange)
        .await
        .context("starting bot")?;
    tracing::info!("✓ Control loop running (Ctrl+C to stop)");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl+C: {}", e);
    }
    tracing::info!("🛑 Shutdown requested, finishing current cycle");

    let status = handle.stop().await;
    tracing::info!(
        "📈 Final: {} trades, realized PnL {:.4} USDT, win rate {:.1}%",
        status.performance.total_trades,
        status.realized_pnl,
        status.win_rate_pct
    );
    println!("{}", serde_json::to_string_pretty(&status)?);

    Ok(())
}

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("scalpbot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

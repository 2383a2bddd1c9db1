use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use gateway_bridge::{
    Action, Client, ClientConfig, Instrument, OrderSpec, OrderStatus, RequestId, SimulatedTransport,
};
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "gateway-bridge")]
#[command(about = "Gateway client core: history planning and an offline order simulator")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the historical windows a range would be fetched in, as CSV
    Plan {
        /// Symbol, or a 6-letter currency pair for forex
        #[arg(short, long, default_value = "SPY")]
        symbol: String,

        /// Start, `yyyy-mm-dd hh:mm[:ss]` in the given timezone
        #[arg(long)]
        start: String,

        /// End (exclusive), same format as start
        #[arg(long)]
        end: String,

        /// IANA timezone of start and end
        #[arg(long, default_value = "America/New_York")]
        tz: String,

        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run a bracket order through the offline simulator
    Simulate {
        #[arg(short, long, default_value = "SPY")]
        symbol: String,

        #[arg(short, long, default_value = "10")]
        quantity: f64,

        /// Ask price the entry fills at
        #[arg(long, default_value = "100.0")]
        entry: f64,

        /// Take-profit distance from the fill
        #[arg(long, default_value = "5.0")]
        profit: f64,

        /// Stop-loss distance from the fill
        #[arg(long, default_value = "3.0")]
        loss: f64,
    },
}

#[derive(Serialize)]
struct WindowRow {
    start_utc: String,
    end_utc: String,
    bar_count: u32,
    end_time: String,
    duration: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("gateway_bridge=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = ClientConfig::from_env().context("Failed to read configuration")?;

    match args.command {
        Commands::Plan {
            symbol,
            start,
            end,
            tz,
            output,
        } => run_plan(config, &symbol, &start, &end, &tz, output),
        Commands::Simulate {
            symbol,
            quantity,
            entry,
            profit,
            loss,
        } => run_simulate(config, &symbol, quantity, entry, profit, loss).await,
    }
}

fn run_plan(
    config: ClientConfig,
    symbol: &str,
    start: &str,
    end: &str,
    tz: &str,
    output: Option<PathBuf>,
) -> Result<()> {
    let instrument = Instrument::from_symbol(symbol);
    let client = Client::new(config.clone(), Arc::new(SimulatedTransport::default()));
    let plan = client
        .plan_history(&instrument, start, end, tz)
        .context("Failed to plan historical range")?;

    let writer: Box<dyn io::Write> = match &output {
        Some(path) => Box::new(
            std::fs::File::create(path).with_context(|| format!("Failed to create {}", path.display()))?,
        ),
        None => Box::new(io::stdout()),
    };
    let mut csv_writer = csv::Writer::from_writer(writer);

    let windows = plan.windows();
    for window in &windows {
        let request = window.request(&config.history, instrument.sec_type);
        csv_writer.serialize(WindowRow {
            start_utc: window.start.to_rfc3339(),
            end_utc: window.end.to_rfc3339(),
            bar_count: window.bar_count,
            end_time: request.end_time,
            duration: request.duration,
        })?;
    }
    csv_writer.flush()?;

    info!(windows = windows.len(), symbol = %instrument.display_symbol(), "plan written");
    Ok(())
}

async fn run_simulate(
    config: ClientConfig,
    symbol: &str,
    quantity: f64,
    entry: f64,
    profit: f64,
    loss: f64,
) -> Result<()> {
    let sim = Arc::new(SimulatedTransport::default());
    let client = Client::new(config, sim.clone());
    client.connect().await.context("Failed to connect to simulator")?;

    let instrument = client
        .resolve_contract(&Instrument::from_symbol(symbol))
        .await
        .context("Failed to resolve contract")?;
    info!(symbol = %instrument.display_symbol(), con_id = instrument.con_id, "contract resolved");

    let spread = (entry * 0.0001).max(0.01);
    sim.push_quote(&instrument, entry - spread, entry);

    let parent = client
        .place_bracket_order(&instrument, OrderSpec::market(Action::Buy, quantity), profit, loss)
        .await?;
    wait_for(&client, parent, OrderStatus::Filled).await?;

    if let Some(children) = client.bracket_children(parent) {
        for child in [children.profit, children.loss].into_iter().flatten() {
            wait_for(&client, child, OrderStatus::Submitted).await?;
        }

        // Walk the market down through the stop
        let stop = entry - loss.abs();
        sim.push_quote(&instrument, stop - spread, stop);
        if let Some(loss_id) = children.loss {
            wait_for(&client, loss_id, OrderStatus::Filled).await?;
        }
        if let Some(profit_id) = children.profit {
            wait_for(&client, profit_id, OrderStatus::Cancelled).await?;
        }
    }

    let account_name = client.get_account_name().await?;
    let account = client.get_account(&account_name).await?;

    println!("{}", serde_json::to_string_pretty(&client.orders())?);
    println!("{}", serde_json::to_string_pretty(&account)?);
    info!(cash = sim.cash(), "simulation finished");

    client.disconnect().await?;
    Ok(())
}

async fn wait_for(client: &Client, request_id: RequestId, status: OrderStatus) -> Result<()> {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if client.order(request_id).is_some_and(|o| o.status == status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    if reached.is_err() {
        bail!("order {} did not reach {} in time", request_id, status);
    }
    Ok(())
}

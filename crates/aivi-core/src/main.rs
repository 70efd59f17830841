#[cfg(feature = "cli")]
use aivi_core::{config::Config, metrics, telemetry, Assistant};
#[cfg(feature = "cli")]
use clap::{Parser, Subcommand};

#[cfg(feature = "cli")]
#[derive(Parser)]
#[command(name = "aivi", about = "Learning assistant retrieval and memory core")]
struct Cli {
    /// Learner id
    #[arg(short, long, default_value = "default")]
    user: String,

    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum Command {
    /// Answer a question from the knowledge store or the answer service
    Ask { query: Vec<String> },
    /// Print learning statistics and store counters as JSON
    Stats,
    /// Export conversations, profile and statistics to the export directory
    Export,
    /// Print the personalized greeting
    Greet,
    /// Print Prometheus metrics collected during startup
    Metrics,
}

#[cfg(feature = "cli")]
async fn run(assistant: &Assistant, user: &str, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Ask { query } => {
            let query = query.join(" ");
            let answer = assistant.answer(&query, user).await?;
            println!("{}", answer.text);
            eprintln!("[{} / {:?}]", answer.source.as_str(), answer.latency);
        }
        Command::Stats => {
            let stats = serde_json::json!({
                "learning": assistant.get_stats(user).await?,
                "knowledge": assistant.knowledge_stats(),
                "router": assistant.router_stats(),
                "storage": assistant.storage_stats().await.transpose()?,
            });
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Export => {
            for path in assistant.export_user(user).await? {
                println!("{}", path.display());
            }
        }
        Command::Greet => {
            let handle = assistant.get_or_create_memory(user).await?;
            println!("{}", handle.greeting());
        }
        Command::Metrics => print!("{}", metrics::gather()?),
    }
    Ok(())
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing(if cli.verbose { "debug" } else { "warn" });
    metrics::init_metrics()?;

    let cfg = Config::from_env()?;
    cfg.print_config();

    let assistant = Assistant::start(cfg).await?;
    let result = run(&assistant, &cli.user, cli.command).await;
    let report = assistant.shutdown().await;
    for error in &report.errors {
        eprintln!("warning: {}", error);
    }
    result
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}

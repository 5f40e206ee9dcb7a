use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use infomesh_config::InfomeshConfig;
use infomesh_core::Action;
use infomesh_node::{build_node, init_logging};
use infomesh_proof::{verify_credit_proof, CreditProof, CreditProofBuilder};
use infomesh_scheduler::{EnergyAwareScheduler, NodeScheduleInfo};
use tokio::runtime::Runtime;

#[derive(Parser)]
#[command(name = "infomesh", version, about = "InfoMesh local credit ledger CLI")]
struct Cli {
    /// Defaults to `$XDG_CONFIG_HOME/infomesh/config.toml` (or the
    /// platform equivalent) when not given.
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

fn default_config_path() -> PathBuf {
    dirs::config_dir().unwrap_or_else(|| PathBuf::from(".")).join("infomesh").join("config.toml")
}

#[derive(Subcommand)]
enum Commands {
    /// Write an example config file.
    Init,
    /// Record a creditable action.
    Record {
        action: String,
        #[arg(default_value_t = 1.0)]
        quantity: f64,
        #[arg(long)]
        off_peak: bool,
        #[arg(long, default_value = "")]
        note: String,
    },
    /// Spend credits (e.g. for a search).
    Spend {
        amount: f64,
        #[arg(long, default_value = "search")]
        reason: String,
    },
    /// Print balance, tier, search cost, and recent activity.
    Status,
    /// Select nodes for batched LLM tasks from a node-roster file.
    Schedule {
        #[arg(long)]
        nodes_file: PathBuf,
        #[arg(long, default_value_t = 1)]
        count: usize,
        #[arg(long)]
        hour: Option<u32>,
    },
    /// Build and verify signed credit proofs.
    Proof {
        #[command(subcommand)]
        cmd: ProofCmd,
    },
}

#[derive(Subcommand)]
enum ProofCmd {
    Build {
        #[arg(long, default_value_t = 10)]
        sample_size: usize,
        #[arg(long, default_value = "")]
        request_id: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    Verify {
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(default_config_path);

    match cli.command {
        Commands::Init => init_config(&config_path)?,
        Commands::Record { action, quantity, off_peak, note } => {
            let rt = Runtime::new()?;
            rt.block_on(record(&config_path, &action, quantity, off_peak, &note))?;
        }
        Commands::Spend { amount, reason } => {
            let rt = Runtime::new()?;
            rt.block_on(spend(&config_path, amount, &reason))?;
        }
        Commands::Status => {
            let rt = Runtime::new()?;
            rt.block_on(status(&config_path))?;
        }
        Commands::Schedule { nodes_file, count, hour } => schedule(&nodes_file, count, hour)?,
        Commands::Proof { cmd } => match cmd {
            ProofCmd::Build { sample_size, request_id, out } => {
                let rt = Runtime::new()?;
                rt.block_on(proof_build(&config_path, sample_size, &request_id, out))?;
            }
            ProofCmd::Verify { path } => proof_verify(&path)?,
        },
    }
    Ok(())
}

fn init_config(path: &PathBuf) -> Result<()> {
    if path.exists() {
        println!("Config already exists at {path:?}");
        return Ok(());
    }
    let cfg = InfomeshConfig::example();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, toml::to_string_pretty(&cfg)?)?;
    println!("Wrote config to {path:?}");
    Ok(())
}

async fn record(config_path: &PathBuf, action: &str, quantity: f64, off_peak: bool, note: &str) -> Result<()> {
    let cfg = InfomeshConfig::load(config_path)?;
    let node = build_node(&cfg).await?;
    let action = Action::parse(action).with_context(|| format!("unknown action {action:?}"))?;
    let entry = node.ledger.record_action(action, quantity, off_peak, note).await?;
    println!("Earned {:.4} credits ({action})", entry.credits);
    Ok(())
}

async fn spend(config_path: &PathBuf, amount: f64, reason: &str) -> Result<()> {
    let cfg = InfomeshConfig::load(config_path)?;
    let node = build_node(&cfg).await?;
    node.ledger.spend(amount, reason).await?;
    let balance = node.ledger.balance().await?;
    println!("Spent {amount:.4} credits for {reason:?}; balance now {balance:.4}");
    Ok(())
}

async fn status(config_path: &PathBuf) -> Result<()> {
    let cfg = InfomeshConfig::load(config_path)?;
    let node = build_node(&cfg).await?;
    let stats = node.ledger.stats().await?;

    println!("InfoMesh Credit Status");
    println!("{}", "=".repeat(40));
    println!("Balance:      {:>10.2} credits", stats.balance);
    println!("Tier:         {}", stats.tier.as_str());
    println!("Search cost:  {:.3} / query", stats.search_cost);
    println!("State:        {}", stats.credit_state.as_str());
    match stats.credit_state {
        infomesh_core::CreditState::Grace => {
            println!("Grace left:   {:.1} hours", stats.grace_remaining_hours.unwrap_or(0.0));
        }
        infomesh_core::CreditState::Debt => {
            println!("Debt amount:  {:.2}", stats.debt_amount);
        }
        infomesh_core::CreditState::Normal => {}
    }

    println!("\nEarnings Breakdown");
    println!("{}", "-".repeat(40));
    let mut breakdown: Vec<(Action, f64)> = node.ledger.earnings_by_action().await?.into_iter().collect();
    breakdown.sort_by(|a, b| b.1.total_cmp(&a.1));
    for (action, amount) in breakdown {
        println!("  {:<20} {:>10.2}", action.as_str(), amount);
    }

    println!("\nRecent Entries (last 10)");
    println!("{}", "-".repeat(40));
    for entry in node.ledger.recent_entries(10).await? {
        println!("  +{:>8.3}  {:<12}  {}", entry.credits, entry.action.as_str(), entry.note);
    }
    Ok(())
}

fn schedule(nodes_file: &PathBuf, count: usize, hour: Option<u32>) -> Result<()> {
    let text = std::fs::read_to_string(nodes_file).with_context(|| format!("reading {nodes_file:?}"))?;
    let nodes: Vec<NodeScheduleInfo> = serde_json::from_str(&text)?;
    let scheduler = EnergyAwareScheduler::new();
    let decisions = scheduler.schedule_batch(&nodes, count, hour);
    if decisions.is_empty() {
        println!("No LLM-capable nodes available to schedule.");
        return Ok(());
    }
    for decision in decisions {
        println!(
            "{} -> {} (multiplier {:.1}x): {}",
            decision.target_peer_id, decision.is_off_peak, decision.credit_multiplier, decision.reason
        );
    }
    Ok(())
}

async fn proof_build(config_path: &PathBuf, sample_size: usize, request_id: &str, out: Option<PathBuf>) -> Result<()> {
    let cfg = InfomeshConfig::load(config_path)?;
    let node = build_node(&cfg).await?;
    let builder = CreditProofBuilder::new(
        &node.ledger,
        node.ledger.peer_id().to_string(),
        node.identity.secret_key,
        node.identity.public_key_hex(),
    );
    let proof = builder.build_proof(sample_size, request_id).await?;
    let json = serde_json::to_string_pretty(&proof)?;
    match out {
        Some(path) => {
            std::fs::write(&path, json)?;
            println!("Wrote credit proof to {path:?}");
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn proof_verify(path: &PathBuf) -> Result<()> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {path:?}"))?;
    let proof: CreditProof = serde_json::from_str(&text)?;
    let result = verify_credit_proof(&proof);
    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.verified {
        std::process::exit(1);
    }
    Ok(())
}

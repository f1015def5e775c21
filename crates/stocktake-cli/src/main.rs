use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use stocktake_api::{EngineConfig, ScanEngine, ScanOutcome};
use stocktake_core::{BarcodePolicy, CampaignId, CampaignStatistics};
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "stk")]
#[command(about = "Inventory audit campaign CLI")]
struct Cli {
    /// Directory of reference inventory CSV files.
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Directory holding one CSV file per campaign.
    #[arg(long, default_value = "./campaigns")]
    campaigns_dir: PathBuf,

    #[arg(long, default_value = "./config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Inventory {
        #[command(subcommand)]
        command: InventoryCommand,
    },
    Campaign {
        #[command(subcommand)]
        command: CampaignCommand,
    },
    Scan(ScanArgs),
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Subcommand)]
enum InventoryCommand {
    Summary,
    List,
}

#[derive(Debug, Subcommand)]
enum CampaignCommand {
    Start(CampaignStartArgs),
    List,
    Show(CampaignIdArg),
    Restart(CampaignIdArg),
    Copy(CampaignIdArg),
    Export(CampaignExportArgs),
}

#[derive(Debug, Args)]
struct CampaignStartArgs {
    #[arg(long)]
    building: String,
    #[arg(long)]
    room: String,
    #[arg(long, default_value = "")]
    location: String,
}

#[derive(Debug, Args)]
struct CampaignIdArg {
    campaign_id: String,
}

#[derive(Debug, Args)]
struct CampaignExportArgs {
    campaign_id: String,
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct ScanArgs {
    /// Campaign to resume before scanning.
    #[arg(long)]
    campaign: String,
    /// Barcodes processed in order, one outcome each.
    #[arg(required = true)]
    barcodes: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    Show,
    SetPattern(SetPatternArgs),
}

#[derive(Debug, Args)]
struct SetPatternArgs {
    pattern: String,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Inventory { ref command } => {
            let engine = open_engine(&cli)?;
            run_inventory(command, &engine)
        }
        Command::Campaign { ref command } => {
            let mut engine = open_engine(&cli)?;
            run_campaign(command, &mut engine)
        }
        Command::Scan(ref args) => {
            let mut engine = open_engine(&cli)?;
            run_scan(args, &mut engine)
        }
        Command::Config { ref command } => run_config(command, &cli.config),
    }
}

fn open_engine(cli: &Cli) -> Result<ScanEngine> {
    let config = EngineConfig::load_or_create(&cli.config)?;
    let policy = config.barcode_policy()?;
    let engine = ScanEngine::open(&cli.data_dir, &cli.campaigns_dir, policy)?;
    Ok(engine)
}

fn run_inventory(command: &InventoryCommand, engine: &ScanEngine) -> Result<()> {
    match command {
        InventoryCommand::Summary => emit_json(serde_json::json!({
            "reference": engine.reference_summary()
        })),
        InventoryCommand::List => emit_json(serde_json::json!({
            "records": engine.reference().records()
        })),
    }
}

fn run_campaign(command: &CampaignCommand, engine: &mut ScanEngine) -> Result<()> {
    match command {
        CampaignCommand::Start(args) => {
            let state = engine.start_campaign(&args.building, &args.room, &args.location)?;
            emit_json(serde_json::json!({
                "campaign_id": state.id().as_str(),
                "building": state.building(),
                "room": state.room(),
                "location": state.location(),
                "statistics": CampaignStatistics::recompute(state.records())
            }))
        }
        CampaignCommand::List => {
            let campaigns = engine.list_campaigns()?;
            emit_json(serde_json::json!({ "campaigns": campaigns }))
        }
        CampaignCommand::Show(args) => {
            let id = CampaignId::new(args.campaign_id.clone());
            let records = engine.campaign_records(&id)?;
            emit_json(serde_json::json!({
                "campaign_id": id.as_str(),
                "statistics": CampaignStatistics::recompute(&records),
                "records": records
            }))
        }
        CampaignCommand::Restart(args) => {
            let id = CampaignId::new(args.campaign_id.clone());
            let state = engine.resume_campaign(&id)?;
            emit_json(serde_json::json!({
                "campaign_id": state.id().as_str(),
                "building": state.building(),
                "room": state.room(),
                "statistics": CampaignStatistics::recompute(state.records())
            }))
        }
        CampaignCommand::Copy(args) => {
            let source = CampaignId::new(args.campaign_id.clone());
            let state = engine.copy_campaign(&source)?;
            emit_json(serde_json::json!({
                "source_campaign_id": source.as_str(),
                "campaign_id": state.id().as_str(),
                "statistics": CampaignStatistics::recompute(state.records())
            }))
        }
        CampaignCommand::Export(args) => {
            let id = CampaignId::new(args.campaign_id.clone());
            let source = engine.campaign_file_path(&id);
            if !source.exists() {
                return Err(anyhow!("campaign not found: {id}"));
            }
            fs::copy(&source, &args.out).with_context(|| {
                format!("failed to export campaign file to {}", args.out.display())
            })?;
            emit_json(serde_json::json!({
                "campaign_id": id.as_str(),
                "out": args.out
            }))
        }
    }
}

fn run_scan(args: &ScanArgs, engine: &mut ScanEngine) -> Result<()> {
    let id = CampaignId::new(args.campaign.clone());
    engine.resume_campaign(&id)?;

    let mut results = Vec::with_capacity(args.barcodes.len());
    for raw in &args.barcodes {
        let outcome = engine.scan(raw)?;
        let mut value = serde_json::to_value(&outcome)
            .context("failed to serialize scan outcome")?;
        if let Value::Object(ref mut object) = value {
            object.insert("input".to_string(), Value::String(raw.clone()));
        }
        results.push(value);
        if let ScanOutcome::Accepted(accepted) = &outcome {
            if let Some(persist_error) = &accepted.persist_error {
                eprintln!("warning: scan stored in memory only: {persist_error}");
            }
        }
    }

    let statistics = engine.statistics()?;
    emit_json(serde_json::json!({
        "campaign_id": id.as_str(),
        "results": results,
        "statistics": statistics
    }))
}

fn run_config(command: &ConfigCommand, path: &std::path::Path) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let config = EngineConfig::load_or_create(path)?;
            emit_json(serde_json::json!({
                "config_file": path,
                "barcode_regex": config.barcode_regex
            }))
        }
        ConfigCommand::SetPattern(args) => {
            let pattern = args.pattern.trim();
            if pattern.is_empty() {
                return Err(anyhow!("barcode pattern must not be empty"));
            }
            // Refuse to persist a pattern that will not compile at startup.
            BarcodePolicy::new(Some(pattern))?;

            let mut config = EngineConfig::load_or_create(path)?;
            config.barcode_regex = pattern.to_string();
            config.save(path)?;
            emit_json(serde_json::json!({
                "config_file": path,
                "barcode_regex": config.barcode_regex,
                "updated": true
            }))
        }
    }
}

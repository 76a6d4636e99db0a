// crates/gatecli/src/main.rs

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use gatecore::record::{BpmnElementType, WorkflowInstanceIntent};
use gatecore::{
    variables_from_json, Intent, NodeSpec, ProcessDefinition, Record, RecordValue, Variables,
};
use gateruntime::{
    Broker, FileLogStorage, LogStorage, ProcessRepository, PublishMessage, RuntimeConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gateflow")]
#[command(about = "Partitioned BPMN gateway engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy a process, run one instance and print its records
    Run {
        /// Path to process definition JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Instance variables as a JSON object
        #[arg(long)]
        variables: Option<String>,

        /// Message to publish once the instance is created, as name:key[:json]
        #[arg(short, long = "message")]
        messages: Vec<String>,

        /// Runtime configuration JSON file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Number of partitions, overrides the configuration file
        #[arg(short, long)]
        partitions: Option<u32>,

        /// How long to wait for the instance to finish
        #[arg(long, default_value_t = 5_000)]
        timeout_ms: u64,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a process definition file
    Validate {
        /// Path to process definition JSON file
        file: PathBuf,
    },

    /// Create an example process definition
    Init {
        /// Output file path
        #[arg(short, long, default_value = "process.json")]
        output: PathBuf,
    },

    /// Print the records of a persisted partition log
    Replay {
        #[arg(long)]
        data_dir: PathBuf,

        #[arg(long, default_value_t = 1)]
        partition: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            variables,
            messages,
            config,
            partitions,
            timeout_ms,
            verbose,
        } => {
            init_tracing(verbose);

            let mut config = match config {
                Some(path) => RuntimeConfig::from_file(&path)
                    .with_context(|| format!("failed to read config {}", path.display()))?,
                None => RuntimeConfig::default(),
            };
            if let Some(partitions) = partitions {
                config = config.with_partition_count(partitions);
            }
            debug!(?config, "Runtime configuration");

            let variables = parse_variables(variables.as_deref())?;
            let messages = messages
                .iter()
                .map(|m| parse_message(m))
                .collect::<Result<Vec<_>>>()?;

            let timeout = Duration::from_millis(timeout_ms);
            run_process(file, config, variables, messages, timeout).await?;
        }

        Commands::Validate { file } => {
            validate_process(file)?;
        }

        Commands::Init { output } => {
            create_example_process(output)?;
        }

        Commands::Replay { data_dir, partition } => {
            replay_partition(data_dir, partition)?;
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}

fn load_process(file: &PathBuf) -> Result<ProcessDefinition> {
    let json = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    Ok(serde_json::from_str(&json)?)
}

fn parse_variables(input: Option<&str>) -> Result<Variables> {
    let Some(input) = input else {
        return Ok(Variables::new());
    };
    let json: serde_json::Value = serde_json::from_str(input)?;
    variables_from_json(json).ok_or_else(|| anyhow!("Variables must be a JSON object"))
}

/// `name:key[:json]`; the JSON part may itself contain colons.
fn parse_message(input: &str) -> Result<PublishMessage> {
    let mut parts = input.splitn(3, ':');
    let (Some(name), Some(correlation_key)) = (parts.next(), parts.next()) else {
        return Err(anyhow!("Message '{}' must look like name:key[:json]", input));
    };
    let variables = parse_variables(parts.next())?;

    Ok(PublishMessage::new(name, correlation_key)
        .with_variables(variables)
        .with_time_to_live(60_000))
}

async fn run_process(
    file: PathBuf,
    config: RuntimeConfig,
    variables: Variables,
    messages: Vec<PublishMessage>,
    timeout: Duration,
) -> Result<()> {
    println!("🚀 Loading process from: {}", file.display());
    let definition = load_process(&file)?;
    let bpmn_process_id = definition.bpmn_process_id.clone();

    println!("📋 Process: {}", bpmn_process_id);
    println!("   Nodes: {}", definition.nodes.len());
    println!("   Flows: {}", definition.flows.len());
    println!("   Partitions: {}", config.partition_count);
    println!();

    let broker = Broker::start(config, Arc::new(ProcessRepository::new())).await?;
    broker.deploy(definition)?;
    let mut records = broker.subscribe_records();

    let workflow_instance_key = broker.create_instance(&bpmn_process_id, variables).await?;
    println!("▶️  Created instance {}", workflow_instance_key);

    for message in messages {
        let name = message.name.clone();
        match broker.publish_message(message).await {
            Ok(key) => println!("✉️  Published message '{}' ({})", name, key),
            Err(e) => println!("❌ Message '{}' rejected: {}", name, e),
        }
    }

    let outcome =
        tokio::time::timeout(timeout, watch_instance(&mut records, workflow_instance_key)).await;
    broker.shutdown().await;

    println!();
    match outcome {
        Ok(Some((intent, variables))) => {
            println!("✨ Instance {} {:?}", workflow_instance_key, intent);
            if !variables.is_empty() {
                println!();
                println!("📤 Variables:");
                for (name, value) in &variables {
                    println!("   {}: {:?}", name, value);
                }
            }
            Ok(())
        }
        Ok(None) => Err(anyhow!("Record stream closed before the instance finished")),
        Err(_) => {
            println!("⏳ Instance {} still running after {:?}", workflow_instance_key, timeout);
            Ok(())
        }
    }
}

/// Print records until the process instance completes or is terminated.
async fn watch_instance(
    records: &mut broadcast::Receiver<Record>,
    workflow_instance_key: i64,
) -> Option<(WorkflowInstanceIntent, Variables)> {
    loop {
        let record = match records.recv().await {
            Ok(record) => record,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                println!("  ⚠️  {} records skipped", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        };
        println!("  {}", describe(&record));

        let Intent::WorkflowInstance(intent) = record.intent else {
            continue;
        };
        let finished = matches!(
            intent,
            WorkflowInstanceIntent::ElementCompleted | WorkflowInstanceIntent::ElementTerminated
        );
        if let Some(value) = record.workflow_instance() {
            if finished
                && record.is_event()
                && record.key == workflow_instance_key
                && value.element_type == BpmnElementType::Process
            {
                return Some((intent, value.variables.clone()));
            }
        }
    }
}

fn describe(record: &Record) -> String {
    let subject = match &record.value {
        RecordValue::WorkflowInstance(v) => v.element_id.clone(),
        RecordValue::MessageSubscription(v) => {
            format!("{} / {}", v.message_name, v.correlation_key)
        }
        RecordValue::WorkflowInstanceSubscription(v) => {
            format!("{} / {}", v.message_name, v.correlation_key)
        }
        RecordValue::Message(v) => format!("{} / {}", v.name, v.correlation_key),
        RecordValue::Timer(v) => format!("{} due {}", v.handler_element_id, v.due_date),
        RecordValue::Incident(v) => format!("{}: {}", v.element_id, v.error_message),
    };
    let rejection = record
        .rejection
        .as_ref()
        .map(|r| format!(" ({:?}: {})", r.rejection_type, r.reason))
        .unwrap_or_default();

    format!(
        "[p{} #{}] {:?} {:?} key={} {}{}",
        record.partition_id,
        record.position,
        record.record_type,
        record.intent,
        record.key,
        subject,
        rejection
    )
}

fn validate_process(file: PathBuf) -> Result<()> {
    println!("🔍 Validating process: {}", file.display());

    let definition = load_process(&file)?;
    definition.validate()?;

    println!("✅ Process is valid:");
    println!("   Id: {}", definition.bpmn_process_id);
    println!("   Nodes: {}", definition.nodes.len());
    println!("   Flows: {}", definition.flows.len());

    Ok(())
}

fn create_example_process(output: PathBuf) -> Result<()> {
    let mut definition = ProcessDefinition::new("order-payment")
        .with_node(NodeSpec::start("start"))
        .with_node(NodeSpec::event_based_gateway("await-payment"))
        .with_node(NodeSpec::message_catch("payment-received", "payment", "orderId"))
        .with_node(NodeSpec::timer_catch("payment-timeout", 30_000))
        .with_node(NodeSpec::task("ship").with_output("shipped", true))
        .with_node(NodeSpec::end("done"))
        .with_node(NodeSpec::end("cancelled"))
        .connect("to-await", "start", "await-payment")
        .connect("to-payment", "await-payment", "payment-received")
        .connect("to-timeout", "await-payment", "payment-timeout")
        .connect("to-ship", "payment-received", "ship")
        .connect("to-done", "ship", "done")
        .connect("to-cancelled", "payment-timeout", "cancelled");
    definition.name = Some("Order payment".to_string());
    definition.validate()?;

    let json = serde_json::to_string_pretty(&definition)?;
    std::fs::write(&output, json)?;

    println!("✨ Created example process: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  gateflow run --file {} --variables '{{\"orderId\": \"order-1\"}}' \\
         --message 'payment:order-1:{{\"amount\": 42}}'",
        output.display()
    );

    Ok(())
}

fn replay_partition(data_dir: PathBuf, partition: u32) -> Result<()> {
    let path = FileLogStorage::partition_path(&data_dir, partition);
    if !path.exists() {
        return Err(anyhow!("No log for partition {} at {}", partition, path.display()));
    }

    let mut storage = FileLogStorage::open(&data_dir, partition)?;
    let records = storage.load()?;

    println!("📜 Partition {}: {} records", partition, records.len());
    for record in &records {
        println!("  {}", describe(record));
    }

    Ok(())
}

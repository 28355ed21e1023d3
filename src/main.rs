use clap::{Parser, ValueEnum};
use serde::Serialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use partyflow::api::Envelope;
use partyflow::config::NodeConfig;
use partyflow::federation::PartyRoute;
use partyflow::node::Node;
use partyflow::scheduler::{JobFilter, JobRecord, PartyRef, Status};
use partyflow::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "partyflow")]
#[command(version)]
#[command(about = "Control plane for jobs run jointly by several parties")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the control plane for one party
    Server(ServerArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Party this node serves
    #[arg(long, default_value = "1")]
    party_id: u64,

    /// Address to bind the HTTP API on
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(long, default_value = "9380")]
    port: u16,

    /// Root directory for job specs, logs, status records and models
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Routes to other parties (comma-separated, format: "role:party_id:host:port").
    /// Use "*" as role to match any role of that party.
    /// Example: "host:10000:127.0.0.1:9381,*:9999:127.0.0.1:9382"
    #[arg(long, default_value = "")]
    routes: String,

    /// JSON route table, re-read on every lookup and consulted before --routes
    #[arg(long)]
    route_file: Option<PathBuf>,

    /// Timeout for calls to other parties, in milliseconds
    #[arg(long, default_value = "5000")]
    propagation_timeout_ms: u64,

    /// Keep status records in memory only
    #[arg(long)]
    in_memory: bool,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Server address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:9380")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a job from its DSL and runtime configuration files
    Submit {
        /// Path to the job DSL (JSON)
        #[arg(long)]
        dsl: PathBuf,

        /// Path to the runtime configuration (JSON)
        #[arg(long)]
        conf: PathBuf,
    },
    /// Cancel a job everywhere it has not finished yet
    Stop { job_id: String },
    /// List jobs, optionally filtered
    Query {
        #[arg(long)]
        job_id: Option<String>,
        #[arg(long)]
        role: Option<String>,
        #[arg(long)]
        party_id: Option<u64>,
        #[arg(long)]
        status: Option<Status>,
    },
    /// Show the DSL, runtime configuration and model info of a job
    Config { job_id: String },
    /// Download the log archive of a job
    Log {
        job_id: String,

        /// Directory to write job_<id>_log.tar.gz into
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },
    /// Kill a job at a party. Addressed to the initiator, it kills the job at
    /// every party.
    Kill {
        job_id: String,
        #[arg(long)]
        role: String,
        #[arg(long)]
        party_id: u64,
        /// Initiator as "role:party_id"
        #[arg(long)]
        initiator: String,
    },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobListItem {
    job_id: String,
    role: String,
    party_id: u64,
    status: Status,
    is_initiator: bool,
    update_time: String,
}

impl From<JobRecord> for JobListItem {
    fn from(r: JobRecord) -> Self {
        Self {
            job_id: r.job_id,
            role: r.role,
            party_id: r.party_id,
            status: r.status,
            is_initiator: r.is_initiator,
            update_time: r.update_time.to_rfc3339(),
        }
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_routes(routes_str: &str) -> Vec<PartyRoute> {
    if routes_str.is_empty() {
        return Vec::new();
    }

    routes_str
        .split(',')
        .filter_map(|route| {
            let parts: Vec<&str> = route.trim().split(':').collect();
            if parts.len() == 4 {
                let party_id: u64 = parts[1].parse().ok()?;
                let addr = format!("{}:{}", parts[2], parts[3]);
                Some(PartyRoute::new(parts[0], party_id, addr))
            } else {
                tracing::warn!(route, "Invalid route format, expected role:party_id:host:port");
                None
            }
        })
        .collect()
}

fn parse_party(s: &str) -> Result<PartyRef, Box<dyn std::error::Error>> {
    let (role, party_id) = s
        .split_once(':')
        .ok_or_else(|| format!("expected role:party_id, got '{}'", s))?;
    Ok(PartyRef::new(role, party_id.parse::<u64>()?))
}

async fn read_json(path: &PathBuf) -> Result<Value, Box<dyn std::error::Error>> {
    let raw = tokio::fs::read(path).await?;
    serde_json::from_slice(&raw).map_err(|e| format!("{}: {}", path.display(), e).into())
}

/// POST `body` to `path` and fail on a non-zero retcode.
async fn call(
    http: &reqwest::Client,
    args: &ClientArgs,
    path: &str,
    body: Value,
) -> Result<Envelope, Box<dyn std::error::Error>> {
    let url = format!("{}{}", args.addr.trim_end_matches('/'), path);
    let envelope: Envelope = http.post(url).json(&body).send().await?.json().await?;
    if !envelope.is_success() {
        return Err(format!("retcode {}: {}", envelope.retcode, envelope.retmsg).into());
    }
    Ok(envelope)
}

fn print_envelope(envelope: &Envelope, output: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(envelope)?),
        OutputFormat::Table => println!("{}", envelope.retmsg),
    }
    Ok(())
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let listen_addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let config = NodeConfig {
        party_id: args.party_id,
        listen_addr,
        data_dir: args.data_dir,
        routes: parse_routes(&args.routes),
        route_file: args.route_file,
        propagation_timeout_ms: args.propagation_timeout_ms,
        persist_status: !args.in_memory,
    };

    tracing::info!(
        party_id = config.party_id,
        listen_addr = %config.listen_addr,
        routes = ?config.routes.iter().map(|r| format!("{}:{}@{}", r.role, r.party_id, r.addr)).collect::<Vec<_>>(),
        route_file = ?config.route_file,
        persist_status = config.persist_status,
        "Starting partyflow node"
    );

    let shutdown = install_shutdown_handler();
    let node = Node::new(config).await?;
    node.run(shutdown).await?;

    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_job_submit(
    http: &reqwest::Client,
    args: &ClientArgs,
    dsl: PathBuf,
    conf: PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    let body = json!({
        "job_dsl": read_json(&dsl).await?,
        "job_runtime_conf": read_json(&conf).await?,
    });
    let envelope = call(http, args, "/submit", body).await?;
    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&envelope)?),
        OutputFormat::Table => {
            println!("Job submitted successfully!");
            println!("Job ID: {}", envelope.job_id.unwrap_or_default());
            if let Some(model) = envelope.data.as_ref().and_then(|d| d.get("model_info")) {
                println!("Model:  {}", model);
            }
        }
    }
    Ok(())
}

async fn handle_job_query(
    http: &reqwest::Client,
    args: &ClientArgs,
    filter: JobFilter,
) -> Result<(), Box<dyn std::error::Error>> {
    let envelope = call(http, args, "/query", serde_json::to_value(&filter)?).await?;
    let records: Vec<JobRecord> =
        serde_json::from_value(envelope.data.unwrap_or(Value::Array(Vec::new())))?;
    let jobs: Vec<JobListItem> = records.into_iter().map(JobListItem::from).collect();

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&jobs)?),
        OutputFormat::Table => {
            println!(
                "{:<22} {:<10} {:<10} {:<10} {:<9} UPDATED",
                "JOB ID", "ROLE", "PARTY", "STATUS", "INITIATOR"
            );
            println!("{}", "-".repeat(90));
            for job in &jobs {
                println!(
                    "{:<22} {:<10} {:<10} {:<10} {:<9} {}",
                    job.job_id,
                    job.role,
                    job.party_id,
                    job.status,
                    if job.is_initiator { "yes" } else { "" },
                    job.update_time
                );
            }
            println!();
            println!("{} job record(s)", jobs.len());
        }
    }
    Ok(())
}

async fn handle_job_log(
    http: &reqwest::Client,
    args: &ClientArgs,
    job_id: String,
    dir: PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/log", args.addr.trim_end_matches('/'));
    let response = http.get(url).query(&[("job_id", &job_id)]).send().await?;
    if !response.status().is_success() {
        let envelope: Envelope = response.json().await?;
        return Err(format!("retcode {}: {}", envelope.retcode, envelope.retmsg).into());
    }
    let archive = response.bytes().await?;
    let path = dir.join(format!("job_{}_log.tar.gz", job_id));
    tokio::fs::write(&path, &archive).await?;

    match args.output {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&json!({"path": path, "bytes": archive.len()}))?
        ),
        OutputFormat::Table => println!("Wrote {} ({} bytes)", path.display(), archive.len()),
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Job { client, command } => {
            let http = reqwest::Client::new();
            match command {
                JobCommands::Submit { dsl, conf } => {
                    handle_job_submit(&http, &client, dsl, conf).await?;
                }
                JobCommands::Stop { job_id } => {
                    let envelope = call(&http, &client, "/stop", json!({ "job_id": job_id })).await?;
                    print_envelope(&envelope, &client.output)?;
                }
                JobCommands::Query {
                    job_id,
                    role,
                    party_id,
                    status,
                } => {
                    let filter = JobFilter {
                        job_id,
                        role,
                        party_id,
                        status,
                        ..Default::default()
                    };
                    handle_job_query(&http, &client, filter).await?;
                }
                JobCommands::Config { job_id } => {
                    let envelope =
                        call(&http, &client, "/config", json!({ "job_id": job_id })).await?;
                    match client.output {
                        OutputFormat::Json => {
                            println!("{}", serde_json::to_string_pretty(&envelope)?)
                        }
                        OutputFormat::Table => println!(
                            "{}",
                            serde_json::to_string_pretty(&envelope.data.unwrap_or_default())?
                        ),
                    }
                }
                JobCommands::Log { job_id, dir } => {
                    handle_job_log(&http, &client, job_id, dir).await?;
                }
                JobCommands::Kill {
                    job_id,
                    role,
                    party_id,
                    initiator,
                } => {
                    let initiator = parse_party(&initiator)?;
                    let path = format!("/{}/{}/{}/kill", job_id, role, party_id);
                    let envelope =
                        call(&http, &client, &path, json!({ "job_initiator": initiator })).await?;
                    print_envelope(&envelope, &client.output)?;
                }
            }
        }
    }

    Ok(())
}

//! porter CLI: operator interface to the orchestration daemon.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use porter::config::Config;
use porter::dispatcher::HttpCallbackSink;
use porter::engine::{Engine, EngineConfig};
use porter::executor::{ExecutorRegistry, HookUndoer};
use porter::telemetry::{TelemetryConfig, init_telemetry};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "porter", about = "Job orchestration for code-migration pipelines")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestration daemon
    Serve {
        /// Directory containing executor TOML configs
        #[arg(long, default_value = "executors")]
        executors: PathBuf,
        /// Base directory for per-job workspaces
        #[arg(long, default_value = "/tmp/porter-workspaces")]
        workspaces: PathBuf,
        /// Override the configured worker count
        #[arg(long)]
        workers: Option<usize>,
        /// Override the configured bind address
        #[arg(long)]
        bind: Option<SocketAddr>,
    },
    /// Job operations against a running daemon
    Job {
        /// Daemon base URL
        #[arg(long, global = true, default_value = "http://127.0.0.1:8080")]
        server: String,
        #[command(subcommand)]
        action: JobAction,
    },
}

#[derive(Subcommand)]
enum JobAction {
    /// Submit a new job
    Submit {
        /// Job type (determines executor routing)
        job_type: String,
        /// JSON payload
        #[arg(long)]
        payload: Option<String>,
        /// Dedup token; resubmission returns the existing job
        #[arg(long)]
        idempotency_key: Option<String>,
        /// Priority (higher = dispatched first)
        #[arg(long, default_value_t = 0)]
        priority: i32,
        /// Job budget in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Retries for the retryable phases
        #[arg(long)]
        max_retries: Option<u32>,
        /// Correlation metadata as key=value pairs
        #[arg(long)]
        metadata: Vec<String>,
        /// Callback URL notified once on completion or failure
        #[arg(long)]
        callback: Option<String>,
    },
    /// Show a job's status
    Status {
        /// Job ID (full UUID)
        id: Uuid,
    },
    /// List jobs
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            executors,
            workspaces,
            workers,
            bind,
        } => cmd_serve(executors, workspaces, workers, bind).await,
        Command::Job { server, action } => match action {
            JobAction::Submit {
                job_type,
                payload,
                idempotency_key,
                priority,
                timeout_ms,
                max_retries,
                metadata,
                callback,
            } => {
                cmd_job_submit(
                    &server,
                    job_type,
                    payload,
                    idempotency_key,
                    priority,
                    timeout_ms,
                    max_retries,
                    metadata,
                    callback,
                )
                .await
            }
            JobAction::Status { id } => cmd_job_status(&server, id).await,
            JobAction::List => cmd_job_list(&server).await,
        },
    }
}

async fn cmd_serve(
    executors: PathBuf,
    workspaces: PathBuf,
    workers: Option<usize>,
    bind: Option<SocketAddr>,
) -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "porter".to_string(),
    })?;

    let registry = if executors.is_dir() {
        ExecutorRegistry::load_from_dir(&executors, &workspaces)?
    } else {
        tracing::warn!(
            dir = %executors.display(),
            "executor dir missing, starting with an empty registry"
        );
        ExecutorRegistry::empty()
    };

    let engine = Engine::new(
        EngineConfig {
            workers: workers.unwrap_or(config.workers),
            ..EngineConfig::default()
        },
        registry,
        Arc::new(HookUndoer::new(workspaces)),
        Arc::new(HttpCallbackSink::new(config.callback_token)),
    );
    let handles = engine.start();

    let bind_addr = bind.unwrap_or(config.bind_addr);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(%bind_addr, "submission API listening");

    let shutdown_engine = engine.clone();
    axum::serve(listener, porter::api::router(engine))
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            shutdown_engine.shutdown();
        })
        .await?;

    for handle in handles {
        handle.abort();
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_job_submit(
    server: &str,
    job_type: String,
    payload: Option<String>,
    idempotency_key: Option<String>,
    priority: i32,
    timeout_ms: Option<u64>,
    max_retries: Option<u32>,
    metadata: Vec<String>,
    callback: Option<String>,
) -> anyhow::Result<()> {
    let payload: serde_json::Value = match payload {
        Some(json) => serde_json::from_str(&json)?,
        None => serde_json::json!({}),
    };

    let mut meta = HashMap::new();
    for pair in metadata {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("metadata must be key=value, got {pair:?}"))?;
        meta.insert(key.to_string(), value.to_string());
    }

    let body = serde_json::json!({
        "job_type": job_type,
        "payload": payload,
        "idempotency_key": idempotency_key,
        "priority": priority,
        "timeout_ms": timeout_ms,
        "max_retries": max_retries,
        "metadata": meta,
    });

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{server}/jobs"))
        .json(&body)
        .send()
        .await?;
    let status = response.status();
    let body: serde_json::Value = response.json().await?;
    if !status.is_success() {
        anyhow::bail!("submit failed ({status}): {body}");
    }

    let job_id = body["job_id"].as_str().unwrap_or_default().to_string();
    println!("Accepted: {job_id}");
    println!("Status:   {server}{}", body["status_url"].as_str().unwrap_or_default());

    if let Some(target) = callback {
        let response = client
            .post(format!("{server}/jobs/{job_id}/callback"))
            .json(&serde_json::json!({ "target": target }))
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!("callback registration failed: {}", response.status());
        }
        println!("Callback: {target}");
    }
    Ok(())
}

async fn cmd_job_status(server: &str, id: Uuid) -> anyhow::Result<()> {
    let response = reqwest::get(format!("{server}/jobs/{id}")).await?;
    let status = response.status();
    let body: serde_json::Value = response.json().await?;
    if !status.is_success() {
        anyhow::bail!("status failed ({status}): {body}");
    }

    println!("ID:        {id}");
    println!("Type:      {}", body["job_type"].as_str().unwrap_or("-"));
    println!("Phase:     {}", body["phase"].as_str().unwrap_or("-"));
    println!(
        "Progress:  {:.0}%",
        body["progress"].as_f64().unwrap_or(0.0) * 100.0
    );
    println!(
        "Completed: {}",
        body["phases_completed"]
            .as_array()
            .map(|phases| {
                phases
                    .iter()
                    .filter_map(|p| p.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default()
    );
    println!("Retries:   {}", body["retry_count"].as_u64().unwrap_or(0));
    if !body["result"].is_null() {
        println!("Result:    {}", serde_json::to_string_pretty(&body["result"])?);
    }
    if !body["error"].is_null() {
        println!(
            "Error:     [{}/{}] {}",
            body["error"]["phase"].as_str().unwrap_or("-"),
            body["error"]["kind"].as_str().unwrap_or("-"),
            body["error"]["detail"].as_str().unwrap_or("-"),
        );
    }
    Ok(())
}

async fn cmd_job_list(server: &str) -> anyhow::Result<()> {
    let response = reqwest::get(format!("{server}/jobs")).await?;
    let status = response.status();
    let jobs: Vec<serde_json::Value> = response.json().await?;
    if !status.is_success() {
        anyhow::bail!("list failed ({status})");
    }

    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<16}  {:<12}  {:>8}  RETRIES",
        "ID", "TYPE", "PHASE", "PROGRESS"
    );
    println!("{}", "-".repeat(88));
    for job in &jobs {
        println!(
            "{:<36}  {:<16}  {:<12}  {:>7.0}%  {}",
            job["job_id"].as_str().unwrap_or("-"),
            job["job_type"].as_str().unwrap_or("-"),
            job["phase"].as_str().unwrap_or("-"),
            job["progress"].as_f64().unwrap_or(0.0) * 100.0,
            job["retry_count"].as_u64().unwrap_or(0),
        );
    }
    println!("\n{} job(s)", jobs.len());
    Ok(())
}

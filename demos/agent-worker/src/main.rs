//! Runs an agent job in a supervised worker process.
//!
//! `agent-worker host` starts itself again as `agent-worker worker`, enqueues a
//! `process-message` job through the control channel and waits for its result. The worker
//! owns the job queue but reaches the API key and the chat history only through the host.
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use taskloom::{
    channel::{queue::QUEUE_EVENT, BoxError},
    prelude::*,
    queue::JobStatusReport,
};
use taskloom_sqlx::SqliteJobStore;
use tracing_subscriber::EnvFilter;

const GET_DECRYPTED_API_KEY: &str = "getDecryptedApiKey";
const APPEND_CHAT_MESSAGE: &str = "appendChatMessage";

#[derive(Parser)]
#[command(name = "agent-worker", about = "Runs an agent job in a supervised worker process")]
struct Cli {
    /// The SQLite database holding the jobs.
    #[arg(long, default_value = "sqlite://agent-worker.db?mode=rwc")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Supervise a worker process and run one message through it.
    Host {
        /// The chat the message belongs to.
        #[arg(long, default_value = "demo")]
        chat_id: String,
        /// The user message to process.
        #[arg(long, default_value = "Hello from the host")]
        message: String,
        /// How long to wait for the job before giving up, in seconds.
        #[arg(long, default_value_t = 30)]
        wait: u64,
    },
    /// Serve the queue on stdin and stdout. Started by the host.
    Worker,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the control channel of the worker.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Host {
            chat_id,
            message,
            wait,
        } => host(&cli.database_url, chat_id, message, Duration::from_secs(wait)).await,
        Command::Worker => worker(&cli.database_url).await,
    }
}

async fn host(
    database_url: &str,
    chat_id: String,
    message: String,
    wait: Duration,
) -> anyhow::Result<()> {
    SqliteJobStore::connect(database_url)
        .await?
        .run_migrations()
        .await
        .context("failed to prepare the job database")?;

    let program = std::env::current_exe().context("cannot locate the current executable")?;
    let config = SupervisorConfig::new(program)
        .with_args(["--database-url", database_url, "worker"])
        .with_max_restarts(3);
    let supervisor = ProcessSupervisor::start(config, host_actions())?;

    let result = run_message(&supervisor, chat_id, message, wait).await;
    supervisor.shutdown().await?;
    result
}

/// The privileged actions the worker may call.
fn host_actions() -> ActionRouter {
    ActionRouter::new()
        .with_action(GET_DECRYPTED_API_KEY, |payload| async move {
            let provider = payload
                .get("provider")
                .and_then(Value::as_str)
                .unwrap_or("default")
                .to_owned();
            let key = std::env::var("AGENT_API_KEY").unwrap_or_else(|_| "sk-demo-0000".to_owned());
            tracing::info!(%provider, "Handing out API key");
            Ok::<_, BoxError>(json!(key))
        })
        .with_action(APPEND_CHAT_MESSAGE, |payload| async move {
            let message: ChatMessage = serde_json::from_value(payload)?;
            tracing::info!(
                chat_id = %message.chat_id,
                role = %message.role,
                "Appended chat message: {}",
                message.content
            );
            Ok::<_, BoxError>(json!({ "stored": true }))
        })
        .with_action(QUEUE_EVENT, |payload| async move {
            let event: QueueEvent = serde_json::from_value(payload)?;
            match event.job_id() {
                Some(job_id) => tracing::info!(%job_id, "Queue event {}", event.name()),
                None => tracing::info!("Queue event {}", event.name()),
            }
            Ok::<_, BoxError>(Value::Null)
        })
}

async fn run_message(
    supervisor: &ProcessSupervisor,
    chat_id: String,
    message: String,
    wait: Duration,
) -> anyhow::Result<()> {
    let queue = supervisor.queue_client()?;
    let data = serde_json::to_value(ProcessMessage { chat_id, message })?;
    let job = queue
        .add_job(AgentExecutor::NAME, data, JobOptions::default())
        .await?;
    tracing::info!(job_id = %job.id, "Enqueued message");

    let report = tokio::time::timeout(wait, wait_for(&queue, job.id))
        .await
        .with_context(|| format!("job {} did not finish within {wait:?}", job.id))??;

    match report.status {
        JobStatus::Completed => {
            let reply: Reply = serde_json::from_value(report.result.unwrap_or_default())?;
            println!("{}", reply.reply);
        }
        status => bail!(
            "job {} ended {status}: {}",
            report.id,
            report.error.unwrap_or_default()
        ),
    }

    let stats = queue.get_queue_stats().await?;
    tracing::info!(?stats, "Queue stats");
    Ok(())
}

async fn wait_for(queue: &QueueClient, job_id: JobId) -> anyhow::Result<JobStatusReport> {
    let mut interval = tokio::time::interval(Duration::from_millis(200));
    loop {
        interval.tick().await;
        match queue.get_job_status(job_id).await? {
            Some(report) if report.status.is_terminal() => return Ok(report),
            Some(report) => tracing::debug!(status = %report.status, "Waiting for job"),
            None => bail!("job {job_id} disappeared"),
        }
    }
}

async fn worker(database_url: &str) -> anyhow::Result<()> {
    let store = SqliteJobStore::connect(database_url).await?;
    store.run_migrations().await?;
    WorkerProcess::new(QueueService::new(store))
        .with_event_forwarding()
        .run(|runtime, host| runtime.with_executor(AgentExecutor { host }))
        .await?;
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProcessMessage {
    chat_id: String,
    message: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatMessage {
    chat_id: String,
    role: String,
    content: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Reply {
    reply: String,
}

/// Answers a chat message with the help of the host.
struct AgentExecutor {
    host: HostClient,
}

#[async_trait]
impl Executor for AgentExecutor {
    type Data = ProcessMessage;
    type Output = Reply;
    const NAME: &'static str = "process-message";
    const MAX_ATTEMPTS: u32 = 3;

    async fn execute(&self, job: Job<Self::Data>) -> Result<Self::Output, ExecutionError> {
        let key: String = self
            .host
            .call(GET_DECRYPTED_API_KEY, json!({ "provider": "demo" }))
            .await
            .map_err(|error| ExecutionError::from_error(&error))?;
        let suffix: String = key
            .chars()
            .rev()
            .take(4)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        let reply = format!(
            "Received {} characters using key ****{suffix}: {}",
            job.data.message.chars().count(),
            job.data.message
        );

        let _: Value = self
            .host
            .call(
                APPEND_CHAT_MESSAGE,
                ChatMessage {
                    chat_id: job.data.chat_id.clone(),
                    role: "assistant".to_owned(),
                    content: reply.clone(),
                },
            )
            .await
            .map_err(|error| ExecutionError::from_error(&error))?;

        Ok(Reply { reply })
    }

    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(60))
    }
}

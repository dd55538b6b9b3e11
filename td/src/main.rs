//! `td` binary entry point: parses the CLI, loads config, resolves the
//! namespace, and either runs the daemon loop or submits one task.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use eyre::{Context, Result};
use tracing::info;

use taskdaemon::cli::{Cli, Command};
use taskdaemon::completion::EvidenceRecorder;
use taskdaemon::config::Config;
use taskdaemon::domain::{TaskRecord, TaskStatus, TaskType, detect_task_type};
use taskdaemon::executor::anthropic::AnthropicExecutor;
use taskdaemon::executor::{Executor, ExecutorRequest, ExecutorResult};
use taskdaemon::namespace::{self, Namespace, NAMESPACE_ENV_VAR};
use taskdaemon::queue::QueueStore;
use taskdaemon::supervisor::Supervisor;
use taskdaemon::worker::{TaskWorker, executor_permits_for};
use taskdaemon::error::ExecutorError;

/// Stands in for a real executor when no API key is configured. Gate
/// 1 always rejects the task before this would ever be invoked; it
/// exists only so a worker can be constructed unconditionally.
struct UnavailableExecutor;

#[async_trait]
impl Executor for UnavailableExecutor {
    async fn execute(&self, _request: ExecutorRequest) -> std::result::Result<ExecutorResult, ExecutorError> {
        Err(ExecutorError::MissingApiKey("no executor configured".to_string()))
    }

    fn name(&self) -> &str {
        "unavailable"
    }
}

fn setup_logging() -> Result<()> {
    let log_dir = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from(".")).join("taskdaemon").join("logs");
    fs::create_dir_all(&log_dir).context("failed to create log directory")?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();
    info!(?log_dir, "logging initialized");
    Ok(())
}

fn resolve_namespace(explicit: Option<&str>, project_root: &std::path::Path) -> Result<Namespace> {
    let env_value = std::env::var(NAMESPACE_ENV_VAR).ok();
    let opts = namespace::BuildOptions {
        explicit_name: explicit,
        env_value: env_value.as_deref(),
        project_root: Some(project_root),
        auto_derive: true,
    };
    Ok(namespace::build(&opts)?)
}

fn build_executor(config: &Config) -> (Arc<dyn Executor>, bool) {
    match AnthropicExecutor::from_config(&config.llm) {
        Ok(executor) => (Arc::new(executor), true),
        Err(err) => {
            tracing::warn!(%err, "build_executor: no usable executor, tasks will fail the API key gate");
            (Arc::new(UnavailableExecutor, ), false)
        }
    }
}

async fn run_daemon(queue: QueueStore, namespace: &Namespace, config: Config, state_dir: PathBuf) -> Result<()> {
    let (executor, api_key_present) = build_executor(&config);
    let assembler = taskdaemon::prompts::PromptAssembler::new(taskdaemon::prompts::PromptLoader::new(std::env::current_dir()?));

    let worker = TaskWorker::new(
        namespace.as_str(),
        queue.clone(),
        executor,
        assembler,
        state_dir.clone(),
        api_key_present,
        config.llm.model.clone(),
        config.task_limits.clone(),
        config.retry.clone(),
        executor_permits_for(&config.parallel_limits),
    );
    let worker_handle = worker.spawn();

    let supervisor = Supervisor::new(queue, state_dir, config.supervisor.clone(), config.timeouts.clone(), config.retry.clone());
    let supervisor_handle = tokio::spawn(supervisor.run());

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("run_daemon: received shutdown signal");
    worker_handle.abort();
    supervisor_handle.abort();
    Ok(())
}

async fn submit_and_wait(queue: QueueStore, namespace: &Namespace, config: Config, state_dir: PathBuf, prompt: String, session_id: String, thread_id: String) -> Result<()> {
    let (executor, api_key_present) = build_executor(&config);
    let assembler = taskdaemon::prompts::PromptAssembler::new(taskdaemon::prompts::PromptLoader::new(std::env::current_dir()?));

    let worker = TaskWorker::new(
        namespace.as_str(),
        queue.clone(),
        executor,
        assembler,
        state_dir,
        api_key_present,
        config.llm.model.clone(),
        config.task_limits.clone(),
        config.retry.clone(),
        executor_permits_for(&config.parallel_limits),
    );
    worker.spawn();

    let task_type: TaskType = detect_task_type(&prompt);
    let seq = queue.next_seq();
    let task_id = uuid::Uuid::now_v7().to_string();
    let record = TaskRecord::new(task_id.clone(), namespace.as_str(), session_id, thread_id, None, task_type, prompt, seq);
    queue.enqueue(record).await.context("failed to enqueue task")?;

    let mut events = queue.subscribe_events();
    loop {
        let current = queue.get(&task_id).await.context("failed to read task")?.ok_or_else(|| eyre::eyre!("task vanished"))?;
        if current.status.is_terminal() {
            println!("{}", serde_json::to_string_pretty(&current)?);
            std::process::exit(if current.status == TaskStatus::Complete { 0 } else { 1 });
        }
        events.recv().await.ok();
    }
}

fn main() -> Result<()> {
    setup_logging()?;
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_ref()).context("failed to load configuration")?;
    let project_root = std::env::current_dir()?;

    let namespace = resolve_namespace(cli.namespace.as_deref(), &project_root)?;
    let state_dir = namespace.state_dir(&project_root);
    fs::create_dir_all(&state_dir).context("failed to create state directory")?;

    // Gate 2 failure at startup is surfaced immediately rather than
    // deferred to the first task's dispatch.
    if !EvidenceRecorder::new(&state_dir).is_writable() {
        eyre::bail!("evidence directory under {} is not writable", state_dir.display());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build().context("failed to start tokio runtime")?;

    runtime.block_on(async move {
        let queue = QueueStore::spawn(&state_dir).context("failed to open queue store")?;

        match cli.command {
            Command::Start => run_daemon(queue, &namespace, config, state_dir).await,
            Command::Run { prompt, session_id, thread_id } => {
                let prompt = match prompt {
                    Some(p) => p,
                    None => {
                        use std::io::Read;
                        let mut buf = String::new();
                        std::io::stdin().read_to_string(&mut buf).context("failed to read prompt from stdin")?;
                        buf
                    }
                };
                submit_and_wait(queue, &namespace, config, state_dir, prompt, session_id, thread_id).await
            }
        }
    })
}

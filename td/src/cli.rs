//! Minimal non-interactive CLI: enough surface to start the daemon
//! loop or submit one task and wait for its terminal status. The
//! REPL/slash-command surface this would sit behind is out of scope
//! here.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "td", about = "Local task orchestrator", version)]
pub struct Cli {
    /// Path to a config file; falls back to project-local, then
    /// user-config-dir, then built-in defaults.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Explicit namespace; overrides PM_RUNNER_NAMESPACE and path
    /// derivation.
    #[arg(short, long, global = true)]
    pub namespace: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the QueueStore, TaskWorker, and Supervisor for this
    /// namespace until interrupted.
    Start,

    /// Enqueue one task and block until it reaches a terminal status,
    /// printing the final record as JSON.
    Run {
        /// Task prompt; read from stdin if omitted.
        #[arg(long)]
        prompt: Option<String>,

        #[arg(long, default_value = "default")]
        session_id: String,

        #[arg(long, default_value = "default")]
        thread_id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_parses_with_no_extra_args() {
        let cli = Cli::try_parse_from(["td", "start"]).unwrap();
        assert!(matches!(cli.command, Command::Start));
    }

    #[test]
    fn run_accepts_prompt_and_defaults() {
        let cli = Cli::try_parse_from(["td", "run", "--prompt", "summarize the README"]).unwrap();
        match cli.command {
            Command::Run { prompt, session_id, thread_id } => {
                assert_eq!(prompt.as_deref(), Some("summarize the README"));
                assert_eq!(session_id, "default");
                assert_eq!(thread_id, "default");
            }
            _ => panic!("expected Run"),
        }
    }

    #[test]
    fn namespace_and_config_flags_are_global() {
        let cli = Cli::try_parse_from(["td", "--namespace", "ns1", "start"]).unwrap();
        assert_eq!(cli.namespace.as_deref(), Some("ns1"));
    }
}

// src/cli.rs

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::command_handler::CommandHandler;
use crate::config::Config;
use crate::environment::EnvironmentManager;
use crate::feedback::FeedbackTracker;
use crate::process_wrapper::ProcessWrapper;
use crate::store::{ExtractionStore, FileExtractionStore, FileSessionStore, SessionStore};
use crate::user_manager::{GitConfig, UserManager, WorkerRole};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Agent process supervision and streaming extraction", long_about = None)]
pub struct Cli {
    /// Optional path to the configuration file
    #[clap(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[clap(long, value_name = "LEVEL", value_enum, default_value_t = LogLevelCli::Info)]
    pub log_level: LogLevelCli,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(clap::ValueEnum, Clone, Debug)]
pub enum LogLevelCli {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevelCli {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevelCli::Trace => "trace",
            LogLevelCli::Debug => "debug",
            LogLevelCli::Info => "info",
            LogLevelCli::Warn => "warn",
            LogLevelCli::Error => "error",
        };
        write!(f, "{s}")
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Launch and supervise a command under a PTY.
    Run {
        #[clap(long)]
        agent: String,
        #[clap(long)]
        environment: Option<String>,
        #[clap(long)]
        as_user: Option<String>,
        command: String,
        args: Vec<String>,
    },
    /// Worker-user provisioning.
    #[clap(subcommand)]
    Users(UsersCommands),
    /// Environment/sandbox inspection.
    #[clap(subcommand)]
    Env(EnvCommands),
    /// Feedback-tracker reporting.
    #[clap(subcommand)]
    Feedback(FeedbackCommands),
}

#[derive(Subcommand, Debug)]
pub enum UsersCommands {
    /// Provision a new OS worker user.
    Create {
        username: String,
        #[clap(long, value_enum, default_value_t = WorkerRoleCli::Worker)]
        role: WorkerRoleCli,
        #[clap(long)]
        git_name: String,
        #[clap(long)]
        git_email: String,
    },
    /// List registered worker users.
    List,
    /// Verify a worker user exists at the OS level.
    Verify { username: String },
}

#[derive(clap::ValueEnum, Clone, Debug)]
pub enum WorkerRoleCli {
    Worker,
    Manager,
}

impl From<WorkerRoleCli> for WorkerRole {
    fn from(r: WorkerRoleCli) -> Self {
        match r {
            WorkerRoleCli::Worker => WorkerRole::Worker,
            WorkerRoleCli::Manager => WorkerRole::Manager,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum EnvCommands {
    /// Validate an environment config and print its resolved constraints.
    Validate {
        #[clap(long)]
        name: Option<String>,
    },
    /// Show the currently active environment.
    Show {
        #[clap(long)]
        name: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum FeedbackCommands {
    /// Print the deterministic feedback report for an agent/environment pair.
    Report {
        #[clap(long)]
        agent: String,
        #[clap(long, default_value = "default")]
        environment: String,
    },
}

pub async fn handle_command(cli_args: Cli, config: &Config) -> Result<()> {
    match cli_args.command {
        Commands::Run {
            agent,
            environment,
            as_user,
            command,
            args,
        } => run_supervised(config, &agent, environment.as_deref(), as_user.as_deref(), &command, &args).await,
        Commands::Users(cmd) => handle_users_command(cmd, config),
        Commands::Env(cmd) => handle_env_command(cmd, config),
        Commands::Feedback(cmd) => handle_feedback_command(cmd, config),
    }
}

async fn run_supervised(
    config: &Config,
    agent: &str,
    environment: Option<&str>,
    as_user: Option<&str>,
    command: &str,
    args: &[String],
) -> Result<()> {
    let session_store: Arc<dyn SessionStore> = Arc::new(FileSessionStore::new(&config.data_root()));
    let extraction_store: Arc<dyn ExtractionStore> = Arc::new(FileExtractionStore::new(&config.data_root()));
    let env_config_path = config.paths.environments_file.as_ref().map(PathBuf::from);
    let batch_size = config.defaults.batch_size;
    let flush_interval = std::time::Duration::from_secs(config.defaults.flush_interval_s);

    let exit_code = if let Some(username) = as_user {
        let registry_path = config.data_root().join("users.json");
        let manager = UserManager::load(&registry_path)?;
        let wrapper = crate::user_process_wrapper::UserProcessWrapper::new(
            &manager,
            username,
            &config.logs_root(),
            environment,
            command,
            args,
            env_config_path.as_deref(),
            Some(session_store),
            Some(extraction_store),
            batch_size,
            flush_interval,
        )?;
        wrapper.start()?;
        wrapper.wait()?
    } else {
        let wrapper = Arc::new(ProcessWrapper::new(
            agent,
            &config.logs_root(),
            environment,
            command,
            args,
            env_config_path.as_deref(),
            Some(session_store),
            Some(extraction_store),
            batch_size,
            flush_interval,
        )?);
        let handler = CommandHandler::new(wrapper.clone());
        wrapper.start()?;
        let code = wrapper.wait()?;
        let _ = handler.history();
        code
    };

    std::process::exit(exit_code);
}

fn handle_users_command(command: UsersCommands, config: &Config) -> Result<()> {
    let registry_path = config.data_root().join("users.json");
    let mut manager = UserManager::load(&registry_path)?;

    match command {
        UsersCommands::Create {
            username,
            role,
            git_name,
            git_email,
        } => {
            let user = manager.create_worker_user(
                &username,
                role.into(),
                GitConfig {
                    name: git_name,
                    email: git_email,
                    token: None,
                },
            )?;
            println!("created worker user '{}' (uid={})", user.username, user.uid);
        }
        UsersCommands::List => {
            for user in manager.list() {
                println!("{}\t{:?}\t{}", user.username, user.role, user.workspace_dir);
            }
        }
        UsersCommands::Verify { username } => {
            if manager.verify_user_exists(&username) {
                println!("{username}: present");
            } else {
                println!("{username}: not found");
            }
        }
    }
    Ok(())
}

fn handle_env_command(command: EnvCommands, config: &Config) -> Result<()> {
    let env_config_path = config
        .paths
        .environments_file
        .as_ref()
        .map(PathBuf::from)
        .ok_or_else(|| anyhow::anyhow!("no environments_file configured"))?;

    match command {
        EnvCommands::Validate { name } => {
            let manager = EnvironmentManager::load(&env_config_path, name.as_deref())?;
            manager.validate_working_directory()?;
            println!("environment '{}' is valid", manager.environment().name);
        }
        EnvCommands::Show { name } => {
            let manager = EnvironmentManager::load(&env_config_path, name.as_deref())?;
            println!("{}", serde_json::to_string_pretty(manager.environment())?);
        }
    }
    Ok(())
}

fn handle_feedback_command(command: FeedbackCommands, config: &Config) -> Result<()> {
    match command {
        FeedbackCommands::Report { agent, environment } => {
            let path = config.data_root().join("feedback");
            let tracker = FeedbackTracker::new(&path, &agent, &environment)?;
            println!("{}", tracker.generate_report());
        }
    }
    Ok(())
}

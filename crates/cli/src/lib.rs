pub mod commands;
pub mod logging;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tempo_core::config::{AppConfig, ConfigOverrides, LoadOptions};
use tempo_core::domain::approval::{Actor, ActorRole};

#[derive(Debug, Parser)]
#[command(
    name = "tempo",
    about = "Tempo timesheet approval CLI",
    long_about = "Drive timesheet entries through manager, HR and finance review, and operate the approval store.",
    after_help = "Examples:\n  tempo migrate\n  tempo approve TE-1001 --actor mgr-7 --role manager\n  tempo approve-bulk TE-1001 TE-1002 --actor hr-2 --role hr\n  tempo show TE-1001"
)]
pub struct Cli {
    #[arg(long, global = true, help = "Path to a tempo.toml config file")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Override database.url for this invocation")]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
pub struct ActorArgs {
    #[arg(long = "actor", help = "Identifier of the acting reviewer")]
    pub id: String,
    #[arg(long, value_parser = parse_role, help = "manager, hr, finance or another reviewer role")]
    pub role: ActorRole,
}

impl ActorArgs {
    pub fn actor(&self) -> Actor {
        Actor::new(self.id.clone(), self.role.clone())
    }
}

fn parse_role(value: &str) -> Result<ActorRole, String> {
    ActorRole::parse(value).ok_or_else(|| "role must not be empty".to_string())
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Inspect effective configuration values with source attribution")]
    Config,
    #[command(about = "Validate config, workflow budget and DB connectivity checks")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Approve an entry at the stage matching the actor's role")]
    Approve {
        subject: String,
        #[command(flatten)]
        actor: ActorArgs,
    },
    #[command(about = "Reject an entry; a reason is mandatory")]
    Reject {
        subject: String,
        #[command(flatten)]
        actor: ActorArgs,
        #[arg(long)]
        reason: String,
    },
    #[command(about = "Hand the current review stage to another reviewer")]
    Delegate {
        subject: String,
        #[command(flatten)]
        actor: ActorArgs,
        #[arg(long = "to")]
        target: String,
    },
    #[command(about = "Raise the current review stage to another reviewer")]
    Escalate {
        subject: String,
        #[command(flatten)]
        actor: ActorArgs,
        #[arg(long = "to")]
        target: String,
    },
    #[command(about = "Approve many entries at once; all must be eligible or none change")]
    ApproveBulk {
        #[arg(required = true, num_args = 1..)]
        subjects: Vec<String>,
        #[command(flatten)]
        actor: ActorArgs,
    },
    #[command(about = "Show an entry's current state and audit trail")]
    Show { subject: String },
}

impl Cli {
    fn load_options(&self) -> LoadOptions {
        LoadOptions {
            config_path: self.config.clone(),
            require_file: self.config.is_some(),
            overrides: ConfigOverrides {
                database_url: self.database_url.clone(),
                ..ConfigOverrides::default()
            },
        }
    }
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    let options = cli.load_options();

    // Config errors are reported by the command itself.
    if let Ok(config) = AppConfig::load(options.clone()) {
        if let Err(error) = logging::init(&config.logging) {
            eprintln!("logging disabled: {error:#}");
        }
    }

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(&options),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run(&options) }
        }
        Command::Doctor { json } => commands::doctor::run(&options, json),
        Command::Approve { subject, actor } => {
            commands::decide::approve(&options, &subject, &actor.actor())
        }
        Command::Reject { subject, actor, reason } => {
            commands::decide::reject(&options, &subject, &actor.actor(), &reason)
        }
        Command::Delegate { subject, actor, target } => {
            commands::decide::delegate(&options, &subject, &actor.actor(), &target)
        }
        Command::Escalate { subject, actor, target } => {
            commands::decide::escalate(&options, &subject, &actor.actor(), &target)
        }
        Command::ApproveBulk { subjects, actor } => {
            commands::decide::approve_bulk(&options, &subjects, &actor.actor())
        }
        Command::Show { subject } => commands::show::run(&options, &subject),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

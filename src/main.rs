mod ferry;

use std::{io, path::PathBuf};

use clap::{Parser, Subcommand};

use ferry::admin::{self, UserAction};

#[derive(Debug, Parser)]
#[command(
    name = "ferry",
    version,
    about = "ferry - HTTP upgrade to SSH port-forwarding relay"
)]
struct Cli {
    /// Path to the ferry config file (.toml/.yaml/.yml). If omitted, uses FERRY_CONFIG; then auto-detects ferry.toml > ferry.yaml > ferry.yml from CWD; then falls back to the OS default path (Linux: /etc/ferry/ferry.toml; others: user config dir).
    #[arg(long, env = "FERRY_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the relay (default).
    Serve,
    /// Manage tunnel accounts.
    Users {
        #[command(subcommand)]
        action: UsersCommand,
    },
}

#[derive(Debug, Subcommand)]
enum UsersCommand {
    /// Create an enabled account.
    Add {
        name: String,
        /// Read from stdin when neither this nor FERRY_PASSWORD is set.
        #[arg(long, env = "FERRY_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    Remove {
        name: String,
    },
    List,
    /// Change an account's password.
    Passwd {
        name: String,
        #[arg(long, env = "FERRY_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    Enable {
        name: String,
    },
    Disable {
        name: String,
    },
    /// Write a copy of the user database to DEST.
    Backup {
        dest: PathBuf,
    },
}

impl From<UsersCommand> for UserAction {
    fn from(c: UsersCommand) -> Self {
        match c {
            UsersCommand::Add { name, password } => UserAction::Add { name, password },
            UsersCommand::Remove { name } => UserAction::Remove { name },
            UsersCommand::List => UserAction::List,
            UsersCommand::Passwd { name, password } => UserAction::Passwd { name, password },
            UsersCommand::Enable { name } => UserAction::Enable { name },
            UsersCommand::Disable { name } => UserAction::Disable { name },
            UsersCommand::Backup { dest } => UserAction::Backup { dest },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => ferry::run(cli.config).await,
        Command::Users { action } => {
            let stdin = io::stdin();
            admin::run_user_action(
                cli.config,
                action.into(),
                &mut stdin.lock(),
                &mut io::stdout().lock(),
            )
        }
    }
}

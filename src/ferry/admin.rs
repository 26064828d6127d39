//! Offline account management behind `ferry users ...`.

use std::{
    io::{BufRead, Write},
    path::PathBuf,
};

use anyhow::Context;

use crate::ferry::{config, users::UserDb};

#[derive(Debug, Clone)]
pub enum UserAction {
    Add {
        name: String,
        password: Option<String>,
    },
    Remove {
        name: String,
    },
    List,
    Passwd {
        name: String,
        password: Option<String>,
    },
    Enable {
        name: String,
    },
    Disable {
        name: String,
    },
    Backup {
        dest: PathBuf,
    },
}

/// Resolves the config like `serve` does and applies `action` to its user database.
pub fn run_user_action(
    config_path: Option<PathBuf>,
    action: UserAction,
    input: &mut dyn BufRead,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let cfg = config::load_config_or_default(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;
    let db = UserDb::open(&cfg.users.db_file)
        .with_context(|| format!("users: open {}", cfg.users.db_file.display()))?;
    apply(&db, action, input, out)
}

fn apply(
    db: &UserDb,
    action: UserAction,
    input: &mut dyn BufRead,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    match action {
        UserAction::Add { name, password } => {
            let password = password_or_prompt(password, input, out)?;
            db.add_user(&name, &password)?;
            writeln!(out, "user '{}' added", name.trim())?;
        }
        UserAction::Remove { name } => {
            db.remove_user(&name)?;
            writeln!(out, "user '{}' removed", name.trim())?;
        }
        UserAction::List => {
            let users = db.users();
            if users.is_empty() {
                writeln!(out, "no users")?;
            }
            for u in users {
                let last_login = u
                    .last_login
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                writeln!(
                    out,
                    "{}\t{}\tcreated={}\tlast_login={}",
                    u.username,
                    if u.enabled { "enabled" } else { "disabled" },
                    u.created_at.to_rfc3339(),
                    last_login
                )?;
            }
        }
        UserAction::Passwd { name, password } => {
            // Fail before prompting for an account that does not exist.
            db.user_info(&name)?;
            let password = password_or_prompt(password, input, out)?;
            db.update_password(&name, &password)?;
            writeln!(out, "password updated for '{}'", name.trim())?;
        }
        UserAction::Enable { name } => {
            db.set_enabled(&name, true)?;
            writeln!(out, "user '{}' enabled", name.trim())?;
        }
        UserAction::Disable { name } => {
            db.set_enabled(&name, false)?;
            writeln!(out, "user '{}' disabled", name.trim())?;
        }
        UserAction::Backup { dest } => {
            db.backup(&dest)?;
            writeln!(out, "backup written to {}", dest.display())?;
        }
    }
    Ok(())
}

fn password_or_prompt(
    password: Option<String>,
    input: &mut dyn BufRead,
    out: &mut dyn Write,
) -> anyhow::Result<String> {
    if let Some(p) = password.filter(|p| !p.is_empty()) {
        return Ok(p);
    }
    write!(out, "password: ")?;
    out.flush()?;
    let mut line = String::new();
    input.read_line(&mut line).context("read password")?;
    let line = line.trim_end_matches(['\r', '\n']).to_string();
    if line.is_empty() {
        anyhow::bail!("no password given");
    }
    Ok(line)
}

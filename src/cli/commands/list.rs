//! List command - show stored sessions

use crate::cli::args::{ListArgs, OutputFormat};
use crate::config::{Config, ConfigManager};
use crate::error::TetherResult;
use crate::session::{Session, SessionStatus, SessionStore, SqliteSessionStore};
use crate::ui::{self, UiContext};
use console::style;
use serde::Serialize;

/// Session as shown by `tether list`; the token itself is never printed
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ListEntry<'a> {
    id: &'a str,
    status: SessionStatus,
    detail: Option<&'a str>,
    paired: bool,
    created_at: String,
    updated_at: String,
}

impl<'a> From<&'a Session> for ListEntry<'a> {
    fn from(session: &'a Session) -> Self {
        Self {
            id: &session.id,
            status: session.status,
            detail: session.detail.as_deref(),
            paired: session.token.is_some(),
            created_at: session.created_at.to_rfc3339(),
            updated_at: session.updated_at.to_rfc3339(),
        }
    }
}

/// Execute the list command
pub async fn execute(args: ListArgs, config: &Config) -> TetherResult<()> {
    let path = ConfigManager::store_path(config);
    let sessions = if path.exists() {
        SqliteSessionStore::open(&path)?.list().await?
    } else {
        Vec::new()
    };

    if sessions.is_empty() {
        match args.format {
            OutputFormat::Json => println!("[]"),
            OutputFormat::Plain => {}
            OutputFormat::Table => {
                let ctx = UiContext::detect();
                ui::step_info(&ctx, "No sessions");
            }
        }
        return Ok(());
    }

    match args.format {
        OutputFormat::Table => print_table(&sessions),
        OutputFormat::Json => print_json(&sessions)?,
        OutputFormat::Plain => print_plain(&sessions),
    }

    Ok(())
}

fn print_table(sessions: &[Session]) {
    let ctx = UiContext::detect();
    ui::intro(&ctx, "Sessions");

    println!(
        "{:<24} {:<16} {:<17} {:<40}",
        style("ID").bold(),
        style("STATUS").bold(),
        style("UPDATED").bold(),
        style("DETAIL").bold()
    );
    println!("{}", "-".repeat(97));

    for session in sessions {
        let label = session.status.as_str().to_lowercase();
        let status_styled = match session.status {
            status if status.is_pairing() => style(label).yellow(),
            SessionStatus::Connected => style(label).green(),
            SessionStatus::Init => style(label).cyan(),
            _ => style(label).dim(),
        };

        let updated = session.updated_at.format("%Y-%m-%d %H:%M").to_string();
        println!(
            "{:<24} {:<16} {:<17} {:<40}",
            session.id,
            status_styled,
            updated,
            session.detail.as_deref().unwrap_or("-")
        );
    }

    println!();
    println!("{} session(s)", sessions.len());
}

fn print_json(sessions: &[Session]) -> TetherResult<()> {
    let entries: Vec<ListEntry<'_>> = sessions.iter().map(ListEntry::from).collect();
    let json = serde_json::to_string_pretty(&entries)?;
    println!("{}", json);
    Ok(())
}

fn print_plain(sessions: &[Session]) {
    for session in sessions {
        println!("{}", session.id);
    }
}

//! Command-line utility for managing the spools of a running postern
//!
//! Talks to the server over its control socket, so every operation honours
//! the locks of the server's workers and wakes them when mails change.

use std::{path::PathBuf, time::SystemTime};

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use postern_common::mail::MailId;
use postern_control::{
    ControlClient, DEFAULT_CONTROL_SOCKET, Request, ResponsePayload, SpoolCommand, StoreName,
};
use postern_spool::admin::{SpoolItem, SpoolReport};

/// Command-line utility for managing postern spools
#[derive(Parser, Debug)]
#[command(name = "posternctl")]
#[command(about = "Manage the spools of a running postern", long_about = None)]
#[command(version)]
struct Cli {
    /// Control socket of the server
    #[arg(short, long, default_value = DEFAULT_CONTROL_SOCKET)]
    control_socket: PathBuf,

    /// Store to operate on
    #[arg(short, long, value_enum, default_value = "spool")]
    store: Store,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Store {
    Spool,
    Outgoing,
    Inbox,
}

impl From<Store> for StoreName {
    fn from(store: Store) -> Self {
        match store {
            Store::Spool => Self::Spool,
            Store::Outgoing => Self::Outgoing,
            Store::Inbox => Self::Inbox,
        }
    }
}

#[derive(Args, Debug)]
struct Selection {
    /// Only this mail
    #[arg(long)]
    id: Option<String>,

    /// Only mails in this state
    #[arg(long)]
    state: Option<String>,

    /// Only mails with this header ...
    #[arg(long, requires = "pattern")]
    header: Option<String>,

    /// ... matching this regular expression
    #[arg(long, requires = "header")]
    pattern: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List mails in the store
    List {
        #[command(flatten)]
        selection: Selection,
    },
    /// Delete mails from the store
    Remove {
        #[command(flatten)]
        selection: Selection,
    },
    /// Make mails eligible for another attempt right away
    Resend {
        #[command(flatten)]
        selection: Selection,
    },
    /// Move mails to another store
    Move {
        /// Destination store
        #[arg(long, value_enum)]
        to: Store,

        #[command(flatten)]
        selection: Selection,
    },
}

impl TryFrom<Selection> for postern_control::Selection {
    type Error = anyhow::Error;

    fn try_from(selection: Selection) -> anyhow::Result<Self> {
        let id = selection
            .id
            .as_deref()
            .map(|id| {
                id.parse::<MailId>()
                    .with_context(|| format!("Invalid mail id {id}"))
            })
            .transpose()?;

        Ok(Self {
            id,
            state: selection.state,
            header: selection.header.zip(selection.pattern),
        })
    }
}

fn format_age(since: SystemTime) -> String {
    let secs = SystemTime::now()
        .duration_since(since)
        .map_or(0, |age| age.as_secs());

    match secs {
        0..60 => format!("{secs}s"),
        60..3600 => format!("{}m", secs / 60),
        3600..86400 => format!("{}h", secs / 3600),
        _ => format!("{}d", secs / 86400),
    }
}

fn print_items(items: &[SpoolItem]) {
    println!(
        "{:<28} {:<12} {:<8} {:<30} {}",
        "MAIL ID", "STATE", "AGE", "SENDER", "RECIPIENTS"
    );
    println!("{}", "-".repeat(100));

    for item in items {
        let sender = item
            .sender
            .as_ref()
            .map_or_else(|| String::from("<>"), ToString::to_string);
        let recipients = item
            .recipients
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");

        println!(
            "{:<28} {:<12} {:<8} {sender:<30} {recipients}",
            item.id.to_string(),
            item.state,
            format_age(item.last_updated),
        );

        if let Some(error) = &item.error_message {
            println!("{:<28} error: {error}", "");
        }
    }

    println!("\nTotal: {} mail(s)", items.len());
}

fn print_report(action: &str, report: &SpoolReport) {
    for id in &report.affected {
        println!("{action} {id}");
    }

    for id in &report.locking_failures {
        println!("Skipped {id}: held by a worker");
    }

    println!(
        "\n{action} {} mail(s), {} held by workers",
        report.affected.len(),
        report.locking_failures.len()
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let store = StoreName::from(cli.store);

    let (action, command) = match cli.command {
        Command::List { selection } => ("Listed", SpoolCommand::List(selection.try_into()?)),
        Command::Remove { selection } => ("Removed", SpoolCommand::Remove(selection.try_into()?)),
        Command::Resend { selection } => ("Resent", SpoolCommand::Resend(selection.try_into()?)),
        Command::Move { to, selection } => {
            if to == cli.store {
                anyhow::bail!("Source and destination stores are the same");
            }

            (
                "Moved",
                SpoolCommand::Move {
                    to: to.into(),
                    selection: selection.try_into()?,
                },
            )
        }
    };

    let client = ControlClient::new(cli.control_socket.clone());
    let payload = client
        .send_request(&Request::new(store, command))
        .await
        .with_context(|| {
            format!(
                "Request to {} failed, is postern running?",
                cli.control_socket.display()
            )
        })?;

    match payload {
        ResponsePayload::Items(items) => print_items(&items),
        ResponsePayload::Report(report) => print_report(action, &report),
        ResponsePayload::Error(message) => anyhow::bail!(message),
    }

    Ok(())
}

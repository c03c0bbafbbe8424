use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    ClientEvent, Direction, MenuClient, MoveInstruction, Notification, NotificationAction,
    NotificationLevel,
};
use shared::domain::Collection;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::load_settings;

#[derive(Parser, Debug)]
#[command(name = "menu_admin", about = "Reorder and delete/undo for a restaurant menu")]
struct Cli {
    /// TOML config file; `menu_admin.toml` is read when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    api_url: Option<String>,
    #[arg(long, global = true)]
    restaurant_id: Option<String>,
    #[arg(long, global = true)]
    menu_id: Option<String>,
    #[arg(long, global = true)]
    token: Option<String>,
    #[arg(long, global = true)]
    token_path: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a collection.
    List { collection: Collection },
    /// Drag a category from one position to another.
    MoveCategory {
        #[arg(long)]
        from: usize,
        #[arg(long)]
        to: usize,
    },
    /// Move a category one step up or down.
    StepCategory {
        #[arg(long)]
        position: usize,
        #[arg(long)]
        direction: Direction,
    },
    /// Delete an entity. Undo is only available inside `session`.
    Delete { collection: Collection, id: String },
    /// Interactive session reading commands from stdin.
    Session,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut settings = load_settings(cli.config.as_deref())?;
    if let Some(v) = cli.api_url {
        settings.api_url = v;
    }
    if let Some(v) = cli.restaurant_id {
        settings.restaurant_id = v;
    }
    if let Some(v) = cli.menu_id {
        settings.menu_id = Some(v);
    }
    if let Some(v) = cli.token {
        settings.token = Some(v);
    }
    if let Some(v) = cli.token_path {
        settings.token_path = Some(v);
    }

    let api = settings.menu_api()?;
    info!(api_url = %settings.api_url, restaurant_id = %settings.restaurant_id, "menu admin starting");
    let client = MenuClient::new(Arc::new(api), settings.client_config());
    let mut events = client.subscribe_events();

    match cli.command {
        Command::List { collection } => {
            load(&client, collection).await?;
            print_collection(&client, collection);
        }
        Command::MoveCategory { from, to } => {
            load(&client, Collection::Categories).await?;
            let moved = client
                .move_category(MoveInstruction::Drag { from, to })
                .await;
            drain_events(&mut events);
            print_collection(&client, Collection::Categories);
            if !moved {
                bail!("category move was not saved");
            }
        }
        Command::StepCategory {
            position,
            direction,
        } => {
            load(&client, Collection::Categories).await?;
            let moved = client
                .move_category(MoveInstruction::Step {
                    position,
                    direction,
                })
                .await;
            drain_events(&mut events);
            print_collection(&client, Collection::Categories);
            if !moved {
                bail!("category move was not saved");
            }
        }
        Command::Delete { collection, id } => {
            load(&client, collection).await?;
            let deleted = client.delete(collection, &id).await;
            drain_events(&mut events);
            if !deleted {
                bail!("delete of {collection} entry {id} failed");
            }
        }
        Command::Session => run_session(&client, &mut events).await?,
    }

    Ok(())
}

async fn load(client: &MenuClient, collection: Collection) -> Result<()> {
    if !client.refresh(collection).await {
        bail!("failed to load {collection}");
    }
    Ok(())
}

fn print_collection(client: &MenuClient, collection: Collection) {
    let store = client.store();
    match collection {
        Collection::Categories => {
            for (position, category) in store.categories().iter().enumerate() {
                println!(
                    "{position:>3}  {:<24} {} (index {})",
                    category.id, category.name, category.index
                );
            }
        }
        Collection::Items => {
            for item in store.items() {
                let modifiers: Vec<&str> = item.modifiers.iter().map(|id| id.as_str()).collect();
                println!(
                    "{:<24} {} [{}] {:.2} modifiers: {}",
                    item.id,
                    item.name,
                    item.category,
                    item.price,
                    modifiers.join(", ")
                );
            }
        }
        Collection::Modifiers => {
            for modifier in store.modifiers() {
                let options: Vec<&str> = modifier
                    .options
                    .iter()
                    .map(|option| option.name.as_str())
                    .collect();
                println!(
                    "{:<24} {} options: {}",
                    modifier.id,
                    modifier.name,
                    options.join(", ")
                );
            }
        }
    }
}

/// Prints pending notifications and returns the last action offered.
fn drain_events(events: &mut broadcast::Receiver<ClientEvent>) -> Option<NotificationAction> {
    let mut last_action = None;
    loop {
        match events.try_recv() {
            Ok(ClientEvent::Notification(notification)) => {
                print_notification(&notification);
                if notification.action.is_some() {
                    last_action = notification.action;
                }
            }
            Ok(ClientEvent::RolledBack { collection, op }) => {
                println!("  {collection} order restored after failed save ({op})");
            }
            Ok(ClientEvent::Resynced { collection, op }) => {
                println!("  {collection} reloaded after failed save ({op})");
            }
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                warn!(skipped, "notifications dropped");
            }
            Err(_) => break,
        }
    }
    last_action
}

fn print_notification(notification: &Notification) {
    let level = match notification.level {
        NotificationLevel::Success => "ok",
        NotificationLevel::Error => "error",
    };
    let hint = match &notification.action {
        Some(NotificationAction::Undo { .. }) => " (type 'undo')",
        Some(NotificationAction::Retry(_)) => " (type 'retry')",
        None => "",
    };
    println!("[{level}] {}{hint}", notification.message);
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionCommand {
    Help,
    Quit,
    Refresh,
    List(Collection),
    Move(MoveInstruction),
    MoveItemModifier(String, MoveInstruction),
    MoveOption(String, MoveInstruction),
    Delete(Collection, String),
    Undo(Option<(Collection, String)>),
    Retry,
}

const SESSION_HELP: &str = "\
commands:
  list <categories|items|modifiers>
  refresh
  move <from> <to>            drag a category
  up <position> | down <position>
  item-modifier <item id> <from> <to>
  option <modifier id> <from> <to>
  delete <collection> <id>
  undo [<collection> <id>]     without arguments undoes the last delete
  retry                        retries the last failed operation
  quit";

fn parse_position(raw: Option<&str>) -> Result<usize, String> {
    let raw = raw.ok_or_else(|| "missing position".to_string())?;
    raw.parse()
        .map_err(|_| format!("'{raw}' is not a position"))
}

fn parse_drag<'a>(mut args: impl Iterator<Item = &'a str>) -> Result<MoveInstruction, String> {
    let from = parse_position(args.next())?;
    let to = parse_position(args.next())?;
    Ok(MoveInstruction::Drag { from, to })
}

fn parse_line(line: &str) -> Result<SessionCommand, String> {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Ok(SessionCommand::Help);
    };
    let parsed = match command {
        "help" | "?" => SessionCommand::Help,
        "quit" | "exit" => SessionCommand::Quit,
        "refresh" => SessionCommand::Refresh,
        "list" => SessionCommand::List(
            words
                .next()
                .unwrap_or("categories")
                .parse()?,
        ),
        "move" => SessionCommand::Move(parse_drag(&mut words)?),
        "up" | "down" => SessionCommand::Move(MoveInstruction::Step {
            position: parse_position(words.next())?,
            direction: command.parse()?,
        }),
        "item-modifier" => {
            let item = words.next().ok_or("missing item id")?.to_string();
            SessionCommand::MoveItemModifier(item, parse_drag(&mut words)?)
        }
        "option" => {
            let modifier = words.next().ok_or("missing modifier id")?.to_string();
            SessionCommand::MoveOption(modifier, parse_drag(&mut words)?)
        }
        "delete" => {
            let collection = words.next().ok_or("missing collection")?.parse()?;
            let id = words.next().ok_or("missing id")?.to_string();
            SessionCommand::Delete(collection, id)
        }
        "undo" => match (words.next(), words.next()) {
            (None, _) => SessionCommand::Undo(None),
            (Some(collection), Some(id)) => {
                SessionCommand::Undo(Some((collection.parse()?, id.to_string())))
            }
            (Some(_), None) => return Err("undo needs both a collection and an id".into()),
        },
        "retry" => SessionCommand::Retry,
        other => return Err(format!("unknown command '{other}'")),
    };
    if words.next().is_some() {
        return Err(format!("too many arguments for '{command}'"));
    }
    Ok(parsed)
}

async fn run_session(
    client: &Arc<MenuClient>,
    events: &mut broadcast::Receiver<ClientEvent>,
) -> Result<()> {
    if !client.refresh_all().await {
        warn!("some collections failed to load");
    }
    drain_events(events);
    println!("{SESSION_HELP}");

    let mut last_undo: Option<NotificationAction> = None;
    let mut last_retry: Option<NotificationAction> = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let command = match parse_line(&line) {
            Ok(command) => command,
            Err(err) => {
                println!("{err}");
                continue;
            }
        };
        let show = match command {
            SessionCommand::Help => {
                println!("{SESSION_HELP}");
                None
            }
            SessionCommand::Quit => break,
            SessionCommand::Refresh => {
                client.refresh_all().await;
                None
            }
            SessionCommand::List(collection) => Some(collection),
            SessionCommand::Move(instruction) => {
                client.move_category(instruction).await;
                Some(Collection::Categories)
            }
            SessionCommand::MoveItemModifier(item, instruction) => {
                client.move_item_modifier(&item, instruction).await;
                Some(Collection::Items)
            }
            SessionCommand::MoveOption(modifier, instruction) => {
                client.move_modifier_option(&modifier, instruction).await;
                Some(Collection::Modifiers)
            }
            SessionCommand::Delete(collection, id) => {
                client.delete(collection, &id).await;
                Some(collection)
            }
            SessionCommand::Undo(Some((collection, id))) => {
                client.undo(collection, &id).await;
                Some(collection)
            }
            SessionCommand::Undo(None) => match last_undo.take() {
                Some(action) => {
                    client.perform(action).await;
                    None
                }
                None => {
                    println!("nothing to undo");
                    None
                }
            },
            SessionCommand::Retry => match last_retry.take() {
                Some(action) => {
                    client.perform(action).await;
                    None
                }
                None => {
                    println!("nothing to retry");
                    None
                }
            },
        };

        match drain_events(events) {
            Some(action @ NotificationAction::Undo { .. }) => last_undo = Some(action),
            Some(action @ NotificationAction::Retry(_)) => last_retry = Some(action),
            None => {}
        }
        if let Some(collection) = show {
            print_collection(client, collection);
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;

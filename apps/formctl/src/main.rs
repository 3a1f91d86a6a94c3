use std::{fs, path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use designer_core::{export, ControlListManager, FormSession, MoveOutcome};
use shared::{
    domain::{
        ControlId, ControlPatch, ControlTemplate, FormId, MoveDirection, Properties,
        PropertyValue, SectionId,
    },
    protocol::ImportRecord,
};
use storage::{PersistenceGateway, Storage};
use tracing::info;

mod config;

use config::{load_settings, normalize_database_url};

#[derive(Parser, Debug)]
#[command(name = "formctl", about = "Edit form layouts stored in SQLite")]
struct Cli {
    /// Overrides `database_url` from settings.
    #[arg(long)]
    database_url: Option<String>,
    /// Overrides `form_id` from settings.
    #[arg(long)]
    form: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the form's controls in display order.
    List,
    Sections,
    Add {
        kind: String,
        name: String,
        #[arg(long, default_value = shared::domain::DEFAULT_SECTION_ID)]
        section: String,
        /// `key=value`, repeatable.
        #[arg(long = "prop", value_parser = parse_property)]
        properties: Vec<(String, PropertyValue)>,
        #[arg(long)]
        width: Option<u32>,
        #[arg(long)]
        height: Option<u32>,
    },
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        section: Option<String>,
        #[arg(long = "prop", value_parser = parse_property)]
        properties: Vec<(String, PropertyValue)>,
        #[arg(long)]
        width: Option<u32>,
        #[arg(long)]
        height: Option<u32>,
    },
    Remove {
        id: String,
    },
    Move {
        id: String,
        direction: Direction,
    },
    /// Drag-and-drop style move between two positions of `list`.
    Reorder {
        from: usize,
        to: usize,
    },
    AddSection {
        name: String,
        #[arg(long)]
        required: bool,
    },
    /// Deletes a section; its controls move to the default section.
    RemoveSection {
        id: String,
    },
    /// Stage a JSON array of controls in memory; `--commit` writes them.
    Import {
        file: PathBuf,
        #[arg(long)]
        commit: bool,
    },
    /// Compare store and memory counts, resetting on drift.
    Check,
    /// Drop in-memory state and reload from the store.
    Reset,
    Export {
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Direction {
    Up,
    Down,
}

impl From<Direction> for MoveDirection {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Up => MoveDirection::Up,
            Direction::Down => MoveDirection::Down,
        }
    }
}

fn parse_property(raw: &str) -> Result<(String, PropertyValue), String> {
    let Some((key, value)) = raw.split_once('=') else {
        return Err(format!("expected key=value, got '{raw}'"));
    };
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty property name in '{raw}'"));
    }
    Ok((key.to_string(), PropertyValue::parse_literal(value)))
}

fn properties_from(pairs: Vec<(String, PropertyValue)>) -> Option<Properties> {
    if pairs.is_empty() {
        None
    } else {
        Some(pairs.into_iter().collect())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = load_settings()?;
    if let Some(database_url) = cli.database_url {
        settings.database_url = database_url;
    }
    if let Some(form) = cli.form {
        settings.form_id = form;
    }
    tracing_subscriber::fmt()
        .with_env_filter(settings.log_filter.as_str())
        .with_writer(std::io::stderr)
        .init();

    let database_url = normalize_database_url(&settings.database_url);
    let storage = Storage::new(&database_url).await?;
    let gateway: Arc<dyn PersistenceGateway> = Arc::new(storage);
    let form_id = FormId::new(settings.form_id.clone());
    let manager = ControlListManager::new(gateway, form_id.clone())
        .with_drift_tolerance(settings.drift_tolerance);
    let (session, _worker) = FormSession::spawn(manager, settings.queue_capacity);

    let loaded = session.load(form_id.clone()).await?;
    info!(form_id = %form_id, controls = loaded, database_url = %database_url, "form opened");

    match cli.command {
        Command::List => {
            let snapshot = session.snapshot().await?;
            for (position, control) in snapshot.controls.iter().enumerate() {
                println!(
                    "{position}\t{}\t{}#{}\t{}\t{}",
                    control.id,
                    control.section_id,
                    control.order_index,
                    control.control_kind,
                    control.display_name
                );
            }
        }
        Command::Sections => {
            for section in session.snapshot().await?.sections {
                let required = if section.required { " (required)" } else { "" };
                println!("{}\t{}\t{}{required}", section.id, section.order, section.name);
            }
        }
        Command::Add {
            kind,
            name,
            section,
            properties,
            width,
            height,
        } => {
            let mut template = ControlTemplate::new(kind, name);
            for (key, value) in properties {
                template = template.with_property(key, value);
            }
            template.width = width;
            template.height = height;
            let id = session.add(template, SectionId::new(section)).await?;
            println!("added control_id={id}");
        }
        Command::Update {
            id,
            name,
            section,
            properties,
            width,
            height,
        } => {
            let patch = ControlPatch {
                display_name: name,
                section_id: section.map(SectionId::new),
                order_index: None,
                properties: properties_from(properties),
                width,
                height,
            };
            if patch.is_empty() {
                bail!("nothing to update; pass --name, --section, --prop, --width or --height");
            }
            session.update(ControlId::new(id.clone()), patch).await?;
            println!("updated control_id={id}");
        }
        Command::Remove { id } => {
            session.remove(ControlId::new(id.clone())).await?;
            println!("removed control_id={id}");
        }
        Command::Move { id, direction } => {
            match session
                .move_control(ControlId::new(id.clone()), direction.into())
                .await?
            {
                MoveOutcome::Moved => println!("moved control_id={id}"),
                MoveOutcome::AtBoundary => {
                    println!("control_id={id} is already at the edge of its section")
                }
            }
        }
        Command::Reorder { from, to } => {
            session.reorder(from, to).await?;
            println!("reordered {from} -> {to}");
        }
        Command::AddSection { name, required } => {
            let id = session.add_section(name, required).await?;
            println!("added section_id={id}");
        }
        Command::RemoveSection { id } => {
            session.remove_section(SectionId::new(id.clone())).await?;
            println!("removed section_id={id}");
        }
        Command::Import { file, commit } => {
            let raw = fs::read_to_string(&file)
                .with_context(|| format!("failed to read '{}'", file.display()))?;
            let records: Vec<ImportRecord> = serde_json::from_str(&raw)
                .with_context(|| format!("'{}' is not a JSON array of controls", file.display()))?;
            let report = session.bulk_import(records).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if commit {
                let commit_report = session.commit_to_store().await?;
                println!("{}", serde_json::to_string_pretty(&commit_report)?);
            } else {
                println!("staged in memory only; rerun with --commit to store");
            }
        }
        Command::Check => {
            let report = session.check_consistency().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Reset => {
            let loaded = session.nuclear_reset().await?;
            println!("reloaded {loaded} controls");
        }
        Command::Export { out } => {
            let snapshot = session.snapshot().await?;
            let document =
                export::form_document(&snapshot.form_id, &snapshot.sections, &snapshot.controls);
            let rendered = serde_json::to_string_pretty(&document)?;
            match out {
                Some(path) => {
                    fs::write(&path, rendered)
                        .with_context(|| format!("failed to write '{}'", path.display()))?;
                    println!("exported form_id={} to {}", snapshot.form_id, path.display());
                }
                None => println!("{rendered}"),
            }
        }
    }

    Ok(())
}

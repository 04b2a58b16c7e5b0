//! `zones` subcommand: region management against the polygon store.

use std::{fs, path::PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Subcommand};
use serde::Serialize;
use tracing::info;
use zone_core::Point;
use zone_store::{
    NewRegion, PolygonStore, RegionDocument, RegionRecord, RegionUpdate, SqliteStore,
};

#[derive(Debug, Args)]
pub struct ZonesArgs {
    /// SQLite database path.
    #[arg(long = "db", env = "ZC_DB_PATH", value_name = "PATH", default_value = "zone_counter.db")]
    pub db_path: PathBuf,

    #[command(subcommand)]
    pub command: ZonesCommand,
}

#[derive(Debug, Subcommand)]
pub enum ZonesCommand {
    /// List regions, newest first.
    List {
        #[arg(long = "active", action = clap::ArgAction::SetTrue)]
        active_only: bool,
    },
    /// Print one region as JSON.
    Show { id: i64 },
    /// Create an inactive region.
    Create {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        description: String,
        /// Vertices as `x,y` pairs separated by spaces or semicolons.
        #[arg(long, value_name = "POINTS")]
        points: String,
        /// Make it the active region right away.
        #[arg(long, action = clap::ArgAction::SetTrue)]
        activate: bool,
    },
    /// Change name, description or vertices.
    Update {
        id: i64,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, value_name = "POINTS")]
        points: Option<String>,
    },
    /// Deactivate a region, or remove it with --hard.
    Delete {
        id: i64,
        #[arg(long, action = clap::ArgAction::SetTrue)]
        hard: bool,
    },
    /// Make a region the only active one.
    Activate { id: i64 },
    /// Create a region from a JSON document.
    Import {
        path: PathBuf,
        #[arg(long, action = clap::ArgAction::SetTrue)]
        activate: bool,
    },
    /// Write a region as a JSON document importable elsewhere.
    Export {
        id: i64,
        #[arg(long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Serialize)]
struct RegionSummary<'a> {
    id: i64,
    name: &'a str,
    is_active: bool,
    vertices: usize,
    area: Option<f64>,
    updated_at: String,
}

impl<'a> From<&'a RegionRecord> for RegionSummary<'a> {
    fn from(record: &'a RegionRecord) -> Self {
        Self {
            id: record.id,
            name: &record.name,
            is_active: record.is_active,
            vertices: record.points.len(),
            area: record.to_region().ok().map(|region| region.area()),
            updated_at: record.updated_at.to_rfc3339(),
        }
    }
}

pub fn run(args: ZonesArgs) -> Result<()> {
    let store = SqliteStore::open(&args.db_path)
        .with_context(|| format!("Failed to open {}", args.db_path.display()))?;
    execute(&store, args.command)
}

fn execute(store: &impl PolygonStore, command: ZonesCommand) -> Result<()> {
    match command {
        ZonesCommand::List { active_only } => {
            let records = store.list_regions(active_only)?;
            let rows: Vec<RegionSummary<'_>> = records.iter().map(RegionSummary::from).collect();
            print_json(&rows)
        }
        ZonesCommand::Show { id } => print_json(&store.get_region(id)?),
        ZonesCommand::Create {
            name,
            description,
            points,
            activate,
        } => {
            let region = NewRegion {
                name,
                description,
                points: parse_points(&points)?,
            };
            create(store, &region, activate)
        }
        ZonesCommand::Update {
            id,
            name,
            description,
            points,
        } => {
            let update = RegionUpdate {
                name,
                description,
                points: points.as_deref().map(parse_points).transpose()?,
            };
            if update.is_empty() {
                bail!("Nothing to update. Provide --name, --description or --points.");
            }
            store.update_region(id, &update)?;
            info!(region_id = id, "region updated");
            print_json(&store.get_region(id)?)
        }
        ZonesCommand::Delete { id, hard } => {
            store.delete_region(id, hard)?;
            info!(region_id = id, hard, "region deleted");
            Ok(())
        }
        ZonesCommand::Activate { id } => {
            store.activate_region(id)?;
            info!(region_id = id, "region activated");
            Ok(())
        }
        ZonesCommand::Import { path, activate } => {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let document: RegionDocument = serde_json::from_str(&raw)
                .with_context(|| format!("{} is not a region document", path.display()))?;
            create(store, &document.into(), activate)
        }
        ZonesCommand::Export { id, output } => {
            let record = store.get_region(id)?;
            let document = RegionDocument {
                name: record.name,
                description: record.description,
                coordinates: zone_store::Coordinates {
                    points: record.points,
                },
            };
            let json = serde_json::to_string_pretty(&document)?;
            match output {
                Some(path) => fs::write(&path, json)
                    .with_context(|| format!("Failed to write {}", path.display())),
                None => {
                    println!("{json}");
                    Ok(())
                }
            }
        }
    }
}

fn create(store: &impl PolygonStore, region: &NewRegion, activate: bool) -> Result<()> {
    let id = store.create_region(region)?;
    if activate {
        store.activate_region(id)?;
    }
    info!(region_id = id, name = %region.name, activate, "region created");
    println!("{id}");
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Parse `"x,y x,y ..."` (or `;`-separated) into points.
pub(crate) fn parse_points(raw: &str) -> Result<Vec<Point>> {
    raw.split(|c: char| c == ';' || c.is_whitespace())
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (x, y) = pair
                .split_once(',')
                .ok_or_else(|| anyhow!("Expected `x,y`, got {pair:?}"))?;
            let x: f64 = x
                .trim()
                .parse()
                .with_context(|| format!("Invalid x coordinate in {pair:?}"))?;
            let y: f64 = y
                .trim()
                .parse()
                .with_context(|| format!("Invalid y coordinate in {pair:?}"))?;
            Ok(Point::new(x, y))
        })
        .collect()
}

//! Operator commands: inspect, discover and run

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};
use serde_json::json;

use crate::display::{CellStyle, ColourManager, TableBuilder};
use crate::lifecycle::{BatchReport, Outcome};
use crate::manager::{DiscoveredPlugin, PluginLoadOptions, PluginManager, SystemMetrics};
use crate::plugin::handle::{Artifact, PluginSnapshot};
use crate::plugin::metadata::PluginMetadata;
use crate::plugin::state::PluginState;

/// Print the descriptor of one artifact
pub fn inspect(manager: &PluginManager, artifact: &Path, colours: &ColourManager, as_json: bool) -> Result<()> {
    let (artifact, metadata) = manager
        .loader()
        .inspect(artifact)
        .with_context(|| format!("Cannot inspect {}", artifact.display()))?;

    if as_json {
        let output = json!({ "artifact": artifact, "metadata": metadata });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        metadata_table(&metadata, &artifact).print(colours.colours_enabled());
    }
    Ok(())
}

/// Print every loadable artifact below `dir`
pub async fn discover(
    manager: &PluginManager,
    dir: &Path,
    recursive: bool,
    colours: &ColourManager,
    as_json: bool,
) -> Result<()> {
    let found = manager
        .discover(dir, recursive)
        .await
        .with_context(|| format!("Cannot discover plugins in {}", dir.display()))?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&found)?);
    } else if found.is_empty() {
        println!("No plugins found in {}", dir.display());
    } else {
        discovery_table(&found).print(colours.colours_enabled());
    }
    Ok(())
}

/// Load and initialize the artifacts, hold, then shut the host down.
///
/// Artifacts are loaded first and initialized together so that their
/// dependencies can be given in any order on the command line.
pub async fn run_plugins(
    manager: &PluginManager,
    artifacts: &[PathBuf],
    hold: Option<Duration>,
    watch: bool,
    colours: &ColourManager,
    as_json: bool,
) -> Result<()> {
    let options = PluginLoadOptions {
        check_dependencies: false,
        ..PluginLoadOptions::default()
    };
    let mut loaded = Vec::new();
    for artifact in artifacts {
        match manager.load_plugin(artifact, options.clone()).await {
            Ok(id) => loaded.push(id),
            Err(e) => {
                warn!("Failed to load {}: {}", artifact.display(), e);
                eprintln!("{} {}: {}", colours.error("load failed"), artifact.display(), e);
            }
        }
    }
    if loaded.is_empty() {
        anyhow::bail!("None of the {} artifact(s) could be loaded", artifacts.len());
    }

    let started = manager.initialize_all().await;
    if !as_json {
        println!("{}", colours.highlight("Initialization"));
        report_table(&started).print(colours.colours_enabled());
    }

    if watch {
        for id in &loaded {
            if let Err(e) = manager.enable_hot_reload(id) {
                warn!("Not watching '{}': {}", id, e);
            }
        }
    }

    if !as_json {
        println!("{}", colours.highlight("Plugins"));
        state_table(&snapshots(manager)).print(colours.colours_enabled());
    }

    match hold {
        Some(hold) => {
            info!("Holding plugins for {:?}", hold);
            tokio::time::sleep(hold).await;
        }
        None => {
            info!("Running until interrupted");
            tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
        }
    }

    let metrics = manager.system_metrics();
    let final_states = snapshots(manager);
    let stopped = manager.shutdown().await;

    if as_json {
        let output = json!({
            "initialize": report_json(&started),
            "plugins": final_states,
            "metrics": metrics,
            "shutdown": report_json(&stopped),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("{}", colours.highlight("Metrics"));
        metrics_table(&metrics).print(colours.colours_enabled());
        println!("{}", colours.highlight("Shutdown"));
        report_table(&stopped).print(colours.colours_enabled());
    }
    Ok(())
}

fn snapshots(manager: &PluginManager) -> Vec<PluginSnapshot> {
    manager
        .loaded()
        .iter()
        .filter_map(|id| manager.get_plugin(id))
        .collect()
}

pub fn metadata_table(metadata: &PluginMetadata, artifact: &Artifact) -> TableBuilder {
    let list = |items: Vec<String>| if items.is_empty() { "-".to_string() } else { items.join(", ") };
    let rows = vec![
        ("Id", metadata.id.clone()),
        ("Name", metadata.name.clone()),
        ("Version", metadata.version.to_string()),
        ("Description", metadata.description.clone()),
        ("Author", metadata.author.clone()),
        ("License", metadata.license.clone()),
        ("Category", metadata.category.clone()),
        ("Tags", list(metadata.tags.clone())),
        ("Dependencies", list(metadata.dependencies.iter().map(|d| d.to_string()).collect())),
        (
            "Optional",
            list(metadata.optional_dependencies.iter().map(|d| d.to_string()).collect()),
        ),
        (
            "Capabilities",
            list(metadata.capabilities.names().iter().map(|n| n.to_string()).collect()),
        ),
        ("Priority", metadata.priority.to_string()),
        ("Artifact", artifact.file_path.display().to_string()),
        ("Size", format!("{} bytes", artifact.size)),
        ("SHA-256", artifact.content_digest.clone()),
    ];
    rows.into_iter().fold(TableBuilder::new(), |table, (key, value)| {
        table.add_styled_row(vec![(key.to_string(), CellStyle::Key), (value, CellStyle::Plain)])
    })
}

pub fn discovery_table(found: &[DiscoveredPlugin]) -> TableBuilder {
    found.iter().fold(
        TableBuilder::new().headers(["Plugin", "Version", "Dependencies", "Path"]),
        |table, plugin| {
            let deps: Vec<String> = plugin.metadata.dependencies.iter().map(|d| d.to_string()).collect();
            table.add_row([
                plugin.metadata.id.clone(),
                plugin.metadata.version.to_string(),
                if deps.is_empty() { "-".to_string() } else { deps.join(", ") },
                plugin.path.display().to_string(),
            ])
        },
    )
}

fn state_style(state: PluginState) -> CellStyle {
    match state {
        PluginState::Running => CellStyle::Good,
        PluginState::Failed => CellStyle::Bad,
        PluginState::Paused | PluginState::Stopping | PluginState::Stopped => CellStyle::Warn,
        _ => CellStyle::Plain,
    }
}

pub fn state_table(plugins: &[PluginSnapshot]) -> TableBuilder {
    plugins.iter().fold(
        TableBuilder::new().headers(["Plugin", "Version", "State", "Reload", "Last error"]),
        |table, plugin| {
            table.add_styled_row(vec![
                (plugin.id.clone(), CellStyle::Plain),
                (plugin.metadata.version.to_string(), CellStyle::Plain),
                (plugin.state.to_string(), state_style(plugin.state)),
                (
                    if plugin.reload_enabled { "watching" } else { "-" }.to_string(),
                    CellStyle::Plain,
                ),
                (plugin.last_error.clone().unwrap_or_else(|| "-".to_string()), CellStyle::Bad),
            ])
        },
    )
}

pub fn report_table(report: &BatchReport) -> TableBuilder {
    report.outcomes.iter().fold(
        TableBuilder::new().headers(["Plugin", report.operation.as_str(), "Detail"]),
        |table, (id, outcome)| {
            let (label, style) = match outcome {
                Outcome::Ok => ("ok", CellStyle::Good),
                Outcome::Failed(_) => ("failed", CellStyle::Bad),
                Outcome::Skipped(_) => ("skipped", CellStyle::Warn),
            };
            let detail = outcome.error().map_or_else(|| "-".to_string(), |e| e.to_string());
            table.add_styled_row(vec![
                (id.clone(), CellStyle::Plain),
                (label.to_string(), style),
                (detail, CellStyle::Plain),
            ])
        },
    )
}

fn report_json(report: &BatchReport) -> serde_json::Value {
    let outcomes: Vec<serde_json::Value> = report
        .outcomes
        .iter()
        .map(|(id, outcome)| {
            json!({
                "plugin_id": id,
                "ok": outcome.is_ok(),
                "skipped": outcome.is_skipped(),
                "error": outcome.error().map(|e| e.to_string()),
            })
        })
        .collect();
    json!({ "operation": report.operation, "outcomes": outcomes })
}

pub fn metrics_table(metrics: &SystemMetrics) -> TableBuilder {
    let by_state = metrics
        .plugins_by_state
        .iter()
        .map(|(state, count)| format!("{}={}", state, count))
        .collect::<Vec<_>>()
        .join(", ");
    let rows = vec![
        ("Plugins", format!("{} ({})", metrics.total_plugins, by_state)),
        (
            "Metadata cache",
            format!(
                "{}/{} entries, {:.0}% hit rate",
                metrics.cache.size,
                metrics.cache.max_size,
                metrics.cache.hit_rate * 100.0
            ),
        ),
        (
            "Bus",
            format!(
                "{} sent, {} delivered, {} dropped",
                metrics.bus.sent_total, metrics.bus.received_total, metrics.bus.dropped_total
            ),
        ),
        (
            "Transactions",
            format!(
                "{} committed, {} rolled back, {} active",
                metrics.transactions.committed, metrics.transactions.rolled_back, metrics.transactions.active
            ),
        ),
        ("Services", metrics.registered_services.to_string()),
        ("Watched artifacts", metrics.hot_reload.watched.to_string()),
        ("Recorded errors", metrics.error_history_len.to_string()),
        ("Uptime", format!("{} ms", metrics.uptime_ms)),
    ];
    rows.into_iter().fold(TableBuilder::new(), |table, (key, value)| {
        table.add_styled_row(vec![(key.to_string(), CellStyle::Key), (value, CellStyle::Plain)])
    })
}

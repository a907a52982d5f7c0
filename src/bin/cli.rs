//! Fresh CLI - Main entry point for the CLI binary
//!
//! Inspects the bundle store of an application and drives update checks.

use anyhow::{Context, Result};
use clap::Parser;
use fresh_lib::engine::{
    cli::{
        formatter::{format_duration, format_timestamp, CliFormatter},
        Cli, Commands, OutputFormat,
    },
    config::EngineConfig,
    updater::{
        resolver::verify_installed, BundleResolver, BundleStore, UpdateEngine, UpdateEvent,
        UpdateResult,
    },
};
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_directive())),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run_cli(cli) {
        CliFormatter::error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

fn run_cli(cli: Cli) -> Result<()> {
    let config_path = cli.get_config_path();
    let config = EngineConfig::load_file(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    let json = cli.format == OutputFormat::Json;

    match cli.command {
        Commands::Status => cmd_status(&cli, config, json),
        Commands::Check => cmd_check(&cli, config, json),
        Commands::Verify { ref version } => cmd_verify(&cli, &config, version, json),
        Commands::List => cmd_list(&cli, &config, json),
        Commands::Prune { keep } => cmd_prune(&cli, &config, keep, json),
        Commands::EntryPoints => cmd_entry_points(&cli, config, json),
    }
}

fn store_for(cli: &Cli, config: &EngineConfig) -> BundleStore {
    BundleStore::new(cli.host_context(config).data_dir)
}

fn cmd_status(cli: &Cli, config: EngineConfig, json: bool) -> Result<()> {
    let interval = config.auto_update_interval;
    let host = cli.host_context(&config);
    let engine = UpdateEngine::with_http(config, host)?;
    let selection = engine.selection();
    let installed = engine.store().list_versions()?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "id": engine.config().id,
                "state": engine.state(),
                "active_version": engine.active_bundle_version(),
                "active_path": engine.active_bundle_path().map(|p| p.display().to_string()),
                "selected_version": selection.selected(),
                "last_check": selection.last_check_timestamp,
                "installed": installed,
            })
        );
        return Ok(());
    }

    CliFormatter::header(&format!("Fresh: {}", engine.config().id));
    match engine.active_bundle() {
        Some(bundle) => {
            CliFormatter::kv("Active version", bundle.version());
            CliFormatter::kv("Active path", &bundle.path.display().to_string());
        }
        None => CliFormatter::warning("No usable bundle"),
    }
    CliFormatter::kv("Selected version", selection.selected().unwrap_or("none"));
    CliFormatter::kv("Last check", &format_timestamp(selection.last_check_timestamp));
    CliFormatter::kv("Check interval", &format_duration(interval.max(0) as u64));
    CliFormatter::kv("Data directory", &engine.store().data_dir().display().to_string());
    CliFormatter::kv("Installed", &installed.len().to_string());
    for version in &installed {
        CliFormatter::item(version);
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn cmd_check(cli: &Cli, config: EngineConfig, json: bool) -> Result<()> {
    let host = cli.host_context(&config);
    let engine = UpdateEngine::with_http(config, host)?;
    let mut events = engine.subscribe();
    let mut printer = EventPrinter { json, in_transfer: false };

    let run = engine.check_and_update();
    tokio::pin!(run);
    let result = loop {
        tokio::select! {
            result = &mut run => break result,
            Some(event) = events.recv() => printer.print(event),
        }
    };
    while let Ok(event) = events.try_recv() {
        printer.print(event);
    }

    match result {
        Ok(UpdateResult::Downloaded(info)) => {
            if !json {
                CliFormatter::success(&format!(
                    "Bundle {} installed; it becomes active on next start",
                    info.version
                ));
            }
            Ok(())
        }
        Ok(UpdateResult::NotAvailable) => {
            if !json {
                CliFormatter::info("Already up to date");
            }
            Ok(())
        }
        Err(e) => Err(anyhow::anyhow!("Update failed: {}", e)),
    }
}

struct EventPrinter {
    json: bool,
    in_transfer: bool,
}

impl EventPrinter {
    fn print(&mut self, event: UpdateEvent) {
        if self.json {
            if let Ok(line) = serde_json::to_string(&event) {
                println!("{}", line);
            }
            return;
        }
        match event {
            UpdateEvent::Progress {
                bytes_transferred,
                total_bytes,
            } => {
                self.in_transfer = true;
                CliFormatter::transfer(bytes_transferred, total_bytes);
            }
            UpdateEvent::StateChanged { state, version } => {
                if self.in_transfer {
                    CliFormatter::end_transfer();
                    self.in_transfer = false;
                }
                CliFormatter::state(state, version.as_deref());
            }
        }
    }
}

fn cmd_verify(cli: &Cli, config: &EngineConfig, version: &str, json: bool) -> Result<()> {
    let store = store_for(cli, config);
    let dir = store.bundle_path(version);
    if !dir.is_dir() {
        anyhow::bail!("Bundle {} is not installed", version);
    }

    let (bundle, report) = verify_installed(&store, &dir, None)
        .with_context(|| format!("Bundle {} failed verification", version))?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "version": bundle.version(),
                "valid": true,
                "checked": report.checked,
                "hashed": report.hashed,
            })
        );
    } else {
        CliFormatter::success(&format!(
            "Bundle {} verified ({} files, {} hashed)",
            bundle.version(),
            report.checked,
            report.hashed
        ));
    }
    Ok(())
}

fn cmd_list(cli: &Cli, config: &EngineConfig, json: bool) -> Result<()> {
    let store = store_for(cli, config);
    let versions = store.list_versions()?;
    let selected = store.load_selection();

    if json {
        println!(
            "{}",
            serde_json::json!({ "installed": versions, "selected": selected.selected() })
        );
    } else if versions.is_empty() {
        CliFormatter::info("No bundles installed");
    } else {
        CliFormatter::header("Installed bundles");
        for version in &versions {
            if selected.selected() == Some(version.as_str()) {
                CliFormatter::item(&format!("{} (selected)", version));
            } else {
                CliFormatter::item(version);
            }
        }
    }
    Ok(())
}

fn cmd_prune(cli: &Cli, config: &EngineConfig, keep: Option<usize>, json: bool) -> Result<()> {
    let host = cli.host_context(config);
    let store = BundleStore::new(&host.data_dir);
    let selection = store.load_selection();
    let in_use = BundleResolver::new(&store, host.fallback_path(config))
        .with_selection(selection.selected())
        .in_use();
    let protected: Vec<&str> = in_use.iter().map(String::as_str).collect();
    let removed = store.prune(keep.unwrap_or(config.keep_bundles).max(1), &protected);

    if json {
        println!("{}", serde_json::json!({ "removed": removed }));
    } else if removed.is_empty() {
        CliFormatter::info("Nothing to prune");
    } else {
        CliFormatter::success(&format!("Removed {} bundle(s)", removed.len()));
        for version in &removed {
            CliFormatter::item(version);
        }
    }
    Ok(())
}

fn cmd_entry_points(cli: &Cli, config: EngineConfig, json: bool) -> Result<()> {
    let host = cli.host_context(&config);
    let engine = UpdateEngine::with_http(config, host)?;
    let entry_points: Vec<String> = engine
        .entry_points()
        .iter()
        .map(|p| p.display().to_string())
        .collect();

    if json {
        println!("{}", serde_json::json!({ "entry_points": entry_points }));
    } else if entry_points.is_empty() {
        anyhow::bail!("No usable bundle");
    } else {
        for path in &entry_points {
            println!("{}", path);
        }
    }
    Ok(())
}

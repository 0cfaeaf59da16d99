//! Import command implementation.

use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

use crate::blob::FsBlobStore;
use crate::cli::{ImportArgs, ImportCommands, ImportRunArgs};
use crate::config::ImportSettings;
use crate::error::{GantryError, Result};
use crate::import::{ImportEnv, ImportRegistry, ImportRequest, ImportStatus};
use crate::notify::LogNotifier;
use crate::remote::HttpRemote;
use crate::storage::SqliteStorage;

/// Execute the import command.
///
/// # Errors
///
/// Returns an error if the import cannot be started or ends in failure.
pub fn execute(args: &ImportArgs, json: bool) -> Result<()> {
    match &args.command {
        ImportCommands::Run(run_args) => run_import(run_args, json),
    }
}

fn run_import(args: &ImportRunArgs, json: bool) -> Result<()> {
    let settings = ImportSettings::load(args.config.as_deref())?;
    settings.validate()?;

    let storage = SqliteStorage::open(&args.db)?;
    storage.ensure_workspace(args.workspace, "workspace")?;

    let env = ImportEnv {
        remote: Arc::new(HttpRemote::new(&settings.remote)?),
        blobs: Arc::new(FsBlobStore::open(&args.blob_dir)?),
        notifier: Arc::new(LogNotifier),
        settings,
    };
    let request = ImportRequest {
        actor: resolve_actor(args.actor.as_deref()),
        workspace_id: args.workspace,
        source_project: args.project.clone(),
    };

    let registry = ImportRegistry::new();
    let session_id = registry.begin_import(request, env, storage)?;

    let status = if json {
        // No progress bar in machine mode; poll quietly.
        wait_quiet(&registry, session_id)?
    } else {
        watch_with_progress(&registry, session_id)?
    };

    report(&status, json)
}

fn wait_quiet(registry: &ImportRegistry, session_id: uuid::Uuid) -> Result<ImportStatus> {
    loop {
        let status = registry.status(session_id)?;
        if status.finished {
            return Ok(status);
        }
        std::thread::sleep(Duration::from_millis(250));
    }
}

fn watch_with_progress(registry: &ImportRegistry, session_id: uuid::Uuid) -> Result<ImportStatus> {
    let bar = ProgressBar::new(100);
    let style = ProgressStyle::with_template("{bar:40.cyan/blue} {pos:>3}% {msg}")
        .map_err(|e| GantryError::Config(format!("progress template: {e}")))?;
    bar.set_style(style);

    loop {
        let status = registry.status(session_id)?;
        bar.set_position(u64::from(status.progress));
        bar.set_message(format!(
            "{} (issues {}/{}, attachments {}/{})",
            status.stage,
            status.counters.issues_mapped,
            status.counters.issues_total,
            status.counters.attachments_done,
            status.counters.attachments_total,
        ));
        if status.finished {
            bar.finish_with_message(if status.error.is_empty() {
                "done".to_string()
            } else {
                status.error.clone()
            });
            return Ok(status);
        }
        std::thread::sleep(Duration::from_millis(200));
    }
}

fn report(status: &ImportStatus, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(status)?);
    } else {
        println!(
            "Imported {} issues, {} users, {} attachments from {}.",
            status.counters.issues_mapped,
            status.counters.users_done,
            status.counters.attachments_done,
            status.source_project,
        );
        if !status.bad_attachments.is_empty() {
            println!(
                "{} attachment(s) failed every download attempt:",
                status.bad_attachments.len()
            );
            for bad in &status.bad_attachments {
                println!("  {} ({}): {}", bad.name, bad.source_key, bad.reason);
            }
        }
    }

    if status.error.is_empty() {
        Ok(())
    } else {
        Err(GantryError::Config(format!(
            "import ended {}: {}",
            if status.error == "import cancelled" {
                "cancelled"
            } else {
                "in failure"
            },
            status.error
        )))
    }
}

fn resolve_actor(actor_override: Option<&str>) -> String {
    if let Some(actor) = actor_override {
        if !actor.trim().is_empty() {
            return actor.to_string();
        }
    }
    if let Ok(value) = std::env::var("GANTRY_ACTOR") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    if let Ok(value) = std::env::var("USER") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    "unknown".to_string()
}

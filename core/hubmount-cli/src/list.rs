//! `hubmount list`: registered sessions and cache space.

use chrono::{DateTime, Utc};
use hubmount_core::overlay::usage;
use hubmount_core::{LockRegistry, MountError, RegistryEntry, Result, SessionController, EXIT_OK};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct ListedSession<'a> {
    #[serde(flatten)]
    entry: &'a RegistryEntry,
    stale: bool,
}

pub fn run(controller: &SessionController, json: bool) -> Result<i32> {
    let entries = load_entries(controller.registry())?;
    let listed: Vec<_> = entries
        .iter()
        .map(|entry| ListedSession {
            entry,
            stale: entry.is_stale(),
        })
        .collect();

    if json {
        let out = serde_json::to_string_pretty(&listed).map_err(|e| MountError::Json {
            context: "serialize session list".to_string(),
            source: e,
        })?;
        println!("{out}");
        return Ok(EXIT_OK);
    }

    if listed.is_empty() {
        println!("No mounted repositories");
    } else {
        println!("{:<20} {:<32} {:>8} {:>8}  PATH", "FOLDER", "REPO", "PID", "AGE");
        let now = Utc::now();
        for item in &listed {
            let e = item.entry;
            let pid = if item.stale {
                format!("{}*", e.pid)
            } else {
                e.pid.to_string()
            };
            println!(
                "{:<20} {:<32} {:>8} {:>8}  {}",
                e.folder,
                e.repo,
                pid,
                format_age(e.created_at, now),
                e.path
            );
        }
        if listed.iter().any(|item| item.stale) {
            println!("* owner is gone; run `hubmount cleanup`");
        }
    }

    let cache_root = controller.overlay().cache_root();
    match usage(cache_root) {
        Ok(u) => println!(
            "Cache {}: {} MB free of {} MB",
            cache_root.display(),
            u.available_bytes / (1024 * 1024),
            u.total_bytes / (1024 * 1024)
        ),
        Err(e) => tracing::debug!(error = %e, "Cache usage unavailable"),
    }
    Ok(EXIT_OK)
}

/// Reads the registry for display. A corrupt file is reported and listed as
/// empty; the next command that changes the registry moves it aside.
fn load_entries(registry: &LockRegistry) -> Result<Vec<RegistryEntry>> {
    match registry.entries() {
        Err(MountError::Corruption { path, details }) => {
            tracing::warn!(path = %path.display(), error = %details, "Registry unreadable");
            eprintln!(
                "warning: registry {} is corrupt ({details}); it will be moved aside on the next mount or cleanup",
                path.display()
            );
            Ok(Vec::new())
        }
        other => other,
    }
}

fn format_age(created_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - created_at).num_seconds().max(0);
    match secs {
        0..=59 => format!("{secs}s"),
        60..=3599 => format!("{}m", secs / 60),
        3600..=86_399 => format!("{}h", secs / 3600),
        _ => format!("{}d", secs / 86_400),
    }
}

use std::time::Duration;

mod api;
mod app;
mod config;
mod db;
mod error;
mod models;

use app::App;
use config::Config;
use error::Result;
use models::{DbEvent, Entry, Filter, FilterType};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging (only show warnings and errors by default)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("list");

    let config = Config::load()?;
    let mut app = App::new(config).await?;

    match command {
        "sync" => {
            app.sync(true).await?;
            report_events(&mut app);
        }

        "list" => {
            let kind = match args.get(2).map(String::as_str) {
                Some("unread") | None => FilterType::Unread,
                Some("newest") => FilterType::Newest,
                Some("starred") => FilterType::Starred,
                Some(other) => {
                    eprintln!("Unknown filter: {}", other);
                    return Ok(());
                }
            };
            // freshen the cache first when a sync is overdue
            let _ = app.sync(false).await;

            let filter = Filter::new(kind, app.config.items_per_page);
            let page = app.list(&filter, false).await?;
            for entry in &page.entries {
                print_entry(entry);
            }
            if page.has_more {
                println!("  ... more available, continue with the last entry as cursor");
            }
            report_events(&mut app);
        }

        "mark" | "unmark" => {
            let Some(id) = parse_id(&args) else {
                return usage();
            };
            // "mark" marks read, i.e. clears the unread flag
            app.mark_entry(id, command == "unmark").await?;
            report_events(&mut app);
        }

        "star" | "unstar" => {
            let Some(id) = parse_id(&args) else {
                return usage();
            };
            app.star_entry(id, command == "star").await?;
            report_events(&mut app);
        }

        "show" => {
            let Some(id) = parse_id(&args) else {
                return usage();
            };
            match app.entry(id).await? {
                Some(entry) => {
                    print_entry(&entry);
                    if let Ok(text) = html2text::from_read(entry.content.as_bytes(), 80) {
                        println!("\n{}", text);
                    }
                }
                None => println!("Entry {} is not in the local cache", id),
            }
        }

        "open" => {
            let Some(id) = parse_id(&args) else {
                return usage();
            };
            match app.entry(id).await? {
                Some(entry) if !entry.link.is_empty() => {
                    let _ = open::that(&entry.link);
                }
                _ => println!("Entry {} has no link in the local cache", id),
            }
        }

        "stats" => {
            if let Some(stats) = app.stats().await? {
                println!(
                    "total: {}  unread: {}  starred: {}",
                    stats.total, stats.unread, stats.starred
                );
            } else {
                println!("No local cache; enable offline mode for stats");
            }
        }

        "watch" => {
            let interval = Duration::from_secs(u64::from(app.config.sync_interval_minutes) * 60);
            println!(
                "Syncing every {} minutes; ctrl-c to stop",
                app.config.sync_interval_minutes
            );
            if let Err(error) = app.db.try_online().await {
                tracing::warn!("initial sync failed: {}", error);
            }
            report_events(&mut app);
            loop {
                if let Err(error) = app.sync(false).await {
                    tracing::warn!("sync failed: {}", error);
                }
                report_events(&mut app);
                tokio::time::sleep(interval).await;
            }
        }

        "reset" => {
            app.reset_cache().await?;
            println!("Local cache cleared");
        }

        _ => return usage(),
    }

    Ok(())
}

fn parse_id(args: &[String]) -> Option<i64> {
    args.get(2).and_then(|raw| raw.parse().ok())
}

fn usage() -> Result<()> {
    eprintln!(
        "usage: drift-reader [sync | list [newest|unread|starred] | mark <id> | unmark <id> \
         | star <id> | unstar <id> | show <id> | open <id> | stats | watch | reset]"
    );
    Ok(())
}

fn print_entry(entry: &Entry) {
    println!(
        "{:>8}  {}  {}{} {} ({})",
        entry.id,
        entry.datetime.format("%Y-%m-%d %H:%M"),
        if entry.unread { "●" } else { " " },
        if entry.starred { "★" } else { " " },
        entry.title,
        entry.source_title.as_deref().unwrap_or("unknown source"),
    );
}

fn report_events(app: &mut App) {
    for event in app.poll_events() {
        match event {
            DbEvent::StatsChanged(stats) => {
                println!(
                    "server counts: {} total, {} unread, {} starred",
                    stats.total, stats.unread, stats.starred
                );
            }
            DbEvent::OfflineCountsChanged {
                total,
                unread,
                starred,
            } => {
                tracing::debug!(
                    "cached locally: {} total, {} unread, {} starred",
                    total,
                    unread,
                    starred
                );
            }
            DbEvent::WentOffline => println!("Server unreachable, working from the local cache"),
            DbEvent::WentOnline => println!("Back online"),
            DbEvent::StorageBroken { message } => {
                eprintln!("Local storage failed and was disabled: {}", message);
            }
            DbEvent::SyncFailed { message } => eprintln!("Sync failed: {}", message),
            DbEvent::EntryStatusesChanged(_)
            | DbEvent::TagsChanged(_)
            | DbEvent::SourcesChanged(_)
            | DbEvent::ReloadRequested => {}
        }
    }
}

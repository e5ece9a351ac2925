use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::Parser;
use homedir::my_home;
use inquire::error::InquireResult;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

mod app;
mod bookmarks;
mod cli;
mod config;
mod eid;
mod history;
mod lock;
mod semantic;
mod storage;
#[cfg(test)]
mod tests;

use app::{App, Attachment};
use bookmarks::{parse_tags, BookmarkCreate, BookmarkUpdate, SearchQuery};
use config::Config;
use lock::FileLock;

const LOG_ENV: &str = "SMARTMARKS_LOG";

fn base_path() -> anyhow::Result<PathBuf> {
    if let Ok(base_path) = std::env::var("SMARTMARKS_BASE_PATH") {
        return Ok(PathBuf::from(base_path));
    }

    let home = my_home()
        .map_err(|err| anyhow::anyhow!("could not determine home directory: {err:?}"))?
        .context("home directory path is empty")?;
    Ok(home.join(".local/share/smartmarks"))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn confirm(message: &str) -> anyhow::Result<bool> {
    match inquire::prompt_confirmation(message) {
        InquireResult::Ok(answer) => Ok(answer),
        InquireResult::Err(err) => bail!("An error occurred: {}", err),
    }
}

fn read_attachments(paths: &[PathBuf]) -> anyhow::Result<Vec<Attachment>> {
    paths
        .iter()
        .map(|path| -> anyhow::Result<Attachment> {
            let data = std::fs::read(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "attachment".to_string());
            Ok(Attachment { name, data })
        })
        .collect()
}

fn acquire_lock(base_path: &Path) -> anyhow::Result<FileLock> {
    match FileLock::try_acquire(base_path) {
        Ok(lock) => Ok(lock),
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
            log::warn!("{err}, waiting");
            Ok(FileLock::acquire_blocking(base_path)?)
        }
        Err(err) => Err(err).context("failed to lock base directory"),
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let args = cli::Args::parse();

    let base_path = base_path()?;
    std::fs::create_dir_all(&base_path)
        .with_context(|| format!("failed to create {}", base_path.display()))?;
    let _lock = acquire_lock(&base_path)?;

    let config = Config::load_with(&base_path)?;
    let app = App::new(config, true)?;

    match args.command {
        cli::Command::Add {
            url,
            title,
            description,
            category,
            tags,
            files,
        } => {
            let bmark_create = BookmarkCreate {
                title,
                description,
                url,
                category,
                tags: tags.map(parse_tags),
                files: vec![],
            };

            let (bmark, status) = app.create(bmark_create, read_attachments(&files)?)?;
            print_json(&serde_json::json!({ "bookmark": bmark, "index": status }))
        }

        cli::Command::Edit {
            id,
            url,
            title,
            description,
            category,
            tags,
            append_tags,
            files,
            detach,
        } => {
            let bmark_update = BookmarkUpdate {
                title,
                description,
                url,
                category,
                tags: tags.map(parse_tags),
                append_tags: append_tags.map(parse_tags),
                add_files: vec![],
                remove_files: detach,
            };

            if bmark_update.is_empty() && files.is_empty() {
                println!("This update request does nothing");
                return Ok(());
            }

            let (bmark, status) = app.update(id, bmark_update, read_attachments(&files)?)?;
            print_json(&serde_json::json!({ "bookmark": bmark, "index": status }))
        }

        cli::Command::Delete { id, yes } => {
            let Some(bmark) = app.search(SearchQuery {
                id: Some(id),
                ..Default::default()
            })?
            .pop() else {
                bail!("bookmark {id} not found");
            };

            if !yes && !confirm(&format!("Delete bookmark {id} \"{}\"?", bmark.title))? {
                return Ok(());
            }

            app.delete(id)?;
            println!("bookmark {id} removed");
            Ok(())
        }

        cli::Command::Show { id } => print_json(&app.view(id)?),

        cli::Command::Search {
            keyword,
            title,
            category,
            tags,
            id,
            exact,
            limit,
            count,
        } => {
            let bmarks = app.search(SearchQuery {
                id,
                title,
                category,
                tags: tags.map(parse_tags),
                keyword,
                exact,
                limit,
            })?;

            if count {
                println!("{} bookmarks found", bmarks.len());
                return Ok(());
            }

            print_json(&bmarks)
        }

        cli::Command::Semantic { query, limit } => {
            print_json(&app.semantic_search(&query, limit)?)
        }

        cli::Command::Reindex { yes } => {
            if !yes && !confirm("Re-embed every bookmark and replace the semantic index?")? {
                return Ok(());
            }

            let count = app.reindex(true)?;
            println!("{count} bookmarks indexed");
            Ok(())
        }

        cli::Command::History { clear } => {
            if clear {
                app.clear_history()?;
                println!("search history cleared");
                return Ok(());
            }

            print_json(&app.history())
        }

        cli::Command::Stats => print_json(&app.stats()?),
    }
}

/*
 * vPipe mail delivery pipeline
 * Copyright (C) 2023 viridIT SAS
 *
 * This program is free software: you can redistribute it and/or modify it under
 * the terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or any later version.
 *
 * This program is distributed in the hope that it will be useful, but WITHOUT
 * ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
 * FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * this program. If not, see https://www.gnu.org/licenses/.
 *
*/

use crate::{Modifier, ModifierState};
use anyhow::Context;
use futures_util::FutureExt;
use vpipe_common::{address, Error, MsgMetadata};

/// Interval between modification-time probes of the alias files.
const RELOAD_INTERVAL: std::time::Duration = std::time::Duration::from_secs(15);

type Table = std::collections::HashMap<String, String>;
type SharedTable = std::sync::Arc<std::sync::RwLock<Table>>;

fn read(table: &SharedTable) -> std::sync::RwLockReadGuard<'_, Table> {
    table
        .read()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn write(table: &SharedTable) -> std::sync::RwLockWriteGuard<'_, Table> {
    table
        .write()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Recipient-rewriting modifier backed by alias files.
///
/// Each file maps a lower-cased local part or complete address to a
/// replacement, one `KEY : REPLACEMENT` per line. The files are re-read as
/// a whole whenever one of them changes on disk; readers observe either the
/// previous or the new table in full, never a mix.
pub struct AliasFile {
    table: SharedTable,
    reloader: tokio::task::JoinHandle<()>,
}

impl AliasFile {
    /// Load `files` and start the background reloader.
    ///
    /// Missing files are treated as empty; a file that exists but does not
    /// parse fails the load.
    ///
    /// # Errors
    ///
    /// * a file could not be read or parsed.
    pub async fn new(files: Vec<std::path::PathBuf>) -> anyhow::Result<Self> {
        let (map, mtimes) = load_all(&files).await?;
        let table = std::sync::Arc::new(std::sync::RwLock::new(map));

        let reloader = tokio::spawn(reload_loop(files, table.clone(), mtimes));
        Ok(Self { table, reloader })
    }

    /// Current number of alias entries.
    #[must_use]
    pub fn len(&self) -> usize {
        read(&self.table).len()
    }

    ///
    #[must_use]
    pub fn is_empty(&self) -> bool {
        read(&self.table).is_empty()
    }
}

impl Drop for AliasFile {
    fn drop(&mut self) {
        self.reloader.abort();
    }
}

impl std::fmt::Debug for AliasFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AliasFile")
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Modifier for AliasFile {
    fn name(&self) -> &str {
        "alias_file"
    }

    fn new_state(&self, _meta: &MsgMetadata) -> Box<dyn ModifierState> {
        Box::new(AliasFileState {
            table: self.table.clone(),
        })
    }
}

struct AliasFileState {
    table: SharedTable,
}

#[async_trait::async_trait]
impl ModifierState for AliasFileState {
    async fn rewrite_rcpt(&mut self, rcpt_to: &str) -> Result<String, Error> {
        let table = read(&self.table);

        if let Some(replacement) = table.get(&rcpt_to.to_lowercase()) {
            return Ok(replacement.clone());
        }
        let Ok((local_part, domain)) = address::split(rcpt_to) else {
            // unknown shapes pass through untouched.
            return Ok(rcpt_to.to_owned());
        };
        match table.get(&local_part.to_lowercase()) {
            Some(replacement) if replacement.contains('@') => Ok(replacement.clone()),
            Some(replacement) => Ok(format!("{replacement}@{domain}")),
            None => Ok(rcpt_to.to_owned()),
        }
    }
}

/// Read every file into one fresh table, remembering the modification
/// times the load was based on.
///
/// A key aliased twice, on two lines or across two files, fails the load:
/// multiple replacements per key are reserved and not supported yet.
async fn load_all(
    files: &[std::path::PathBuf],
) -> anyhow::Result<(Table, Vec<Option<std::time::SystemTime>>)> {
    let mut map = Table::new();
    let mut mtimes = Vec::with_capacity(files.len());
    for file in files {
        match tokio::fs::read_to_string(file).await {
            Ok(content) => {
                for (key, replacement) in parse_table(&content)
                    .with_context(|| format!("failed to load aliases from '{}'", file.display()))?
                {
                    anyhow::ensure!(
                        map.insert(key.clone(), replacement).is_none(),
                        "'{key}' is aliased more than once ('{}'): multiple replacements per key are not supported",
                        file.display()
                    );
                }
                mtimes.push(
                    tokio::fs::metadata(file)
                        .await
                        .ok()
                        .and_then(|metadata| metadata.modified().ok()),
                );
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => mtimes.push(None),
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed to read '{}'", file.display()))
            }
        }
    }
    Ok((map, mtimes))
}

/// Parse one alias file.
///
/// `#` starts a comment, blank lines are skipped, keys and replacements
/// are trimmed and lower-cased. A `postmaster` key with a bare local-part
/// replacement is rejected (the expansion would be ambiguous).
fn parse_table(content: &str) -> anyhow::Result<Vec<(String, String)>> {
    let mut entries = Vec::new();
    for (number, line) in content.lines().enumerate() {
        let line = line.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, replacement)) = line.split_once(':') else {
            anyhow::bail!("line {}: missing ':' separator", number + 1);
        };
        let key = key.trim().to_lowercase();
        let replacement = replacement.trim().to_lowercase();
        if key.is_empty() || replacement.is_empty() {
            anyhow::bail!("line {}: empty key or replacement", number + 1);
        }
        if key == "postmaster" && !replacement.contains('@') {
            anyhow::bail!(
                "line {}: a 'postmaster' alias requires a complete address replacement",
                number + 1
            );
        }
        entries.push((key, replacement));
    }
    Ok(entries)
}

enum Reload {
    Unchanged,
    Reloaded,
    /// Every configured file is gone; the table was emptied and the
    /// reloader is done.
    Exit,
}

async fn reload_once(
    files: &[std::path::PathBuf],
    table: &SharedTable,
    mtimes: &mut Vec<Option<std::time::SystemTime>>,
) -> anyhow::Result<Reload> {
    let mut current = Vec::with_capacity(files.len());
    for file in files {
        current.push(
            tokio::fs::metadata(file)
                .await
                .ok()
                .and_then(|metadata| metadata.modified().ok()),
        );
    }

    if current.iter().all(Option::is_none) {
        *write(table) = Table::new();
        return Ok(Reload::Exit);
    }
    if current == *mtimes {
        return Ok(Reload::Unchanged);
    }

    let (map, new_mtimes) = load_all(files).await?;
    *mtimes = new_mtimes;
    *write(table) = map;
    Ok(Reload::Reloaded)
}

async fn reload_loop(
    files: Vec<std::path::PathBuf>,
    table: SharedTable,
    mut mtimes: Vec<Option<std::time::SystemTime>>,
) {
    let mut interval = tokio::time::interval(RELOAD_INTERVAL);
    // the first tick fires immediately; the load just happened.
    interval.tick().await;
    loop {
        interval.tick().await;
        let sweep = std::panic::AssertUnwindSafe(reload_once(&files, &table, &mut mtimes))
            .catch_unwind()
            .await;
        match sweep {
            Ok(Ok(Reload::Reloaded)) => {
                tracing::info!(entries = read(&table).len(), "alias table reloaded");
            }
            Ok(Ok(Reload::Unchanged)) => {}
            Ok(Ok(Reload::Exit)) => {
                tracing::warn!("all alias files vanished, stopping the reloader");
                return;
            }
            Ok(Err(error)) => {
                tracing::error!(%error, "alias reload failed, keeping the previous table");
            }
            Err(_) => {
                tracing::error!("alias reloader panicked, keeping the previous table");
            }
        }
    }
}

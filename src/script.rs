//! Line-oriented command scripts run against a [`ContainerFs`].
//!
//! One command per line, `#` starts a comment:
//!
//! ```text
//! put /_documents/a.txt hello
//! append /_documents/a.txt  world
//! cat /_documents/a.txt
//! ls /_documents
//! ```

use std::io::Write;
use std::str::FromStr;

use bytes::Bytes;
use containerfs::store::memory::MemoryStore;
use containerfs::store::{ContainerId, ContainerKind, OpenMode, RemoteStore, StoreError};
use containerfs::{ContainerFs, FsError, ItemType};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("line {line}: {msg}")]
    Parse { line: usize, msg: String },

    #[error("line {line}: {source}")]
    Command {
        line: usize,
        #[source]
        source: FsError,
    },

    #[error("Failed to seed the store: {0}")]
    Seed(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One script command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Replace the content of a file, creating it if missing.
    Put { path: String, text: String },
    /// Append to a file, creating it if missing.
    Append { path: String, text: String },
    /// Print a file.
    Cat { path: String },
    /// List a folder.
    Ls { path: String },
    /// Print attributes.
    Stat { path: String },
    /// Delete a file.
    Rm { path: String },
    /// Move a file.
    Mv { from: String, to: String },
    /// Copy a file.
    Cp { from: String, to: String },
    /// Empty a file.
    Truncate { path: String },
}

fn split_word(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    match s.split_once(char::is_whitespace) {
        Some((word, rest)) => Some((word, rest)),
        None => Some((s, "")),
    }
}

impl FromStr for Step {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let (cmd, rest) = split_word(line).ok_or("empty command")?;
        let (path, tail) = split_word(rest).ok_or_else(|| format!("'{cmd}' needs a path"))?;
        let path = path.to_owned();
        let single = |step: Self| {
            if tail.trim().is_empty() {
                Ok(step)
            } else {
                Err(format!("'{cmd}' takes one path"))
            }
        };
        // The text of put/append is everything after the single separating space.
        let text = tail.strip_prefix(' ').unwrap_or(tail).to_owned();
        match cmd {
            "put" => Ok(Self::Put { path, text }),
            "append" => Ok(Self::Append { path, text }),
            "cat" => single(Self::Cat { path }),
            "ls" => single(Self::Ls { path }),
            "stat" => single(Self::Stat { path }),
            "rm" => single(Self::Rm { path }),
            "truncate" => single(Self::Truncate { path }),
            "mv" | "cp" => {
                let (to, extra) =
                    split_word(tail).ok_or_else(|| format!("'{cmd}' needs two paths"))?;
                if !extra.trim().is_empty() {
                    return Err(format!("'{cmd}' takes two paths"));
                }
                let to = to.to_owned();
                Ok(if cmd == "mv" {
                    Self::Mv { from: path, to }
                } else {
                    Self::Cp { from: path, to }
                })
            }
            other => Err(format!("unknown command '{other}'")),
        }
    }
}

/// Parse a whole script. Returns each step with its 1-based line number.
pub fn parse(source: &str) -> Result<Vec<(usize, Step)>, ScriptError> {
    source
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line))
        .filter(|(_, line)| {
            let trimmed = line.trim();
            !trimmed.is_empty() && !trimmed.starts_with('#')
        })
        .map(|(line, text)| {
            text.parse()
                .map(|step| (line, step))
                .map_err(|msg| ScriptError::Parse { line, msg })
        })
        .collect()
}

/// An in-memory store with a root container and `defaults` linked under it.
pub fn seed_store(
    quota: Option<u64>,
    defaults: &[String],
) -> Result<(MemoryStore, ContainerId), StoreError> {
    let store = quota.map_or_else(MemoryStore::new, MemoryStore::with_quota);
    let root = store.create_container();
    for name in defaults {
        let child = store.create_container();
        store.link_container(root, name, child, ContainerKind::Default)?;
        debug!(%name, container = child.0, "linked default container");
    }
    Ok((store, root))
}

async fn write_all<S: RemoteStore>(
    fs: &ContainerFs<S>,
    path: &str,
    mode: OpenMode,
    text: &str,
) -> Result<(), FsError> {
    let d = fs.open_file(path, mode).await?;
    let result = async {
        let offset = match mode {
            OpenMode::Append => fs.item_attributes(path, Some(d)).await?.size,
            _ => {
                fs.truncate_file(path, d, 0).await?;
                0
            }
        };
        if !text.is_empty() {
            fs.write_file(path, d, offset, Bytes::copy_from_slice(text.as_bytes()))
                .await?;
        }
        Ok::<(), FsError>(())
    }
    .await;
    match result {
        Ok(()) => fs.close_file(path, d).await,
        Err(e) => {
            // The descriptor may already be gone after a failed operation.
            drop(fs.close_file(path, d).await);
            Err(e)
        }
    }
}

async fn read_all<S: RemoteStore>(fs: &ContainerFs<S>, path: &str) -> Result<Bytes, FsError> {
    let d = fs.open_file(path, OpenMode::Read).await?;
    let size = fs.item_attributes(path, Some(d)).await?.size;
    let data = fs.read_file(path, d, 0, size).await;
    fs.close_file(path, d).await?;
    data
}

async fn run_step<S: RemoteStore, W: Write>(
    fs: &ContainerFs<S>,
    step: &Step,
    out: &mut W,
) -> Result<Result<(), FsError>, std::io::Error> {
    let result = match step {
        Step::Put { path, text } => write_all(fs, path, OpenMode::Overwrite, text).await,
        Step::Append { path, text } => write_all(fs, path, OpenMode::Append, text).await,
        Step::Cat { path } => match read_all(fs, path).await {
            Ok(data) => {
                out.write_all(&data)?;
                writeln!(out)?;
                Ok(())
            }
            Err(e) => Err(e),
        },
        Step::Ls { path } => match fs.list_folder(path).await {
            Ok(entries) => {
                for entry in entries.iter() {
                    let suffix = if entry.is_folder { "/" } else { "" };
                    writeln!(out, "{}{suffix}", entry.name)?;
                }
                Ok(())
            }
            Err(e) => Err(e),
        },
        Step::Stat { path } => match fs.item_attributes(path, None).await {
            Ok(attrs) => {
                let kind = match attrs.item_type {
                    ItemType::File => "file",
                    ItemType::NewFile => "new-file",
                    ItemType::Container => "container",
                    ItemType::InferredFolder => "folder",
                };
                writeln!(out, "{kind} size={} version={}", attrs.size, attrs.version)?;
                Ok(())
            }
            Err(e) => Err(e),
        },
        Step::Rm { path } => fs.delete_file(path).await.map(|_| ()),
        Step::Mv { from, to } => fs.rename_file(from, to).await,
        Step::Cp { from, to } => fs.copy_file(from, to).await,
        Step::Truncate { path } => write_all(fs, path, OpenMode::Overwrite, "").await,
    };
    Ok(result)
}

/// Run `steps` in order, writing command output to `out`. Stops at the first
/// failing command.
pub async fn run<S: RemoteStore, W: Write>(
    fs: &ContainerFs<S>,
    steps: &[(usize, Step)],
    out: &mut W,
) -> Result<(), ScriptError> {
    for (line, step) in steps {
        debug!(line, ?step, "running step");
        run_step(fs, step, out)
            .await?
            .map_err(|source| ScriptError::Command {
                line: *line,
                source,
            })?;
    }
    Ok(())
}

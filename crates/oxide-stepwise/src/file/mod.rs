//! Migration files on disk.
//!
//! A migration is a pair of scripts sharing a version and a name:
//!
//! ```text
//! 0001_create_users.up.sql
//! 0001_create_users.down.sql
//! ```
//!
//! This module parses such file names, groups them into
//! [`MigrationFilePair`]s, and selects which halves must run to move the
//! ledger from one version to another.

pub mod store;

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::error::{MigrateError, Result};

pub use store::{FileStore, FsStore, MemoryStore};

/// Minimum number of digits of a version in a file name.
const VERSION_WIDTH: usize = 4;

/// Which way a script moves the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Applies a change.
    Up,
    /// Reverts a change.
    Down,
}

impl Direction {
    /// The suffix used in file names.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One half of a migration: a single up or down script.
///
/// The script body is not held in memory; [`MigrationFile::read_content`]
/// loads it from the file store when a driver is about to run it.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationFile {
    /// Version shared by both halves of the migration.
    pub version: u64,
    /// Human readable name (spaces already replaced by underscores).
    pub name: String,
    /// Up or down.
    pub direction: Direction,
    /// Directory the file lives in.
    pub path: PathBuf,
    /// File name, e.g. `0001_create_users.up.sql`.
    pub file_name: String,
    #[serde(skip)]
    store: Arc<dyn FileStore>,
}

impl MigrationFile {
    /// Creates a file handle backed by `store`.
    #[must_use]
    pub fn new(
        store: Arc<dyn FileStore>,
        path: impl Into<PathBuf>,
        file_name: impl Into<String>,
        version: u64,
        name: impl Into<String>,
        direction: Direction,
    ) -> Self {
        Self {
            version,
            name: name.into(),
            direction,
            path: path.into(),
            file_name: file_name.into(),
            store,
        }
    }

    /// Directory joined with the file name.
    #[must_use]
    pub fn full_path(&self) -> PathBuf {
        self.path.join(&self.file_name)
    }

    /// Loads the script body.
    pub fn read_content(&self) -> Result<String> {
        let path = self.full_path();
        let bytes = self
            .store
            .read(&path)
            .map_err(|source| MigrateError::ContentRead {
                path: path.clone(),
                source,
            })?;
        String::from_utf8(bytes).map_err(|e| MigrateError::ContentRead {
            path,
            source: io::Error::new(io::ErrorKind::InvalidData, e),
        })
    }
}

impl PartialEq for MigrationFile {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
            && self.direction == other.direction
            && self.path == other.path
            && self.file_name == other.file_name
    }
}

impl Eq for MigrationFile {}

/// The up and down scripts of one version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFilePair {
    /// Version of both halves.
    pub version: u64,
    /// Name of both halves.
    pub name: String,
    /// The script applying the change.
    pub up: MigrationFile,
    /// The script reverting the change.
    pub down: MigrationFile,
}

impl MigrationFilePair {
    /// Pairs two halves, checking that they describe the same migration.
    pub fn new(up: MigrationFile, down: MigrationFile) -> Result<Self> {
        if up.direction != Direction::Up || down.direction != Direction::Down {
            return Err(MigrateError::discovery(
                &up.file_name,
                format!("'{}' and '{}' are not an up/down pair", up.file_name, down.file_name),
            ));
        }
        if up.version != down.version {
            return Err(MigrateError::discovery(
                &up.file_name,
                format!("version differs from '{}'", down.file_name),
            ));
        }
        if up.name != down.name {
            return Err(MigrateError::discovery(
                &up.file_name,
                format!("name differs from '{}'", down.file_name),
            ));
        }
        Ok(Self {
            version: up.version,
            name: up.name.clone(),
            up,
            down,
        })
    }

    /// Returns the half running in `direction`.
    #[must_use]
    pub const fn file(&self, direction: Direction) -> &MigrationFile {
        match direction {
            Direction::Up => &self.up,
            Direction::Down => &self.down,
        }
    }
}

/// Migration pairs sorted by ascending version, without duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationFileSet {
    pairs: Vec<MigrationFilePair>,
}

impl MigrationFileSet {
    /// Builds a set, sorting the pairs and rejecting duplicate versions.
    pub fn new(mut pairs: Vec<MigrationFilePair>) -> Result<Self> {
        pairs.sort_by_key(|pair| pair.version);
        if let Some(window) = pairs.windows(2).find(|w| w[0].version == w[1].version) {
            return Err(MigrateError::discovery(
                &window[1].up.file_name,
                format!("duplicate version {}", window[1].version),
            ));
        }
        Ok(Self { pairs })
    }

    /// All pairs, ascending.
    #[must_use]
    pub fn pairs(&self) -> &[MigrationFilePair] {
        &self.pairs
    }

    /// Number of pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Returns whether no migrations were found.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Highest version, 0 when empty.
    #[must_use]
    pub fn last_version(&self) -> u64 {
        self.pairs.last().map_or(0, |pair| pair.version)
    }

    /// Looks a pair up by version.
    #[must_use]
    pub fn get(&self, version: u64) -> Option<&MigrationFilePair> {
        self.pairs
            .binary_search_by_key(&version, |pair| pair.version)
            .ok()
            .map(|index| &self.pairs[index])
    }

    /// Up scripts of every pair newer than `current`, ascending.
    #[must_use]
    pub fn to_last_from(&self, current: u64) -> Vec<MigrationFile> {
        self.forward(current).cloned().collect()
    }

    /// Down scripts of every pair at or below `current`, descending.
    #[must_use]
    pub fn to_first_from(&self, current: u64) -> Vec<MigrationFile> {
        self.backward(current).cloned().collect()
    }

    /// Scripts for `relative_n` steps away from `current`.
    ///
    /// Positive counts go forward, negative counts roll back, zero selects
    /// nothing. Counts larger than what is available are truncated.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::UnknownVersion`] if `current` is neither 0 nor
    /// the version of a discovered pair.
    pub fn from(&self, current: u64, relative_n: i64) -> Result<Vec<MigrationFile>> {
        self.ensure_known(current)?;
        let count = usize::try_from(relative_n.unsigned_abs()).unwrap_or(usize::MAX);
        let files = match relative_n.signum() {
            1 => self.forward(current).take(count).cloned().collect(),
            -1 => self.backward(current).take(count).cloned().collect(),
            _ => Vec::new(),
        };
        Ok(files)
    }

    /// Scripts moving the ledger from `current` to exactly `target`.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::UnknownVersion`] if either version is neither 0
    /// nor the version of a discovered pair.
    pub fn to(&self, current: u64, target: u64) -> Result<Vec<MigrationFile>> {
        self.ensure_known(current)?;
        self.ensure_known(target)?;
        let files = if target >= current {
            self.forward(current)
                .take_while(|file| file.version <= target)
                .cloned()
                .collect()
        } else {
            self.backward(current)
                .take_while(|file| file.version > target)
                .cloned()
                .collect()
        };
        Ok(files)
    }

    fn forward(&self, current: u64) -> impl Iterator<Item = &MigrationFile> {
        self.pairs
            .iter()
            .filter(move |pair| pair.version > current)
            .map(|pair| &pair.up)
    }

    fn backward(&self, current: u64) -> impl Iterator<Item = &MigrationFile> {
        self.pairs
            .iter()
            .rev()
            .filter(move |pair| pair.version <= current)
            .map(|pair| &pair.down)
    }

    fn ensure_known(&self, version: u64) -> Result<()> {
        if version == 0 || self.get(version).is_some() {
            Ok(())
        } else {
            Err(MigrateError::UnknownVersion(version))
        }
    }
}

/// Pieces of a migration file name.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ParsedName {
    version: u64,
    name: String,
    direction: Direction,
}

/// Matches `<digits>_<rest>.<extension>`; `<rest>` still carries the direction.
fn filename_regex(extension: &str) -> Result<Regex> {
    let pattern = format!(r"^([0-9]+)_(.+)\.{}$", regex::escape(extension));
    Regex::new(&pattern).map_err(|e| MigrateError::discovery(extension, e.to_string()))
}

/// Parses a file name. `Ok(None)` means the file is not a migration for this
/// extension and should be ignored.
fn parse_file_name(file_name: &str, re: &Regex) -> Result<Option<ParsedName>> {
    let Some(captures) = re.captures(file_name) else {
        return Ok(None);
    };

    let version = captures[1]
        .parse::<u64>()
        .map_err(|e| MigrateError::discovery(file_name, format!("invalid version: {e}")))?;

    let (name, suffix) = captures[2].rsplit_once('.').ok_or_else(|| {
        MigrateError::discovery(file_name, "missing direction suffix (.up or .down)")
    })?;
    let direction = match suffix {
        "up" => Direction::Up,
        "down" => Direction::Down,
        other => {
            return Err(MigrateError::discovery(
                file_name,
                format!("invalid direction '{other}', expected 'up' or 'down'"),
            ));
        }
    };

    Ok(Some(ParsedName {
        version,
        name: name.to_string(),
        direction,
    }))
}

/// Groups file names into a validated set.
fn build_set(
    store: &Arc<dyn FileStore>,
    dir: &Path,
    mut file_names: Vec<String>,
    extension: &str,
) -> Result<MigrationFileSet> {
    let re = filename_regex(extension)?;
    file_names.sort();

    let mut halves: BTreeMap<u64, (Option<MigrationFile>, Option<MigrationFile>)> =
        BTreeMap::new();
    for file_name in file_names {
        let Some(parsed) = parse_file_name(&file_name, &re)? else {
            continue;
        };
        let file = MigrationFile::new(
            Arc::clone(store),
            dir,
            file_name,
            parsed.version,
            parsed.name,
            parsed.direction,
        );
        let entry = halves.entry(file.version).or_default();
        let slot = match file.direction {
            Direction::Up => &mut entry.0,
            Direction::Down => &mut entry.1,
        };
        if let Some(existing) = slot {
            return Err(MigrateError::discovery(
                &file.file_name,
                format!(
                    "duplicate {} script for version {} (also '{}')",
                    file.direction, file.version, existing.file_name
                ),
            ));
        }
        *slot = Some(file);
    }

    let mut pairs = Vec::with_capacity(halves.len());
    for (version, half) in halves {
        match half {
            (Some(up), Some(down)) => pairs.push(MigrationFilePair::new(up, down)?),
            (Some(only), None) | (None, Some(only)) => {
                let missing = match only.direction {
                    Direction::Up => Direction::Down,
                    Direction::Down => Direction::Up,
                };
                return Err(MigrateError::discovery(
                    &only.file_name,
                    format!("version {version} has no {missing} script"),
                ));
            }
            (None, None) => {}
        }
    }

    MigrationFileSet::new(pairs)
}

/// Reads every migration with the given extension from `dir`.
///
/// Files that do not look like migrations for this extension are ignored.
///
/// # Errors
///
/// Returns [`MigrateError::Discovery`] if the directory cannot be listed, a
/// version does not fit in a `u64`, a direction suffix is missing or
/// invalid, a version is duplicated, or a version lacks one of its halves.
pub fn discover(
    store: &Arc<dyn FileStore>,
    dir: &Path,
    extension: &str,
) -> Result<MigrationFileSet> {
    let file_names = store
        .list(dir)
        .map_err(|e| MigrateError::discovery(dir.display().to_string(), e.to_string()))?;
    let set = build_set(store, dir, file_names, extension)?;
    debug!(
        path = %dir.display(),
        count = set.len(),
        last_version = set.last_version(),
        "Discovered migrations"
    );
    Ok(set)
}

/// Zero-pads a version to a multiple of four digits.
#[must_use]
pub fn format_version(version: u64) -> String {
    let digits = version.to_string();
    let width = digits.len().div_ceil(VERSION_WIDTH) * VERSION_WIDTH;
    format!("{digits:0>width$}")
}

/// Writes an empty up/down pair for the next version in `dir`.
///
/// The next version is the highest existing one plus one; versions are never
/// reused. A missing directory counts as empty and is created.
///
/// # Errors
///
/// Fails if the existing files cannot be discovered or the new files cannot
/// be written.
pub fn create(
    store: &Arc<dyn FileStore>,
    dir: &Path,
    name: &str,
    extension: &str,
) -> Result<MigrationFilePair> {
    let file_names = match store.list(dir) {
        Ok(names) => names,
        Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
        Err(e) => {
            return Err(MigrateError::discovery(
                dir.display().to_string(),
                e.to_string(),
            ));
        }
    };
    let existing = build_set(store, dir, file_names, extension)?;

    let version = existing.last_version().checked_add(1).ok_or_else(|| {
        MigrateError::discovery(dir.display().to_string(), "version numbers exhausted")
    })?;
    let prefix = format_version(version);
    let name = name.replace(' ', "_");

    let make = |direction: Direction| {
        MigrationFile::new(
            Arc::clone(store),
            dir,
            format!("{prefix}_{name}.{direction}.{extension}"),
            version,
            name.as_str(),
            direction,
        )
    };
    let up = make(Direction::Up);
    let down = make(Direction::Down);

    store.write(&up.full_path(), b"")?;
    store.write(&down.full_path(), b"")?;

    debug!(version, up = %up.file_name, down = %down.file_name, "Created migration");
    MigrationFilePair::new(up, down)
}

//! On-disk migration store.
//!
//! Enumerates `<14-digit version>[_-]<name>.sql` files in the configured
//! directory and caches parsed migrations keyed by `(mtime, size)` so
//! repeated operations in one process don't re-read unchanged files.

use crate::checksum;
use crate::drivers::AppliedRecord;
use crate::error::{Error, Kind};
use crate::parser::{self, ParsedMigration};
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;
use walkdir::WalkDir;

const FILE_PATTERN: &str = r"^(\d{14})[_-](.+)\.sql$";

/// Re-hash cached entries on every hit and invalidate on mismatch.
pub const PARANOID_CACHE_ENV: &str = "NOMAD_PARANOID_CACHE";

fn file_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(FILE_PATTERN).unwrap())
}

/// A migration file loaded from disk. Immutable once loaded.
#[derive(Debug)]
pub struct MigrationFile {
    pub version: u64,
    pub name: String,
    pub path: PathBuf,
    pub raw: Vec<u8>,
    pub checksum: String,
    pub parsed: ParsedMigration,
}

struct CacheEntry {
    mtime: SystemTime,
    size: u64,
    file: Arc<MigrationFile>,
}

/// Loads and caches migration files from one directory.
pub struct MigrationStore {
    dir: PathBuf,
    cache: HashMap<PathBuf, CacheEntry>,
}

impl MigrationStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        MigrationStore {
            dir: dir.into(),
            cache: HashMap::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// All migration files, ascending by version. A missing directory is an
    /// empty store, not an error.
    pub fn load_all(&mut self) -> Result<Vec<Arc<MigrationFile>>, Error> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut entries: Vec<(u64, String, PathBuf)> = Vec::new();
        for entry in WalkDir::new(&self.dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(Result::ok)
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(file_name) = entry.file_name().to_str() else {
                continue;
            };
            match file_re().captures(file_name) {
                Some(caps) => {
                    // the pattern guarantees 14 digits, which always fit u64
                    let version: u64 = caps[1].parse().unwrap();
                    let name = caps[2].to_string();
                    entries.push((version, name, entry.into_path()));
                }
                None if file_name.ends_with(".sql") => {
                    log::warn!(
                        "file \"{}\" does not adhere to the migration naming convention, \
                         migrations must be named <14-digit version>_<name>.sql",
                        file_name
                    );
                }
                None => {}
            }
        }

        entries.sort_by_key(|(version, _, _)| *version);
        for pair in entries.windows(2) {
            if pair[0].0 == pair[1].0 {
                return Err(Error::new(Kind::RepeatedVersion(pair[0].0)));
            }
        }

        let paranoid = std::env::var(PARANOID_CACHE_ENV).map_or(false, |v| v == "1");
        let mut files = Vec::with_capacity(entries.len());
        for (version, name, path) in entries {
            files.push(self.load_one(version, name, path, paranoid)?);
        }
        Ok(files)
    }

    fn load_one(
        &mut self,
        version: u64,
        name: String,
        path: PathBuf,
        paranoid: bool,
    ) -> Result<Arc<MigrationFile>, Error> {
        let meta = std::fs::metadata(&path)
            .map_err(|e| Error::new(Kind::InvalidMigrationPath(path.clone(), e)))?;
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let size = meta.len();

        if let Some(entry) = self.cache.get(&path) {
            if entry.mtime == mtime && entry.size == size {
                if !paranoid {
                    return Ok(Arc::clone(&entry.file));
                }
                let raw = std::fs::read(&path)
                    .map_err(|e| Error::new(Kind::InvalidMigrationFile(path.clone(), e)))?;
                if checksum::checksum(&raw) == entry.file.checksum {
                    return Ok(Arc::clone(&entry.file));
                }
                log::warn!(
                    "cached migration {} changed on disk without a metadata change, reloading",
                    path.display()
                );
            }
        }

        let raw = std::fs::read(&path)
            .map_err(|e| Error::new(Kind::InvalidMigrationFile(path.clone(), e)))?;
        let text = String::from_utf8(raw.clone()).map_err(|e| {
            Error::new(Kind::InvalidMigrationFile(
                path.clone(),
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            ))
        })?;

        let file = Arc::new(MigrationFile {
            version,
            name,
            checksum: checksum::checksum(&raw),
            parsed: parser::parse(&text),
            raw,
            path: path.clone(),
        });
        self.cache.insert(
            path,
            CacheEntry {
                mtime,
                size,
                file: Arc::clone(&file),
            },
        );
        Ok(file)
    }
}

/// Project the driver's applied rows down to the currently-applied view:
/// rows that have not been rolled back.
pub fn currently_applied(records: &[AppliedRecord]) -> Vec<&AppliedRecord> {
    records
        .iter()
        .filter(|r| r.rolled_back_at.is_none())
        .collect()
}

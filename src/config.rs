use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};

use crate::cli::Cli;
use crate::walker::{DEFAULT_ARCHIVE_EXTENSIONS, default_parallelism};

pub const DB_ENV_VAR: &str = "UNIT_HUNTER_DB";

/// Knobs shared by every query of one scanner.
#[derive(Debug, Clone)]
pub struct ScannerSettings {
    /// Archives with these extensions are opened and walked.
    pub archive_extensions: Vec<String>,
    /// Default branch limit of a walk when the query sets none.
    pub max_parallel_tasks: usize,
    /// Walk only direct children of root directories.
    pub scan_strictly: bool,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            archive_extensions: DEFAULT_ARCHIVE_EXTENSIONS
                .iter()
                .map(|e| e.to_string())
                .collect(),
            max_parallel_tasks: default_parallelism(),
            scan_strictly: false,
        }
    }
}

impl ScannerSettings {
    pub fn with_archive_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.archive_extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_parallel_tasks(mut self, max: usize) -> Self {
        self.max_parallel_tasks = max.max(1);
        self
    }

    pub fn scan_strictly(mut self, strictly: bool) -> Self {
        self.scan_strictly = strictly;
        self
    }
}

pub fn resolve_db_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(p) = cli.db.clone() {
        return Ok(p);
    }

    if let Ok(p) = env::var(DB_ENV_VAR)
        && !p.is_empty()
    {
        return Ok(PathBuf::from(p));
    }

    Ok(unit_hunter_home()?.join("cache.lmdb"))
}

pub fn clear_db(db_path: &Path) -> Result<()> {
    remove_file_if_exists(db_path, "snapshot")?;
    remove_file_if_exists(&lmdb_lock_path(db_path), "snapshot lock")?;
    Ok(())
}

fn unit_hunter_home() -> Result<PathBuf> {
    let base = dirs::data_local_dir()
        .or_else(dirs::cache_dir)
        .or_else(dirs::home_dir)
        .ok_or_else(|| anyhow::anyhow!("Failed to resolve data directory"))?;
    Ok(base.join("unit-hunter"))
}

fn lmdb_lock_path(db_path: &Path) -> PathBuf {
    let mut os = db_path.as_os_str().to_os_string();
    os.push("-lock");
    PathBuf::from(os)
}

fn remove_file_if_exists(path: &Path, kind: &str) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove {kind} file: {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn explicit_db_flag_wins() {
        let cli = Cli::parse_from(["unit-hunter", "--db", "/tmp/x.lmdb", "stats"]);
        assert_eq!(resolve_db_path(&cli).unwrap(), PathBuf::from("/tmp/x.lmdb"));
    }

    #[test]
    fn clear_db_removes_file_and_lock() {
        let mut base = std::env::temp_dir();
        base.push(format!(
            "unit-hunter-config-{}-{}.lmdb",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::write(&base, b"db").unwrap();
        std::fs::write(lmdb_lock_path(&base), b"lock").unwrap();

        clear_db(&base).unwrap();
        assert!(!base.exists());
        assert!(!lmdb_lock_path(&base).exists());
        clear_db(&base).unwrap();
    }

    #[test]
    fn settings_builder() {
        let settings = ScannerSettings::default()
            .with_archive_extensions(["jar"])
            .with_max_parallel_tasks(0)
            .scan_strictly(true);
        assert_eq!(settings.archive_extensions, vec!["jar"]);
        assert_eq!(settings.max_parallel_tasks, 1);
        assert!(settings.scan_strictly);
    }
}

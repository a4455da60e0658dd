//! Snapshots of the PostgreSQL mirror taken with `pg_dump`.
//!
//! Every snapshot writes a dump next to a `<name>.manifest.json` file
//! describing it; listing and cleanup work off the manifests.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::{BackupConfig, TargetConfig};
use crate::core::identifier::qualify_pg;
use crate::error::{Result, SyncError};

const MANIFEST_SUFFIX: &str = ".manifest.json";

/// `pg_dump` output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupFormat {
    /// SQL script.
    Plain,
    /// Compressed archive for `pg_restore`.
    #[default]
    Custom,
    /// One file per table in a directory.
    Directory,
    Tar,
}

impl BackupFormat {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "plain" | "sql" => Ok(BackupFormat::Plain),
            "custom" | "dump" => Ok(BackupFormat::Custom),
            "directory" | "dir" => Ok(BackupFormat::Directory),
            "tar" => Ok(BackupFormat::Tar),
            other => Err(SyncError::Configuration(format!(
                "Invalid backup format '{}'. Valid values: plain, custom, directory, tar",
                other
            ))),
        }
    }

    fn flag(&self) -> &'static str {
        match self {
            BackupFormat::Plain => "p",
            BackupFormat::Custom => "c",
            BackupFormat::Directory => "d",
            BackupFormat::Tar => "t",
        }
    }

    /// File extension including the dot; directories have none.
    pub fn extension(&self) -> &'static str {
        match self {
            BackupFormat::Plain => ".sql",
            BackupFormat::Custom => ".dump",
            BackupFormat::Directory => "",
            BackupFormat::Tar => ".tar",
        }
    }
}

impl std::fmt::Display for BackupFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BackupFormat::Plain => "plain",
            BackupFormat::Custom => "custom",
            BackupFormat::Directory => "directory",
            BackupFormat::Tar => "tar",
        };
        f.write_str(name)
    }
}

/// What to snapshot and how.
#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    pub format: BackupFormat,
    /// Tables to include; empty means the whole database.
    pub tables: Vec<String>,
    /// Operating system whose `pg_dump` executable name to use
    /// (`windows` selects `pg_dump.exe`). Defaults to the current one.
    pub force_os: Option<String>,
    pub schema_only: bool,
    pub data_only: bool,
}

/// Description of one snapshot, stored next to it as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    pub database: String,
    pub format: BackupFormat,
    /// Included tables; empty for a full snapshot.
    pub tables: Vec<String>,
    pub file_path: PathBuf,
    pub size_bytes: u64,
    pub size_in_mb: f64,
    pub created_at: DateTime<Utc>,
}

impl BackupManifest {
    fn manifest_path(&self) -> PathBuf {
        manifest_path_for(&self.file_path)
    }
}

fn manifest_path_for(file: &Path) -> PathBuf {
    let mut name = file
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(MANIFEST_SUFFIX);
    file.with_file_name(name)
}

/// Takes snapshots of the target before destructive operations.
#[async_trait]
pub trait Snapshotter: Send + Sync {
    async fn snapshot(&self, options: &BackupOptions) -> Result<BackupManifest>;
}

/// `{database}_{timestamp}_{tables|full}{ext}`
pub fn backup_file_name(
    database: &str,
    at: DateTime<Utc>,
    partial: bool,
    format: BackupFormat,
) -> String {
    format!(
        "{}_{}_{}{}",
        database,
        at.format("%Y%m%d_%H%M%S"),
        if partial { "tables" } else { "full" },
        format.extension()
    )
}

/// Snapshotter running the `pg_dump` executable.
pub struct PgDumpBackup {
    target: TargetConfig,
    config: BackupConfig,
}

impl PgDumpBackup {
    pub fn new(target: TargetConfig, config: BackupConfig) -> Self {
        Self { target, config }
    }

    fn executable(&self, force_os: Option<&str>) -> PathBuf {
        if let Some(path) = &self.config.pg_dump_path {
            return path.clone();
        }
        let os = force_os.unwrap_or(std::env::consts::OS);
        if os.eq_ignore_ascii_case("windows") {
            PathBuf::from("pg_dump.exe")
        } else {
            PathBuf::from("pg_dump")
        }
    }

    /// Command-line arguments. The password is passed through the
    /// environment, never here.
    pub fn args(&self, options: &BackupOptions, output: &Path) -> Result<Vec<String>> {
        let mut args = vec![
            "-h".to_string(),
            self.target.host.clone(),
            "-p".to_string(),
            self.target.port.to_string(),
            "-U".to_string(),
            self.target.user.clone(),
            "-d".to_string(),
            self.target.database.clone(),
            "-F".to_string(),
            options.format.flag().to_string(),
            "-f".to_string(),
            output.to_string_lossy().into_owned(),
            "--no-password".to_string(),
        ];
        if options.format == BackupFormat::Custom {
            args.push("-Z".to_string());
            args.push("9".to_string());
        }
        if options.schema_only {
            args.push("--schema-only".to_string());
        }
        if options.data_only {
            args.push("--data-only".to_string());
        }
        for table in &options.tables {
            args.push("-t".to_string());
            args.push(qualify_pg(&self.target.schema, table)?);
        }
        Ok(args)
    }
}

#[async_trait]
impl Snapshotter for PgDumpBackup {
    async fn snapshot(&self, options: &BackupOptions) -> Result<BackupManifest> {
        if options.schema_only && options.data_only {
            return Err(SyncError::Backup(
                "schema_only and data_only are mutually exclusive".into(),
            ));
        }

        tokio::fs::create_dir_all(&self.config.directory).await?;

        let created_at = Utc::now();
        let file_path = self.config.directory.join(backup_file_name(
            &self.target.database,
            created_at,
            !options.tables.is_empty(),
            options.format,
        ));

        let exe = self.executable(options.force_os.as_deref());
        let args = self.args(options, &file_path)?;
        info!(
            "Backing up {} ({} format, {}) to {}",
            self.target.database,
            options.format,
            if options.tables.is_empty() {
                "all tables".to_string()
            } else {
                format!("{} tables", options.tables.len())
            },
            file_path.display()
        );

        let mut cmd = Command::new(&exe);
        cmd.args(&args)
            .env("PGPASSWORD", &self.target.password)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if self.target.ssl_mode != "disable" && !self.target.ssl_mode.is_empty() {
            cmd.env("PGSSLMODE", &self.target.ssl_mode);
        }

        let output = cmd.output().await.map_err(|e| {
            SyncError::Backup(format!("could not run {}: {}", exe.display(), e))
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SyncError::Backup(format!(
                "pg_dump exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let size_bytes = path_size(&file_path).await?;
        let manifest = BackupManifest {
            database: self.target.database.clone(),
            format: options.format,
            tables: options.tables.clone(),
            file_path,
            size_bytes,
            size_in_mb: size_bytes as f64 / (1024.0 * 1024.0),
            created_at,
        };
        write_manifest(&manifest).await?;

        info!(
            "Backup complete: {} ({:.2} MB)",
            manifest.file_path.display(),
            manifest.size_in_mb
        );
        Ok(manifest)
    }
}

/// Size of a file, or of the files directly inside a directory.
async fn path_size(path: &Path) -> Result<u64> {
    let meta = tokio::fs::metadata(path).await?;
    if !meta.is_dir() {
        return Ok(meta.len());
    }
    let mut total = 0;
    let mut entries = tokio::fs::read_dir(path).await?;
    while let Some(entry) = entries.next_entry().await? {
        total += entry.metadata().await?.len();
    }
    Ok(total)
}

pub async fn write_manifest(manifest: &BackupManifest) -> Result<()> {
    let json = serde_json::to_string_pretty(manifest)?;
    tokio::fs::write(manifest.manifest_path(), json).await?;
    Ok(())
}

/// Manifests found in `dir`, newest first. Unreadable manifests are skipped.
pub async fn list_backups(dir: &Path) -> Result<Vec<BackupManifest>> {
    let mut manifests = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(manifests),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_manifest = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.ends_with(MANIFEST_SUFFIX))
            .unwrap_or(false);
        if !is_manifest {
            continue;
        }
        let parsed = tokio::fs::read_to_string(&path)
            .await
            .map_err(SyncError::from)
            .and_then(|s| serde_json::from_str::<BackupManifest>(&s).map_err(SyncError::from));
        match parsed {
            Ok(m) => manifests.push(m),
            Err(e) => warn!("Skipping unreadable manifest {}: {}", path.display(), e),
        }
    }

    manifests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(manifests)
}

/// Remove a snapshot and its manifest.
pub async fn delete_backup(manifest: &BackupManifest) -> Result<()> {
    match tokio::fs::metadata(&manifest.file_path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&manifest.file_path).await?,
        Ok(_) => tokio::fs::remove_file(&manifest.file_path).await?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("{} already gone", manifest.file_path.display())
        }
        Err(e) => return Err(e.into()),
    }
    match tokio::fs::remove_file(manifest.manifest_path()).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Keep the `keep` newest snapshots in `dir`. Returns how many were removed.
pub async fn cleanup_old_backups(dir: &Path, keep: usize) -> Result<usize> {
    let manifests = list_backups(dir).await?;
    let mut removed = 0;
    for manifest in manifests.iter().skip(keep) {
        delete_backup(manifest).await?;
        removed += 1;
    }
    if removed > 0 {
        info!("Removed {} old backup(s) from {}", removed, dir.display());
    }
    Ok(removed)
}

/// Snapshot, then prune `config.directory` to the `config.keep` newest
/// snapshots. The new snapshot always survives; a failed prune only warns.
pub async fn snapshot_with_retention(
    snapshotter: &dyn Snapshotter,
    options: &BackupOptions,
    config: &BackupConfig,
) -> Result<BackupManifest> {
    let manifest = snapshotter.snapshot(options).await?;
    if let Err(e) = cleanup_old_backups(&config.directory, config.keep.max(1)).await {
        warn!(
            "Backup written but pruning {} failed: {}",
            config.directory.display(),
            e
        );
    }
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn target() -> TargetConfig {
        TargetConfig {
            host: "pg-mirror".into(),
            port: 5432,
            database: "ebp_mirror".into(),
            user: "sync".into(),
            password: "secret".into(),
            schema: "public".into(),
            ssl_mode: "disable".into(),
        }
    }

    async fn fake_backup(dir: &Path, secs: i64) -> BackupManifest {
        let at = Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();
        let file_path = dir.join(backup_file_name("ebp_mirror", at, false, BackupFormat::Custom));
        tokio::fs::write(&file_path, b"PGDMP").await.unwrap();
        let manifest = BackupManifest {
            database: "ebp_mirror".into(),
            format: BackupFormat::Custom,
            tables: vec![],
            file_path,
            size_bytes: 5,
            size_in_mb: 5.0 / (1024.0 * 1024.0),
            created_at: at,
        };
        write_manifest(&manifest).await.unwrap();
        manifest
    }

    #[test]
    fn test_format_parse_and_extension() {
        assert_eq!(BackupFormat::parse("SQL").unwrap(), BackupFormat::Plain);
        assert_eq!(BackupFormat::parse("custom").unwrap().extension(), ".dump");
        assert_eq!(BackupFormat::Directory.extension(), "");
        assert!(BackupFormat::parse("zip").is_err());
        assert_eq!(BackupFormat::default(), BackupFormat::Custom);
    }

    #[test]
    fn test_file_name() {
        let at = Utc.with_ymd_and_hms(2024, 5, 17, 14, 3, 9).unwrap();
        assert_eq!(
            backup_file_name("ebp_mirror", at, true, BackupFormat::Tar),
            "ebp_mirror_20240517_140309_tables.tar"
        );
        assert_eq!(
            backup_file_name("ebp_mirror", at, false, BackupFormat::Directory),
            "ebp_mirror_20240517_140309_full"
        );
    }

    #[test]
    fn test_args_never_carry_password() {
        let backup = PgDumpBackup::new(target(), BackupConfig::default());
        let options = BackupOptions {
            tables: vec!["Customer".into()],
            ..Default::default()
        };
        let args = backup.args(&options, Path::new("/tmp/out.dump")).unwrap();
        assert!(!args.iter().any(|a| a.contains("secret")));
        assert!(args.windows(2).any(|w| w == ["-F", "c"]));
        assert!(args.windows(2).any(|w| w == ["-Z", "9"]));
        assert!(args
            .windows(2)
            .any(|w| w == ["-t", "\"public\".\"Customer\""]));
    }

    #[test]
    fn test_executable_for_os() {
        let backup = PgDumpBackup::new(target(), BackupConfig::default());
        assert_eq!(backup.executable(Some("windows")), PathBuf::from("pg_dump.exe"));
        assert_eq!(backup.executable(Some("linux")), PathBuf::from("pg_dump"));

        let config = BackupConfig {
            pg_dump_path: Some(PathBuf::from("/opt/pg/bin/pg_dump")),
            ..Default::default()
        };
        let backup = PgDumpBackup::new(target(), config);
        assert_eq!(
            backup.executable(Some("windows")),
            PathBuf::from("/opt/pg/bin/pg_dump")
        );
    }

    #[tokio::test]
    async fn test_list_newest_first_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        for secs in [0, 60, 120] {
            fake_backup(dir.path(), secs).await;
        }
        tokio::fs::write(dir.path().join("broken.manifest.json"), "{")
            .await
            .unwrap();

        let listed = list_backups(dir.path()).await.unwrap();
        assert_eq!(listed.len(), 3);
        assert!(listed[0].created_at > listed[1].created_at);

        let removed = cleanup_old_backups(dir.path(), 1).await.unwrap();
        assert_eq!(removed, 2);
        let left = list_backups(dir.path()).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0], listed[0]);
        assert!(!listed[2].file_path.exists());
    }

    /// Writes a fake dump one minute after the previous one.
    struct FakeDump {
        dir: PathBuf,
        taken: std::sync::atomic::AtomicI64,
    }

    #[async_trait]
    impl Snapshotter for FakeDump {
        async fn snapshot(&self, _options: &BackupOptions) -> Result<BackupManifest> {
            let n = self
                .taken
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(fake_backup(&self.dir, n * 60).await)
        }
    }

    #[tokio::test]
    async fn test_snapshot_with_retention_keeps_configured_count() {
        let dir = tempfile::tempdir().unwrap();
        let config = BackupConfig {
            directory: dir.path().to_path_buf(),
            ..Default::default()
        };
        assert_eq!(config.keep, 10);
        let dumps = FakeDump {
            dir: dir.path().to_path_buf(),
            taken: Default::default(),
        };

        let mut last = None;
        for _ in 0..12 {
            last = Some(
                snapshot_with_retention(&dumps, &BackupOptions::default(), &config)
                    .await
                    .unwrap(),
            );
        }

        let listed = list_backups(dir.path()).await.unwrap();
        assert_eq!(listed.len(), 10);
        assert_eq!(Some(&listed[0]), last.as_ref());
        assert!(listed[0].file_path.exists());
    }

    #[tokio::test]
    async fn test_retention_never_removes_new_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let config = BackupConfig {
            directory: dir.path().to_path_buf(),
            keep: 0,
            ..Default::default()
        };
        let dumps = FakeDump {
            dir: dir.path().to_path_buf(),
            taken: Default::default(),
        };
        snapshot_with_retention(&dumps, &BackupOptions::default(), &config)
            .await
            .unwrap();
        let manifest = snapshot_with_retention(&dumps, &BackupOptions::default(), &config)
            .await
            .unwrap();

        let listed = list_backups(dir.path()).await.unwrap();
        assert_eq!(listed, vec![manifest]);
    }

    #[tokio::test]
    async fn test_list_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let listed = list_backups(&dir.path().join("nope")).await.unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn test_failing_pg_dump_is_backup_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = BackupConfig {
            directory: dir.path().to_path_buf(),
            pg_dump_path: Some(dir.path().join("no-such-pg_dump")),
            ..Default::default()
        };
        let err = PgDumpBackup::new(target(), config)
            .snapshot(&BackupOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Backup(_)));
        assert!(err.is_fatal());
    }
}

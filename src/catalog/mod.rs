//! Installed-application catalog: app id -> display name.
//!
//! Persisted as a two-column CSV (`app_id,app_name`) that is only ever
//! appended to. Population resolves names one package at a time and appends
//! each entry as soon as it is known, so an interrupted run keeps its work.
//! A `.complete` marker beside the CSV records that a run listed and indexed
//! every package; until it exists, later connects resume the build.

use crate::executor::ActionError;
use crate::model::CatalogEntry;
use async_trait::async_trait;
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;

pub const NOT_FOUND: &str = "Not Found";
pub const PULL_FAILED: &str = "Pull Failed";
pub const UNKNOWN: &str = "Unknown";

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("catalog csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("package listing failed: {0}")]
    Listing(#[from] ActionError),
}

/// Device-side package queries used to build the catalog.
#[async_trait]
pub trait PackageInspector: Send + Sync {
    async fn list_packages(&self, third_party_only: bool) -> Result<Vec<String>, ActionError>;
    async fn application_label(&self, app_id: &str) -> Result<Option<String>, ActionError>;
    async fn apk_path(&self, app_id: &str) -> Result<Option<String>, ActionError>;
    async fn pull_apk(&self, remote_path: &str, local_path: &Path) -> Result<(), ActionError>;
    async fn badging_label(&self, local_path: &Path) -> Result<Option<String>, ActionError>;
}

#[derive(Debug, Default)]
struct Entries {
    rows: Vec<CatalogEntry>,
    ids: HashSet<String>,
}

#[derive(Debug)]
pub struct Catalog {
    path: PathBuf,
    entries: RwLock<Entries>,
    populating: AtomicBool,
    complete: AtomicBool,
}

impl Catalog {
    /// Opens the catalog at `path`, loading any rows already persisted.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CatalogError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut entries = Entries::default();
        if path.exists() {
            let mut reader = csv::Reader::from_path(&path)?;
            for row in reader.deserialize::<CatalogEntry>() {
                let entry = row?;
                if entries.ids.insert(entry.app_id.clone()) {
                    entries.rows.push(entry);
                }
            }
        }
        let complete = marker_path(&path).exists();
        tracing::info!(
            path = %path.display(),
            entries = entries.rows.len(),
            complete,
            "catalog opened"
        );

        Ok(Self {
            path,
            entries: RwLock::new(entries),
            populating: AtomicBool::new(false),
            complete: AtomicBool::new(complete),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.read().rows.len()
    }

    /// A catalog counts as loaded once it holds at least one entry.
    pub fn is_loaded(&self) -> bool {
        !self.read().rows.is_empty()
    }

    /// Whether a population run has finished listing every package.
    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }

    pub fn is_populating(&self) -> bool {
        self.populating.load(Ordering::SeqCst)
    }

    /// True while nothing is loaded or a run is still adding entries.
    pub fn is_building(&self) -> bool {
        self.is_populating() || !self.is_loaded()
    }

    fn mark_complete(&self) -> Result<(), CatalogError> {
        fs::write(marker_path(&self.path), b"")?;
        self.complete.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn contains(&self, app_id: &str) -> bool {
        self.read().ids.contains(app_id)
    }

    /// Entries in insertion order, or `None` while nothing is loaded yet.
    pub fn snapshot(&self) -> Option<Vec<CatalogEntry>> {
        let entries = self.read();
        if entries.rows.is_empty() {
            None
        } else {
            Some(entries.rows.clone())
        }
    }

    pub fn get(&self, app_id: &str) -> Option<CatalogEntry> {
        self.read()
            .rows
            .iter()
            .find(|entry| entry.app_id == app_id)
            .cloned()
    }

    /// Adds `entry` unless its app id is already present. Returns whether a
    /// row was written.
    pub fn append(&self, entry: CatalogEntry) -> Result<bool, CatalogError> {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if entries.ids.contains(&entry.app_id) {
            return Ok(false);
        }

        let needs_header = fs::metadata(&self.path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(needs_header)
            .from_writer(file);
        writer.serialize(&entry)?;
        writer.flush()?;

        entries.ids.insert(entry.app_id.clone());
        entries.rows.push(entry);
        Ok(true)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Entries> {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn begin_population(self: &Arc<Self>) -> Option<PopulationGuard> {
        if self.populating.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(PopulationGuard {
            catalog: Arc::clone(self),
        })
    }
}

fn marker_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".complete");
    PathBuf::from(name)
}

struct PopulationGuard {
    catalog: Arc<Catalog>,
}

impl Drop for PopulationGuard {
    fn drop(&mut self) {
        self.catalog.populating.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct PopulationOptions {
    /// Scratch directory for pulled APKs.
    pub work_dir: PathBuf,
    pub deadline: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopulationEnd {
    Completed,
    DeadlineReached,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PopulationReport {
    pub listed: usize,
    pub added: usize,
    pub end: PopulationEnd,
}

/// Resolves a display name for one package, falling back through the device
/// label, the APK badging, and finally a placeholder name.
pub async fn resolve_label(
    inspector: &dyn PackageInspector,
    app_id: &str,
    work_dir: &Path,
) -> String {
    match inspector.application_label(app_id).await {
        Ok(Some(label)) => return label,
        Ok(None) => {}
        Err(err) => tracing::debug!(app_id, error = %err, "label lookup failed"),
    }

    let remote = match inspector.apk_path(app_id).await {
        Ok(Some(path)) => path,
        Ok(None) => return NOT_FOUND.to_string(),
        Err(err) => {
            tracing::debug!(app_id, error = %err, "apk path lookup failed");
            return NOT_FOUND.to_string();
        }
    };

    let local = work_dir.join(format!("{app_id}.apk"));
    if let Err(err) = inspector.pull_apk(&remote, &local).await {
        tracing::debug!(app_id, error = %err, "apk pull failed");
        return PULL_FAILED.to_string();
    }

    let label = match inspector.badging_label(&local).await {
        Ok(Some(label)) => label,
        Ok(None) => UNKNOWN.to_string(),
        Err(err) => {
            tracing::debug!(app_id, error = %err, "badging lookup failed");
            UNKNOWN.to_string()
        }
    };
    let _ = fs::remove_file(&local);
    label
}

/// Adds every installed package missing from `catalog`.
///
/// Stops early at `options.deadline` or when `shutdown` flips to true; rows
/// appended before that point stay in the catalog.
pub async fn populate(
    catalog: &Catalog,
    inspector: &dyn PackageInspector,
    options: &PopulationOptions,
    mut shutdown: watch::Receiver<bool>,
) -> Result<PopulationReport, CatalogError> {
    let packages = inspector.list_packages(false).await?;
    let listed = packages.len();

    let mut seen = HashSet::new();
    let pending: Vec<String> = packages
        .into_iter()
        .filter(|app_id| !catalog.contains(app_id) && seen.insert(app_id.clone()))
        .collect();
    if pending.is_empty() {
        catalog.mark_complete()?;
        return Ok(PopulationReport {
            listed,
            added: 0,
            end: PopulationEnd::Completed,
        });
    }

    fs::create_dir_all(&options.work_dir)?;
    tracing::info!(pending = pending.len(), "catalog population started");

    let mut added = 0usize;
    let work = async {
        for app_id in &pending {
            let app_name = resolve_label(inspector, app_id, &options.work_dir).await;
            let entry = CatalogEntry {
                app_id: app_id.clone(),
                app_name,
            };
            if catalog.append(entry)? {
                added += 1;
            }
        }
        Ok::<(), CatalogError>(())
    };

    let end = tokio::select! {
        res = work => {
            res?;
            PopulationEnd::Completed
        }
        _ = tokio::time::sleep(options.deadline) => PopulationEnd::DeadlineReached,
        _ = shutdown_requested(&mut shutdown) => PopulationEnd::Cancelled,
    };

    if end == PopulationEnd::Completed {
        catalog.mark_complete()?;
    }
    tracing::info!(added, ?end, "catalog population finished");
    Ok(PopulationReport { listed, added, end })
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Starts background population unless a previous run completed or one is in
/// progress. A run cut short resumes with the packages still missing. Returns
/// whether a run was started.
pub fn spawn_population(
    catalog: Arc<Catalog>,
    inspector: Arc<dyn PackageInspector>,
    options: PopulationOptions,
    shutdown: watch::Receiver<bool>,
) -> bool {
    if catalog.is_complete() {
        return false;
    }
    let Some(guard) = catalog.begin_population() else {
        return false;
    };
    tokio::spawn(async move {
        let _guard = guard;
        match populate(&catalog, inspector.as_ref(), &options, shutdown).await {
            Ok(report) => tracing::debug!(
                listed = report.listed,
                added = report.added,
                end = ?report.end,
                "catalog population report"
            ),
            Err(err) => tracing::warn!(error = %err, "catalog population failed"),
        }
    });
    true
}

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

use super::data::{
    AssetId, AssetKind, AssetRecord, ChildEntry, CommitResult, Companion, DiffSet, FolderId, FolderNode,
    IndexSnapshot, LibraryStats, ObservedFile, SnapshotEntry, ThumbnailRef,
};
use crate::error::{HubError, Result};
use crate::scan::hasher::Fingerprint;
use crate::thumb::store::{CacheKey, ThumbnailSource};

const ASSET_COLUMNS: &str = "id, folder_id, path, file_name, kind, size, modified_ns, content_hash, \
     companion_path, companion_size, companion_modified_ns, companion_hash, \
     thumbnail_key, thumbnail_source, comment, tags, created_at, updated_at";

const FOLDER_COLUMNS: &str = "id, parent_id, name, path, last_scanned_at";

/// The AssetIndex manages the SQLite database of folders and assets.
///
/// It is the single source of truth for tree and grid views. Writes go
/// through one connection inside transactions, reads through another, so a
/// reader sees the state before or after a commit, never half of one.
pub struct AssetIndex {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    db_path: PathBuf,
}

impl AssetIndex {
    /// Open or create the index database at `db_path`.
    ///
    /// Uses WAL journaling and no exclusive locks, so a crashed process
    /// never leaves the file unopenable.
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();

        // Ensure the parent directory exists
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| HubError::io(parent, e))?;
            }
        }

        let writer = Connection::open(&db_path)?;
        configure(&writer)?;
        init_schema(&writer)?;

        let reader = Connection::open(&db_path)?;
        configure(&reader)?;

        info!("Asset index opened at: {}", db_path.display());

        Ok(AssetIndex {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            db_path,
        })
    }

    /// Close both connections, flushing the WAL
    pub fn close(self) -> Result<()> {
        let reader = self.reader.into_inner().map_err(|_| HubError::LockPoisoned)?;
        reader.close().map_err(|(_, e)| HubError::Database(e))?;
        let writer = self.writer.into_inner().map_err(|_| HubError::LockPoisoned)?;
        writer.close().map_err(|(_, e)| HubError::Database(e))?;
        debug!("Asset index closed");
        Ok(())
    }

    /// Get the path to the database file
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn read(&self) -> Result<MutexGuard<'_, Connection>> {
        self.reader.lock().map_err(|_| HubError::LockPoisoned)
    }

    fn write(&self) -> Result<MutexGuard<'_, Connection>> {
        self.writer.lock().map_err(|_| HubError::LockPoisoned)
    }

    /// Apply a scan diff in one transaction. Either every change lands or
    /// none does; any failure is reported as `HubError::IndexCommit`.
    pub fn apply_diff(&self, diff: &DiffSet) -> Result<CommitResult> {
        self.apply_batch(std::slice::from_ref(diff))
    }

    /// Apply the diffs of several roots in one transaction
    pub fn apply_batch(&self, diffs: &[DiffSet]) -> Result<CommitResult> {
        let mut conn = self.write()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(HubError::IndexCommit)?;

        let now = Utc::now().timestamp_millis();
        let mut total = CommitResult::default();
        let mut changed = BTreeSet::new();
        for diff in diffs {
            let result = apply_in(&tx, diff, now).map_err(HubError::IndexCommit)?;
            total.added += result.added;
            total.updated += result.updated;
            total.removed += result.removed;
            total.folders_created += result.folders_created;
            total.folders_pruned += result.folders_pruned;
            changed.extend(result.changed_folders);
        }
        tx.commit().map_err(HubError::IndexCommit)?;
        total.changed_folders = changed.into_iter().collect();

        debug!(
            "Committed {} diff(s): {} added, {} updated, {} removed, {} folders pruned",
            diffs.len(),
            total.added,
            total.updated,
            total.removed,
            total.folders_pruned
        );
        Ok(total)
    }

    /// Every asset under `root`, keyed by path
    pub fn snapshot(&self, root: &Path) -> Result<IndexSnapshot> {
        let conn = self.read()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ASSET_COLUMNS} FROM assets WHERE removed_at IS NULL AND (path = ?1 OR path LIKE ?2 ESCAPE '\\')"
        ))?;

        let mut snapshot = IndexSnapshot::default();
        let rows = stmt.query_map(params![path_str(root), like_prefix(root)], asset_from_row)?;
        for asset in rows {
            let asset = asset?;
            if asset.path.starts_with(root) {
                snapshot.entries.insert(
                    asset.path,
                    SnapshotEntry {
                        fingerprint: asset.fingerprint,
                        companion: asset.companion,
                    },
                );
            }
        }
        Ok(snapshot)
    }

    /// Library roots, ordered by path
    pub fn list_roots(&self) -> Result<Vec<FolderNode>> {
        let conn = self.read()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {FOLDER_COLUMNS} FROM folders WHERE parent_id IS NULL ORDER BY path"
        ))?;
        let roots = stmt.query_map([], folder_from_row)?.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(roots)
    }

    /// Direct children of a folder: sub-folders first, then assets, each
    /// sorted by name case-insensitively
    pub fn list_children(&self, folder_id: FolderId) -> Result<Vec<ChildEntry>> {
        let conn = self.read()?;

        let mut folders = conn.prepare(&format!(
            "SELECT {FOLDER_COLUMNS} FROM folders WHERE parent_id = ?1 ORDER BY name COLLATE NOCASE, name"
        ))?;
        let mut children: Vec<ChildEntry> = folders
            .query_map([folder_id], folder_from_row)?
            .map(|folder| folder.map(ChildEntry::Folder))
            .collect::<rusqlite::Result<_>>()?;

        let mut assets = conn.prepare(&format!(
            "SELECT {ASSET_COLUMNS} FROM assets WHERE folder_id = ?1 AND removed_at IS NULL \
             ORDER BY file_name COLLATE NOCASE, file_name"
        ))?;
        for asset in assets.query_map([folder_id], asset_from_row)? {
            children.push(ChildEntry::Asset(asset?));
        }

        Ok(children)
    }

    /// Flat view: every asset in a folder and all of its descendants
    pub fn list_assets_recursive(&self, folder_id: FolderId) -> Result<Vec<AssetRecord>> {
        let conn = self.read()?;
        let mut stmt = conn.prepare(&format!(
            "WITH RECURSIVE subtree(id) AS (
                 SELECT ?1
                 UNION ALL
                 SELECT f.id FROM folders f JOIN subtree s ON f.parent_id = s.id
             )
             SELECT {ASSET_COLUMNS} FROM assets
             WHERE folder_id IN (SELECT id FROM subtree) AND removed_at IS NULL
             ORDER BY file_name COLLATE NOCASE, path"
        ))?;
        let assets = stmt.query_map([folder_id], asset_from_row)?.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(assets)
    }

    pub fn get_folder(&self, folder_id: FolderId) -> Result<Option<FolderNode>> {
        let conn = self.read()?;
        let folder = conn
            .query_row(
                &format!("SELECT {FOLDER_COLUMNS} FROM folders WHERE id = ?1"),
                [folder_id],
                folder_from_row,
            )
            .optional()?;
        Ok(folder)
    }

    pub fn find_folder_by_path(&self, path: &Path) -> Result<Option<FolderNode>> {
        let conn = self.read()?;
        let folder = conn
            .query_row(
                &format!("SELECT {FOLDER_COLUMNS} FROM folders WHERE path = ?1"),
                [path_str(path)],
                folder_from_row,
            )
            .optional()?;
        Ok(folder)
    }

    pub fn get_asset(&self, asset_id: AssetId) -> Result<Option<AssetRecord>> {
        let conn = self.read()?;
        let asset = conn
            .query_row(
                &format!("SELECT {ASSET_COLUMNS} FROM assets WHERE id = ?1 AND removed_at IS NULL"),
                [asset_id],
                asset_from_row,
            )
            .optional()?;
        Ok(asset)
    }

    pub fn find_by_path(&self, path: &Path) -> Result<Option<AssetRecord>> {
        let conn = self.read()?;
        let asset = conn
            .query_row(
                &format!("SELECT {ASSET_COLUMNS} FROM assets WHERE path = ?1 AND removed_at IS NULL LIMIT 1"),
                [path_str(path)],
                asset_from_row,
            )
            .optional()?;
        Ok(asset)
    }

    /// Point an asset at a (re)generated thumbnail
    pub fn set_thumbnail(&self, asset_id: AssetId, thumbnail: &ThumbnailRef) -> Result<bool> {
        let conn = self.write()?;
        let changed = conn.execute(
            "UPDATE assets SET thumbnail_key = ?1, thumbnail_source = ?2 WHERE id = ?3",
            params![thumbnail.key.as_str(), thumbnail.source.as_str(), asset_id],
        )?;
        Ok(changed > 0)
    }

    /// Remove a folder with every descendant folder and asset.
    /// Returns the number of assets removed.
    pub fn remove_folder(&self, folder_id: FolderId) -> Result<usize> {
        let mut conn = self.write()?;
        let tx = conn.transaction()?;
        let removed: i64 = tx.query_row(
            "WITH RECURSIVE subtree(id) AS (
                 SELECT ?1
                 UNION ALL
                 SELECT f.id FROM folders f JOIN subtree s ON f.parent_id = s.id
             )
             SELECT COUNT(*) FROM assets WHERE folder_id IN (SELECT id FROM subtree)",
            [folder_id],
            |row| row.get(0),
        )?;
        // Foreign keys cascade to sub-folders and assets
        tx.execute("DELETE FROM folders WHERE id = ?1", [folder_id])?;
        tx.commit()?;

        info!("Removed folder {folder_id} with {removed} assets");
        Ok(removed as usize)
    }

    /// Search assets by file name (substring, case-insensitive), newest first
    pub fn search_assets(&self, keyword: &str, limit: usize) -> Result<Vec<AssetRecord>> {
        let conn = self.read()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ASSET_COLUMNS} FROM assets
             WHERE file_name LIKE ?1 ESCAPE '\\' AND removed_at IS NULL
             ORDER BY modified_ns DESC
             LIMIT ?2"
        ))?;
        let pattern = format!("%{}%", escape_like(keyword));
        let assets = stmt
            .query_map(params![pattern, limit as i64], asset_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(assets)
    }

    /// Update an asset's comment and/or tags. `None` leaves a field as is.
    pub fn update_metadata(&self, asset_id: AssetId, comment: Option<&str>, tags: Option<&[String]>) -> Result<bool> {
        if comment.is_none() && tags.is_none() {
            return Ok(false);
        }
        let conn = self.write()?;
        let changed = conn.execute(
            "UPDATE assets SET
                 comment = COALESCE(?1, comment),
                 tags = COALESCE(?2, tags),
                 updated_at = ?3
             WHERE id = ?4",
            params![comment, tags.map(join_tags), Utc::now().timestamp_millis(), asset_id],
        )?;
        Ok(changed > 0)
    }

    /// Get a count of assets in the index
    pub fn count_assets(&self) -> Result<i64> {
        let conn = self.read()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM assets WHERE removed_at IS NULL", [], |row| {
            row.get(0)
        })?;
        Ok(count)
    }

    pub fn statistics(&self) -> Result<LibraryStats> {
        let conn = self.read()?;
        let total_assets: i64 =
            conn.query_row("SELECT COUNT(*) FROM assets WHERE removed_at IS NULL", [], |row| row.get(0))?;
        let assets_with_thumbnail: i64 = conn.query_row(
            "SELECT COUNT(*) FROM assets WHERE removed_at IS NULL AND thumbnail_key IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        let folders: i64 = conn.query_row("SELECT COUNT(*) FROM folders", [], |row| row.get(0))?;

        let mut per_extension: HashMap<String, i64> = HashMap::new();
        let mut stmt = conn.prepare("SELECT file_name FROM assets WHERE removed_at IS NULL")?;
        for name in stmt.query_map([], |row| row.get::<_, String>(0))? {
            let ext = super::data::extension_of(Path::new(&name?));
            let ext = if ext.is_empty() { "unknown".to_string() } else { ext };
            *per_extension.entry(ext).or_default() += 1;
        }
        let mut assets_by_extension: Vec<(String, i64)> = per_extension.into_iter().collect();
        assets_by_extension.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        Ok(LibraryStats {
            total_assets,
            assets_with_thumbnail,
            folders,
            assets_by_extension,
        })
    }

    /// Store a small application setting (e.g. the last opened root)
    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.write()?;
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.read()?;
        let value = conn
            .query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }
}

// Implement Debug for better error messages
impl std::fmt::Debug for AssetIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetIndex").field("db_path", &self.db_path).finish()
    }
}

fn configure(conn: &Connection) -> rusqlite::Result<()> {
    conn.busy_timeout(Duration::from_secs(30))?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    // WAL gives readers a stable snapshot while the writer commits
    let _mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(())
}

/// Initialize the database schema.
/// Creates all necessary tables and indexes if they don't exist.
fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    // Folder tree, one row per directory that holds assets (plus roots)
    conn.execute(
        "CREATE TABLE IF NOT EXISTS folders (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            parent_id       INTEGER REFERENCES folders(id) ON DELETE CASCADE,
            name            TEXT NOT NULL,
            path            TEXT NOT NULL UNIQUE,
            last_scanned_at INTEGER
        )",
        [],
    )?;

    // Assets, owned by exactly one folder
    conn.execute(
        "CREATE TABLE IF NOT EXISTS assets (
            id                    INTEGER PRIMARY KEY AUTOINCREMENT,
            folder_id             INTEGER NOT NULL REFERENCES folders(id) ON DELETE CASCADE,
            path                  TEXT NOT NULL,
            file_name             TEXT NOT NULL,
            kind                  TEXT NOT NULL,
            size                  INTEGER NOT NULL,
            modified_ns           INTEGER NOT NULL,
            content_hash          TEXT,
            companion_path        TEXT,
            companion_size        INTEGER,
            companion_modified_ns INTEGER,
            companion_hash        TEXT,
            thumbnail_key         TEXT,
            thumbnail_source      TEXT,
            comment               TEXT NOT NULL DEFAULT '',
            tags                  TEXT NOT NULL DEFAULT '',
            removed_at            INTEGER,
            created_at            INTEGER NOT NULL,
            updated_at            INTEGER NOT NULL,
            UNIQUE(folder_id, path)
        )",
        [],
    )?;

    // Key-value settings
    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings (
            key             TEXT PRIMARY KEY,
            value           TEXT
        )",
        [],
    )?;

    // Create indexes for fast queries
    conn.execute("CREATE INDEX IF NOT EXISTS idx_folders_parent ON folders(parent_id)", [])?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_assets_path ON assets(path)", [])?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_assets_file_name ON assets(file_name)", [])?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_assets_modified ON assets(modified_ns)", [])?;

    debug!("Database schema initialized");
    Ok(())
}

/// Body of `apply_diff`, run inside the transaction
fn apply_in(tx: &Transaction<'_>, diff: &DiffSet, now: i64) -> rusqlite::Result<CommitResult> {
    let mut result = CommitResult::default();
    let mut folders: HashMap<PathBuf, FolderId> = HashMap::new();
    let mut changed: BTreeSet<FolderId> = BTreeSet::new();

    let root_id = ensure_folder(tx, &diff.root, &mut folders, &mut result, &mut changed)?;

    for (file, is_new) in diff
        .added
        .iter()
        .map(|file| (file, true))
        .chain(diff.updated.iter().map(|file| (file, false)))
    {
        // Every asset must live under the scanned root
        let parent = match file.path.parent() {
            Some(parent) if file.path.starts_with(&diff.root) && file.path != diff.root => parent,
            _ => return Err(rusqlite::Error::InvalidPath(file.path.clone())),
        };
        let folder_id = ensure_folder(tx, parent, &mut folders, &mut result, &mut changed)?;
        upsert_asset(tx, folder_id, file, now)?;
        changed.insert(folder_id);
        if is_new {
            result.added += 1;
        } else {
            result.updated += 1;
        }
    }

    // Tombstone first, then sweep
    for path in &diff.removed {
        let folder_id: Option<FolderId> = tx
            .query_row(
                "UPDATE assets SET removed_at = ?1 WHERE path = ?2 AND removed_at IS NULL RETURNING folder_id",
                params![now, path_str(path)],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(folder_id) = folder_id {
            changed.insert(folder_id);
        }
    }
    result.removed = tx.execute("DELETE FROM assets WHERE removed_at IS NOT NULL", [])?;

    // Prune folders left empty, bottom-up. Roots stay.
    loop {
        let empty: Vec<(FolderId, FolderId)> = {
            let mut stmt = tx.prepare(
                "SELECT id, parent_id FROM folders f
                 WHERE parent_id IS NOT NULL
                   AND NOT EXISTS (SELECT 1 FROM assets a WHERE a.folder_id = f.id)
                   AND NOT EXISTS (SELECT 1 FROM folders c WHERE c.parent_id = f.id)",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        if empty.is_empty() {
            break;
        }
        for (id, parent_id) in empty {
            tx.execute("DELETE FROM folders WHERE id = ?1", [id])?;
            changed.remove(&id);
            changed.insert(parent_id);
            result.folders_pruned += 1;
        }
    }

    tx.execute(
        "WITH RECURSIVE subtree(id) AS (
             SELECT ?1
             UNION ALL
             SELECT f.id FROM folders f JOIN subtree s ON f.parent_id = s.id
         )
         UPDATE folders SET last_scanned_at = ?2 WHERE id IN (SELECT id FROM subtree)",
        params![root_id, now],
    )?;

    // Only report folders that still exist
    result.changed_folders = changed
        .into_iter()
        .filter(|id| {
            tx.query_row("SELECT 1 FROM folders WHERE id = ?1", [id], |_| Ok(()))
                .optional()
                .map(|found| found.is_some())
                .unwrap_or(false)
        })
        .collect();
    Ok(result)
}

/// Find or create the folder for `dir`, creating missing ancestors down
/// from the nearest existing one. A directory with no indexed ancestor
/// becomes a new root; existing roots below it become its descendants.
fn ensure_folder(
    tx: &Transaction<'_>,
    dir: &Path,
    folders: &mut HashMap<PathBuf, FolderId>,
    result: &mut CommitResult,
    changed: &mut BTreeSet<FolderId>,
) -> rusqlite::Result<FolderId> {
    if let Some(&id) = folders.get(dir) {
        return Ok(id);
    }
    if let Some(id) = folder_id_at(tx, dir)? {
        folders.insert(dir.to_path_buf(), id);
        return Ok(id);
    }

    let mut has_indexed_ancestor = false;
    for ancestor in dir.ancestors().skip(1) {
        if folders.contains_key(ancestor) || folder_id_at(tx, ancestor)?.is_some() {
            has_indexed_ancestor = true;
            break;
        }
    }
    let parent_id = match dir.parent() {
        Some(parent) if has_indexed_ancestor => Some(ensure_folder(tx, parent, folders, result, changed)?),
        _ => None,
    };

    let name = dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path_str(dir));
    tx.execute(
        "INSERT INTO folders (parent_id, name, path) VALUES (?1, ?2, ?3)",
        params![parent_id, name, path_str(dir)],
    )?;
    let id = tx.last_insert_rowid();

    folders.insert(dir.to_path_buf(), id);
    result.folders_created += 1;
    if let Some(parent_id) = parent_id {
        changed.insert(parent_id);
    }
    adopt_roots_below(tx, dir, folders, result, changed)?;
    Ok(id)
}

/// Hang roots left by earlier scans of a sub-directory under the newly
/// created `dir`, creating the folders in between
fn adopt_roots_below(
    tx: &Transaction<'_>,
    dir: &Path,
    folders: &mut HashMap<PathBuf, FolderId>,
    result: &mut CommitResult,
    changed: &mut BTreeSet<FolderId>,
) -> rusqlite::Result<()> {
    let orphans: Vec<(FolderId, PathBuf)> = {
        let mut stmt = tx.prepare("SELECT id, path FROM folders WHERE parent_id IS NULL AND path LIKE ?1 ESCAPE '\\'")?;
        let rows = stmt.query_map([like_prefix(dir)], |row| {
            Ok((row.get(0)?, PathBuf::from(row.get::<_, String>(1)?)))
        })?;
        rows.collect::<rusqlite::Result<_>>()?
    };

    for (orphan_id, orphan_path) in orphans {
        // LIKE ignores ASCII case
        let parent = match orphan_path.parent() {
            Some(parent) if orphan_path.starts_with(dir) => parent,
            _ => continue,
        };
        let parent_id = ensure_folder(tx, parent, folders, result, changed)?;
        tx.execute(
            "UPDATE folders SET parent_id = ?1 WHERE id = ?2 AND parent_id IS NULL",
            params![parent_id, orphan_id],
        )?;
        debug!("Folder {} now sits under {}", orphan_path.display(), parent.display());
        changed.insert(parent_id);
    }
    Ok(())
}

fn folder_id_at(tx: &Transaction<'_>, dir: &Path) -> rusqlite::Result<Option<FolderId>> {
    tx.query_row("SELECT id FROM folders WHERE path = ?1", [path_str(dir)], |row| row.get(0))
        .optional()
}

/// Insert or refresh an asset. Comment and tags survive updates; a changed
/// file takes whatever thumbnail the scan produced for it.
fn upsert_asset(tx: &Transaction<'_>, folder_id: FolderId, file: &ObservedFile, now: i64) -> rusqlite::Result<()> {
    let file_name = file
        .path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let companion = file.companion.as_ref();
    let thumbnail = file.thumbnail.as_ref();

    tx.execute(
        "INSERT INTO assets (
             folder_id, path, file_name, kind, size, modified_ns, content_hash,
             companion_path, companion_size, companion_modified_ns, companion_hash,
             thumbnail_key, thumbnail_source, created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)
         ON CONFLICT(folder_id, path) DO UPDATE SET
             file_name = excluded.file_name,
             kind = excluded.kind,
             size = excluded.size,
             modified_ns = excluded.modified_ns,
             content_hash = excluded.content_hash,
             companion_path = excluded.companion_path,
             companion_size = excluded.companion_size,
             companion_modified_ns = excluded.companion_modified_ns,
             companion_hash = excluded.companion_hash,
             thumbnail_key = excluded.thumbnail_key,
             thumbnail_source = excluded.thumbnail_source,
             removed_at = NULL,
             updated_at = excluded.updated_at",
        params![
            folder_id,
            path_str(&file.path),
            file_name,
            file.kind.as_str(),
            file.fingerprint.size as i64,
            file.fingerprint.modified_ns,
            file.fingerprint.content_hash,
            companion.map(|c| path_str(&c.path)),
            companion.map(|c| c.fingerprint.size as i64),
            companion.map(|c| c.fingerprint.modified_ns),
            companion.and_then(|c| c.fingerprint.content_hash.clone()),
            thumbnail.map(|t| t.key.as_str().to_string()),
            thumbnail.map(|t| t.source.as_str()),
            now,
        ],
    )?;
    Ok(())
}

fn folder_from_row(row: &Row<'_>) -> rusqlite::Result<FolderNode> {
    let path: String = row.get(3)?;
    let last_scanned_at: Option<i64> = row.get(4)?;
    Ok(FolderNode {
        id: row.get(0)?,
        parent_id: row.get(1)?,
        name: row.get(2)?,
        path: PathBuf::from(path),
        last_scanned_at: last_scanned_at.map(timestamp),
    })
}

fn asset_from_row(row: &Row<'_>) -> rusqlite::Result<AssetRecord> {
    let path: String = row.get(2)?;
    let kind_text: String = row.get(4)?;
    let kind = AssetKind::parse(&kind_text).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            Box::new(rusqlite::types::FromSqlError::InvalidType),
        )
    })?;

    let companion_path: Option<String> = row.get(8)?;
    let companion = match companion_path {
        Some(companion_path) => Some(Companion {
            path: PathBuf::from(companion_path),
            fingerprint: Fingerprint {
                size: row.get::<_, Option<i64>>(9)?.unwrap_or_default() as u64,
                modified_ns: row.get::<_, Option<i64>>(10)?.unwrap_or_default(),
                content_hash: row.get(11)?,
            },
        }),
        None => None,
    };

    let thumbnail_key: Option<String> = row.get(12)?;
    let thumbnail_source: Option<String> = row.get(13)?;
    let thumbnail = match (
        thumbnail_key.and_then(CacheKey::from_hex),
        thumbnail_source.as_deref().and_then(ThumbnailSource::parse),
    ) {
        (Some(key), Some(source)) => Some(ThumbnailRef { key, source }),
        _ => None,
    };

    let tags: String = row.get(15)?;
    Ok(AssetRecord {
        id: row.get(0)?,
        folder_id: row.get(1)?,
        path: PathBuf::from(path),
        file_name: row.get(3)?,
        kind,
        fingerprint: Fingerprint {
            size: row.get::<_, i64>(5)? as u64,
            modified_ns: row.get(6)?,
            content_hash: row.get(7)?,
        },
        companion,
        thumbnail,
        comment: row.get(14)?,
        tags: split_tags(&tags),
        created_at: timestamp(row.get(16)?),
        updated_at: timestamp(row.get(17)?),
    })
}

fn timestamp(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_default()
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// LIKE pattern matching everything strictly below `dir`
fn like_prefix(dir: &Path) -> String {
    let mut prefix = path_str(dir);
    if !prefix.ends_with(MAIN_SEPARATOR) {
        prefix.push(MAIN_SEPARATOR);
    }
    format!("{}%", escape_like(&prefix))
}

fn join_tags(tags: &[String]) -> String {
    tags.iter()
        .map(|tag| tag.trim())
        .filter(|tag| !tag.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

fn split_tags(tags: &str) -> Vec<String> {
    tags.split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect()
}

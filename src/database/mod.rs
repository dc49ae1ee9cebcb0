pub mod models;


use crate::sources::MERGED_SOURCE_ID;
use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

pub use models::*;

const ENTRY_COLUMNS: &str = "id, source_id, url, title, description, cover_url, added_at";

const EPISODE_COLUMNS: &str = "id, entry_id, url, name, scanlator, episode_number, source_order,
     read, bookmark, last_position_seen, date_fetch, date_upload, version";

const REFERENCE_COLUMNS: &str = "id, is_info_source, supplies_episode_updates, episode_sort_mode,
     episode_priority, download_episodes, group_id, group_url, member_entry_id,
     member_entry_url, member_source_id";

pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        // Enable WAL mode for concurrent reads
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA foreign_keys=ON;
            PRAGMA temp_store=MEMORY;
        ",
        )?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection mutex poisoned"))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_id INTEGER NOT NULL,
                url TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                cover_url TEXT,
                added_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE(source_id, url)
            );

            CREATE INDEX IF NOT EXISTS idx_entries_source ON entries(source_id);

            CREATE TABLE IF NOT EXISTS episodes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entry_id INTEGER NOT NULL,
                url TEXT NOT NULL,
                name TEXT NOT NULL,
                scanlator TEXT,
                episode_number REAL NOT NULL DEFAULT -1,
                source_order INTEGER NOT NULL DEFAULT 0,
                read INTEGER NOT NULL DEFAULT 0,
                bookmark INTEGER NOT NULL DEFAULT 0,
                last_position_seen INTEGER NOT NULL DEFAULT 0,
                date_fetch INTEGER NOT NULL DEFAULT 0,
                date_upload INTEGER NOT NULL DEFAULT 0,
                version INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (entry_id) REFERENCES entries(id) ON DELETE CASCADE,
                UNIQUE(entry_id, url)
            );

            CREATE INDEX IF NOT EXISTS idx_episodes_entry ON episodes(entry_id, source_order);
            CREATE INDEX IF NOT EXISTS idx_episodes_url ON episodes(url);

            -- One row per (merged group, member entry)
            CREATE TABLE IF NOT EXISTS merged_references (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                is_info_source INTEGER NOT NULL DEFAULT 0,
                supplies_episode_updates INTEGER NOT NULL DEFAULT 1,
                episode_sort_mode INTEGER NOT NULL DEFAULT 0,
                episode_priority INTEGER NOT NULL DEFAULT 0,
                download_episodes INTEGER NOT NULL DEFAULT 1,
                group_id INTEGER,
                group_url TEXT NOT NULL,
                member_entry_id INTEGER,
                member_entry_url TEXT NOT NULL,
                member_source_id INTEGER NOT NULL,
                FOREIGN KEY (group_id) REFERENCES entries(id) ON DELETE CASCADE,
                FOREIGN KEY (member_entry_id) REFERENCES entries(id) ON DELETE CASCADE,
                UNIQUE(group_url, member_source_id, member_entry_url)
            );

            CREATE INDEX IF NOT EXISTS idx_merged_references_group ON merged_references(group_id);
            CREATE INDEX IF NOT EXISTS idx_merged_references_member ON merged_references(member_entry_id);

            CREATE TABLE IF NOT EXISTS excluded_scanlators (
                entry_id INTEGER NOT NULL,
                scanlator TEXT NOT NULL,
                PRIMARY KEY (entry_id, scanlator),
                FOREIGN KEY (entry_id) REFERENCES entries(id) ON DELETE CASCADE
            );

            -- App settings (key-value store)
            CREATE TABLE IF NOT EXISTS app_settings (
                key TEXT PRIMARY KEY,
                value TEXT,
                updated_at TEXT DEFAULT (datetime('now'))
            );
        "#,
        )?;

        // At most one root reference per group
        conn.execute_batch(&format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_merged_references_root
                ON merged_references(group_url) WHERE member_source_id = {};",
            MERGED_SOURCE_ID
        ))?;

        Ok(())
    }

    // =========================================================================
    // Entry queries
    // =========================================================================

    pub fn insert_entry(
        &self,
        source_id: i64,
        url: &str,
        title: &str,
        description: Option<&str>,
    ) -> Result<i64> {
        let conn = self.conn()?;
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO entries (source_id, url, title, description, added_at) VALUES (?, ?, ?, ?, ?)",
            params![source_id, url, title, description, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_entry(&self, id: i64) -> Result<Option<Entry>> {
        let conn = self.conn()?;
        let entry = conn
            .query_row(
                &format!("SELECT {} FROM entries WHERE id = ?", ENTRY_COLUMNS),
                params![id],
                entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    pub fn get_entries_by_source(&self, source_id: i64) -> Result<Vec<Entry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM entries WHERE source_id = ? ORDER BY id",
            ENTRY_COLUMNS
        ))?;
        let entries = stmt
            .query_map(params![source_id], entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn get_entry_by_url_and_source(&self, url: &str, source_id: i64) -> Result<Option<Entry>> {
        let conn = self.conn()?;
        let entry = conn
            .query_row(
                &format!(
                    "SELECT {} FROM entries WHERE url = ? AND source_id = ?",
                    ENTRY_COLUMNS
                ),
                params![url, source_id],
                entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    /// Rewrite the `url` of several entries in one transaction.
    pub fn bulk_update_entry_urls(&self, updates: &[EntryUrlUpdate]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut changed = 0;
        {
            let mut stmt = tx.prepare("UPDATE entries SET url = ? WHERE id = ?")?;
            for update in updates {
                changed += stmt.execute(params![update.url, update.id])?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    pub fn delete_entry(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM entries WHERE id = ?", params![id])?;
        Ok(())
    }

    // =========================================================================
    // Episode queries
    // =========================================================================

    /// Insert episodes for an entry, updating source-reported fields of rows
    /// that already exist for the same url. Progress columns are only written
    /// on first insert.
    pub fn insert_episodes(&self, entry_id: i64, episodes: &[NewEpisode]) -> Result<Vec<i64>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = chrono::Utc::now().timestamp_millis();
        let mut ids = Vec::with_capacity(episodes.len());
        {
            let mut upsert = tx.prepare(
                "INSERT INTO episodes (entry_id, url, name, scanlator, episode_number, source_order,
                                       read, bookmark, last_position_seen, date_fetch, date_upload)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(entry_id, url) DO UPDATE SET
                    name = excluded.name,
                    scanlator = excluded.scanlator,
                    episode_number = excluded.episode_number,
                    source_order = excluded.source_order,
                    date_upload = excluded.date_upload,
                    version = version + 1",
            )?;
            let mut lookup = tx.prepare("SELECT id FROM episodes WHERE entry_id = ? AND url = ?")?;

            for episode in episodes {
                let number = episode
                    .episode_number
                    .unwrap_or_else(|| recognize_episode_number(&episode.name));
                // SQLite stores NaN as NULL
                let number = if number.is_finite() { number } else { -1.0 };
                upsert.execute(params![
                    entry_id,
                    episode.url,
                    episode.name,
                    episode.scanlator,
                    number,
                    episode.source_order,
                    episode.read,
                    episode.bookmark,
                    episode.last_position_seen,
                    now,
                    episode.date_upload,
                ])?;
                let id: i64 = lookup.query_row(params![entry_id, episode.url], |row| row.get(0))?;
                ids.push(id);
            }
        }
        tx.commit()?;
        Ok(ids)
    }

    pub fn get_episode(&self, id: i64) -> Result<Option<Episode>> {
        let conn = self.conn()?;
        let episode = conn
            .query_row(
                &format!("SELECT {} FROM episodes WHERE id = ?", EPISODE_COLUMNS),
                params![id],
                episode_from_row,
            )
            .optional()?;
        Ok(episode)
    }

    /// Episodes owned by an entry, in source order. With `filter_scanlator`
    /// the entry's excluded scanlators are left out.
    pub fn get_episodes_by_owner(&self, entry_id: i64, filter_scanlator: bool) -> Result<Vec<Episode>> {
        let conn = self.conn()?;
        let sql = if filter_scanlator {
            format!(
                "SELECT {} FROM episodes e
                 WHERE e.entry_id = ?
                   AND (e.scanlator IS NULL OR e.scanlator NOT IN
                        (SELECT scanlator FROM excluded_scanlators x WHERE x.entry_id = e.entry_id))
                 ORDER BY e.source_order, e.id",
                EPISODE_COLUMNS
            )
        } else {
            format!(
                "SELECT {} FROM episodes WHERE entry_id = ? ORDER BY source_order, id",
                EPISODE_COLUMNS
            )
        };
        let mut stmt = conn.prepare(&sql)?;
        let episodes = stmt
            .query_map(params![entry_id], episode_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(episodes)
    }

    /// Source-spanning lookup by url.
    pub fn get_episodes_by_url(&self, url: &str) -> Result<Vec<Episode>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM episodes WHERE url = ? ORDER BY id",
            EPISODE_COLUMNS
        ))?;
        let episodes = stmt
            .query_map(params![url], episode_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(episodes)
    }

    /// Apply partial updates in one transaction. Returns how many rows
    /// actually changed; updates whose `expected_version` no longer matches
    /// are skipped.
    pub fn bulk_update_episodes(&self, updates: &[PartialEpisodeUpdate]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut changed = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE episodes SET
                    read = COALESCE(?1, read),
                    bookmark = COALESCE(?2, bookmark),
                    last_position_seen = COALESCE(?3, last_position_seen),
                    version = version + 1
                 WHERE id = ?4 AND (?5 IS NULL OR version = ?5)",
            )?;
            for update in updates {
                if update.read.is_none()
                    && update.bookmark.is_none()
                    && update.last_position_seen.is_none()
                {
                    continue;
                }
                let applied = stmt.execute(params![
                    update.read,
                    update.bookmark,
                    update.last_position_seen,
                    update.id,
                    update.expected_version,
                ])?;
                if applied == 0 {
                    log::debug!("Skipped stale or missing episode update for id {}", update.id);
                }
                changed += applied;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    pub fn bulk_delete_episodes(&self, ids: &[i64]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut deleted = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM episodes WHERE id = ?")?;
            for id in ids {
                deleted += stmt.execute(params![id])?;
            }
        }
        tx.commit()?;
        Ok(deleted)
    }

    pub fn set_excluded_scanlators(&self, entry_id: i64, scanlators: &[&str]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM excluded_scanlators WHERE entry_id = ?",
            params![entry_id],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO excluded_scanlators (entry_id, scanlator) VALUES (?, ?)",
            )?;
            for scanlator in scanlators {
                stmt.execute(params![entry_id, scanlator])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_excluded_scanlators(&self, entry_id: i64) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT scanlator FROM excluded_scanlators WHERE entry_id = ? ORDER BY scanlator",
        )?;
        let scanlators = stmt
            .query_map(params![entry_id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(scanlators)
    }

    // =========================================================================
    // Merge references
    // =========================================================================

    /// Insert references in one transaction. Rows duplicating an existing
    /// (group_url, member_source_id, member_entry_url) are ignored; returns
    /// the number actually inserted.
    pub fn insert_references(&self, refs: &[MemberReference]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO merged_references
                    (is_info_source, supplies_episode_updates, episode_sort_mode, episode_priority,
                     download_episodes, group_id, group_url, member_entry_id, member_entry_url,
                     member_source_id)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?;
            for r in refs {
                inserted += stmt.execute(params![
                    r.is_info_source,
                    r.supplies_episode_updates,
                    r.episode_sort_mode.as_i64(),
                    r.episode_priority,
                    r.download_episodes,
                    r.group_id,
                    r.group_url,
                    r.member_entry_id,
                    r.member_entry_url,
                    r.member_source_id,
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// All references of a group, preferred members first.
    pub fn get_references(&self, group_id: i64) -> Result<Vec<MemberReference>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM merged_references WHERE group_id = ? ORDER BY episode_priority, id",
            REFERENCE_COLUMNS
        ))?;
        let refs = stmt
            .query_map(params![group_id], reference_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(refs)
    }

    pub fn get_reference(&self, id: i64) -> Result<Option<MemberReference>> {
        let conn = self.conn()?;
        let reference = conn
            .query_row(
                &format!("SELECT {} FROM merged_references WHERE id = ?", REFERENCE_COLUMNS),
                params![id],
                reference_from_row,
            )
            .optional()?;
        Ok(reference)
    }

    pub fn get_all_references(&self) -> Result<Vec<MemberReference>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM merged_references ORDER BY id",
            REFERENCE_COLUMNS
        ))?;
        let refs = stmt
            .query_map([], reference_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(refs)
    }

    /// Persist the user-editable settings of an existing reference.
    pub fn update_reference_settings(&self, reference: &MemberReference) -> Result<()> {
        let id = reference
            .id
            .ok_or_else(|| anyhow!("cannot update a reference that was never inserted"))?;
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE merged_references SET
                is_info_source = ?,
                supplies_episode_updates = ?,
                episode_sort_mode = ?,
                episode_priority = ?,
                download_episodes = ?
             WHERE id = ?",
            params![
                reference.is_info_source,
                reference.supplies_episode_updates,
                reference.episode_sort_mode.as_i64(),
                reference.episode_priority,
                reference.download_episodes,
                id,
            ],
        )?;
        if changed == 0 {
            return Err(anyhow!("merged reference {} does not exist", id));
        }
        Ok(())
    }

    pub fn delete_references_by_group(&self, group_id: i64) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM merged_references WHERE group_id = ?",
            params![group_id],
        )?;
        Ok(deleted)
    }

    pub fn delete_reference(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM merged_references WHERE id = ?", params![id])?;
        Ok(())
    }

    pub fn delete_references_for_member(&self, group_id: i64, member_entry_id: i64) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM merged_references WHERE group_id = ? AND member_entry_id = ? AND member_source_id != ?",
            params![group_id, member_entry_id, MERGED_SOURCE_ID],
        )?;
        Ok(deleted)
    }

    // =========================================================================
    // Settings
    // =========================================================================

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM app_settings WHERE key = ?",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT OR REPLACE INTO app_settings (key, value, updated_at) VALUES (?, ?, ?)",
            params![key, value, now],
        )?;
        Ok(())
    }
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<Entry> {
    Ok(Entry {
        id: row.get(0)?,
        source_id: row.get(1)?,
        url: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        cover_url: row.get(5)?,
        added_at: row.get(6)?,
    })
}

fn episode_from_row(row: &Row<'_>) -> rusqlite::Result<Episode> {
    Ok(Episode {
        id: row.get(0)?,
        owner_entry_id: row.get(1)?,
        url: row.get(2)?,
        name: row.get(3)?,
        scanlator: row.get(4)?,
        episode_number: row.get(5)?,
        source_order: row.get(6)?,
        read: row.get::<_, i32>(7)? == 1,
        bookmark: row.get::<_, i32>(8)? == 1,
        last_position_seen: row.get(9)?,
        date_fetch: row.get(10)?,
        date_upload: row.get(11)?,
        version: row.get(12)?,
    })
}

fn reference_from_row(row: &Row<'_>) -> rusqlite::Result<MemberReference> {
    Ok(MemberReference {
        id: row.get(0)?,
        is_info_source: row.get::<_, i32>(1)? == 1,
        supplies_episode_updates: row.get::<_, i32>(2)? == 1,
        episode_sort_mode: row.get::<_, i64>(3)?.into(),
        episode_priority: row.get(4)?,
        download_episodes: row.get::<_, i32>(5)? == 1,
        group_id: row.get(6)?,
        group_url: row.get(7)?,
        member_entry_id: row.get(8)?,
        member_entry_url: row.get(9)?,
        member_source_id: row.get(10)?,
    })
}

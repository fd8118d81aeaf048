// SQLite-backed store: schema migrations, fixture loading and queries.

pub mod fixture;
pub mod queries;

use crate::utils::error::Result;
use chrono::Utc;
use rusqlite::{params, Connection};
use std::collections::HashSet;
use std::path::Path;

/// 一個版本化的結構變更
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial",
        sql: "
            CREATE TABLE accounts (
                id INTEGER PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                first_name TEXT NOT NULL DEFAULT '',
                last_name TEXT NOT NULL DEFAULT '',
                email TEXT NOT NULL DEFAULT '',
                is_staff INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE TABLE student_profiles (
                account_id INTEGER PRIMARY KEY REFERENCES accounts(id) ON DELETE CASCADE,
                registration_number TEXT NOT NULL UNIQUE,
                phone TEXT NOT NULL,
                department TEXT NOT NULL,
                semester INTEGER NOT NULL DEFAULT 1
            );
            CREATE TABLE stalls (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                location TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                is_open INTEGER NOT NULL DEFAULT 1,
                owner_id INTEGER REFERENCES accounts(id) ON DELETE SET NULL
            );
            CREATE TABLE time_slots (
                id INTEGER PRIMARY KEY,
                slot_time TEXT NOT NULL UNIQUE,
                max_capacity INTEGER NOT NULL DEFAULT 50
            );
            CREATE TABLE food_items (
                id INTEGER PRIMARY KEY,
                stall_id INTEGER NOT NULL REFERENCES stalls(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                price_paise INTEGER NOT NULL CHECK (price_paise >= 0),
                category TEXT NOT NULL DEFAULT 'snacks',
                is_available INTEGER NOT NULL DEFAULT 1,
                preparation_time INTEGER NOT NULL DEFAULT 10
            );
            CREATE TABLE orders (
                id INTEGER PRIMARY KEY,
                account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                stall_id INTEGER NOT NULL REFERENCES stalls(id) ON DELETE CASCADE,
                time_slot_id INTEGER NOT NULL REFERENCES time_slots(id) ON DELETE CASCADE,
                order_date TEXT NOT NULL,
                order_time TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                total_paise INTEGER NOT NULL DEFAULT 0,
                special_instructions TEXT NOT NULL DEFAULT ''
            );
            CREATE TABLE order_items (
                id INTEGER PRIMARY KEY,
                order_id INTEGER NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
                food_item_id INTEGER NOT NULL REFERENCES food_items(id) ON DELETE CASCADE,
                quantity INTEGER NOT NULL DEFAULT 1 CHECK (quantity > 0),
                price_at_order_paise INTEGER NOT NULL
            );
            CREATE INDEX idx_orders_slot_date ON orders(time_slot_id, order_date);
            CREATE INDEX idx_orders_account ON orders(account_id);
            CREATE INDEX idx_order_items_order ON order_items(order_id);
        ",
    },
    Migration {
        version: 2,
        name: "demand_records",
        sql: "
            CREATE TABLE demand_records (
                id INTEGER PRIMARY KEY,
                food_item_id INTEGER NOT NULL REFERENCES food_items(id) ON DELETE CASCADE,
                date TEXT NOT NULL,
                time_slot_id INTEGER NOT NULL REFERENCES time_slots(id) ON DELETE CASCADE,
                day_of_week INTEGER NOT NULL CHECK (day_of_week BETWEEN 0 AND 6),
                quantity_ordered INTEGER NOT NULL DEFAULT 0,
                predicted_demand INTEGER NOT NULL DEFAULT 0,
                UNIQUE (food_item_id, date, time_slot_id)
            );
            CREATE INDEX idx_demand_item ON demand_records(food_item_id);
        ",
    },
];

pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             CREATE TABLE IF NOT EXISTS schema_migrations (
                 version INTEGER PRIMARY KEY,
                 name TEXT NOT NULL,
                 applied_at TEXT NOT NULL
             );",
        )?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn applied_versions(&self) -> Result<HashSet<i64>> {
        let mut stmt = self.conn.prepare("SELECT version FROM schema_migrations")?;
        let versions = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .collect::<std::result::Result<HashSet<_>, _>>()?;
        Ok(versions)
    }

    /// Migrations not yet recorded in `schema_migrations`, in version order.
    pub fn pending_migrations(&self) -> Result<Vec<&'static Migration>> {
        let applied = self.applied_versions()?;
        Ok(MIGRATIONS
            .iter()
            .filter(|m| !applied.contains(&m.version))
            .collect())
    }

    /// 套用所有尚未套用的 migration；重複執行不會有任何變更
    pub fn migrate(&mut self) -> Result<Vec<&'static Migration>> {
        let pending = self.pending_migrations()?;

        for migration in &pending {
            let tx = self.conn.transaction()?;
            tx.execute_batch(migration.sql)?;
            tx.execute(
                "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
                params![migration.version, migration.name, Utc::now().to_rfc3339()],
            )?;
            tx.commit()?;
            tracing::info!(
                "🗄️ Applied migration {:04}_{}",
                migration.version,
                migration.name
            );
        }

        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_is_idempotent() {
        let mut store = Store::open_in_memory().unwrap();
        assert_eq!(store.pending_migrations().unwrap().len(), MIGRATIONS.len());

        let applied = store.migrate().unwrap();
        assert_eq!(applied.len(), MIGRATIONS.len());
        assert!(store.pending_migrations().unwrap().is_empty());

        let second = store.migrate().unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn test_migrate_persists_across_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("stallbook.db");

        Store::open(&path).unwrap().migrate().unwrap();
        let store = Store::open(&path).unwrap();
        assert!(store.pending_migrations().unwrap().is_empty());
    }
}

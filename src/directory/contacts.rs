//! Contact Book
//!
//! SQLite-Datenbank für lokale Kontakte.
//! Speichert Identität, Anzeigename und wann der Kontakt zuletzt gesehen wurde.

use super::Directory;
use crate::signaling::is_valid_identity;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult, Row};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create database directory: {0}")]
    DirectoryCreation(#[from] std::io::Error),

    #[error("Contact not found: {0}")]
    ContactNotFound(String),

    #[error("Invalid identity '{0}'")]
    InvalidIdentity(String),
}

// ============================================================================
// CONTACT STRUCT
// ============================================================================

/// Lokaler Kontakt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: i64,
    pub identity: String,
    pub display_name: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: String,
}

/// Neuer Kontakt ohne ID (für INSERT)
#[derive(Debug, Clone)]
pub struct NewContact {
    pub identity: String,
    pub display_name: Option<String>,
}

const CONTACT_COLUMNS: &str = "id, identity, display_name, last_seen, created_at";

fn contact_from_row(row: &Row<'_>) -> SqliteResult<Contact> {
    let last_seen: Option<String> = row.get(3)?;
    Ok(Contact {
        id: row.get(0)?,
        identity: row.get(1)?,
        display_name: row.get(2)?,
        last_seen: last_seen
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|t| t.with_timezone(&Utc)),
        created_at: row.get(4)?,
    })
}

// ============================================================================
// DATABASE
// ============================================================================

/// SQLite-Kontaktbuch (Thread-safe durch Mutex)
pub struct ContactBook {
    conn: Mutex<Connection>,
}

impl ContactBook {
    /// Öffnet oder erstellt die Datenbank unter `path`, sonst im
    /// Datenverzeichnis der Plattform
    pub fn open(path: Option<&Path>) -> Result<Self, DirectoryError> {
        let db_path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::default_path()?,
        };

        // Parent-Verzeichnis erstellen
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!("Opening contact book at {:?}", db_path);

        let conn = Connection::open(&db_path)?;
        let book = Self {
            conn: Mutex::new(conn),
        };
        book.init_schema()?;

        Ok(book)
    }

    /// In-Memory Datenbank (Tests, Agent ohne Kontaktbuch)
    pub fn open_in_memory() -> Result<Self, DirectoryError> {
        let conn = Connection::open_in_memory()?;
        let book = Self {
            conn: Mutex::new(conn),
        };
        book.init_schema()?;
        Ok(book)
    }

    fn default_path() -> Result<PathBuf, DirectoryError> {
        let proj_dirs = directories::ProjectDirs::from("org", "peer-call", "peer-call")
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "Could not determine app data directory",
                )
            })?;

        let mut path = proj_dirs.data_dir().to_path_buf();
        path.push("contacts.db");
        Ok(path)
    }

    fn init_schema(&self) -> Result<(), DirectoryError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS contacts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                identity TEXT NOT NULL UNIQUE,
                display_name TEXT,
                last_seen TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE INDEX IF NOT EXISTS idx_contacts_display_name
            ON contacts(display_name COLLATE NOCASE)
            "#,
            [],
        )?;

        Ok(())
    }

    /// Fügt einen Kontakt hinzu oder aktualisiert den Anzeigenamen
    pub fn add_contact(&self, contact: NewContact) -> Result<Contact, DirectoryError> {
        if !is_valid_identity(&contact.identity) {
            return Err(DirectoryError::InvalidIdentity(contact.identity));
        }

        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO contacts (identity, display_name)
            VALUES (?1, ?2)
            ON CONFLICT(identity) DO UPDATE SET
                display_name = COALESCE(excluded.display_name, display_name),
                updated_at = datetime('now')
            "#,
            params![contact.identity, contact.display_name],
        )?;

        Self::get_contact_inner(&conn, &contact.identity)
    }

    fn get_contact_inner(conn: &Connection, identity: &str) -> Result<Contact, DirectoryError> {
        conn.query_row(
            &format!("SELECT {} FROM contacts WHERE identity = ?1", CONTACT_COLUMNS),
            params![identity],
            contact_from_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                DirectoryError::ContactNotFound(identity.to_string())
            }
            other => DirectoryError::Sqlite(other),
        })
    }

    pub fn get_contact(&self, identity: &str) -> Result<Contact, DirectoryError> {
        let conn = self.conn.lock();
        Self::get_contact_inner(&conn, identity)
    }

    /// Alle Kontakte, zuletzt gesehene zuerst
    pub fn list_contacts(&self) -> Result<Vec<Contact>, DirectoryError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM contacts ORDER BY last_seen IS NULL, last_seen DESC, identity ASC",
            CONTACT_COLUMNS
        ))?;

        let contacts = stmt
            .query_map([], contact_from_row)?
            .collect::<SqliteResult<Vec<Contact>>>()?;

        Ok(contacts)
    }

    pub fn set_display_name(
        &self,
        identity: &str,
        display_name: Option<&str>,
    ) -> Result<(), DirectoryError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            r#"
            UPDATE contacts
            SET display_name = ?2, updated_at = datetime('now')
            WHERE identity = ?1
            "#,
            params![identity, display_name],
        )?;
        if changed == 0 {
            return Err(DirectoryError::ContactNotFound(identity.to_string()));
        }
        Ok(())
    }

    pub fn remove_contact(&self, identity: &str) -> Result<(), DirectoryError> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM contacts WHERE identity = ?1",
            params![identity],
        )?;
        Ok(())
    }
}

impl Directory for ContactBook {
    /// Bekannte Identität, dann Anzeigename (ohne Groß/Kleinschreibung),
    /// sonst wird `name` selbst als Identität verwendet.
    fn resolve(&self, name: &str) -> Result<String, DirectoryError> {
        let name = name.trim();
        let conn = self.conn.lock();

        let by_identity: Option<String> = conn
            .query_row(
                "SELECT identity FROM contacts WHERE identity = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(identity) = by_identity {
            return Ok(identity);
        }

        let by_name: Option<String> = conn
            .query_row(
                r#"
                SELECT identity FROM contacts
                WHERE display_name = ?1 COLLATE NOCASE
                ORDER BY last_seen IS NULL, last_seen DESC
                LIMIT 1
                "#,
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(identity) = by_name {
            tracing::debug!("Resolved '{}' to '{}'", name, identity);
            return Ok(identity);
        }

        if is_valid_identity(name) {
            Ok(name.to_string())
        } else {
            Err(DirectoryError::InvalidIdentity(name.to_string()))
        }
    }

    fn record_seen(&self, identity: &str) -> Result<(), DirectoryError> {
        if !is_valid_identity(identity) {
            return Err(DirectoryError::InvalidIdentity(identity.to_string()));
        }

        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO contacts (identity, last_seen)
            VALUES (?1, ?2)
            ON CONFLICT(identity) DO UPDATE SET
                last_seen = excluded.last_seen,
                updated_at = datetime('now')
            "#,
            params![identity, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

//! Call Directory
//!
//! Löst einen lesbaren Namen in die Identität auf, unter der ein Peer am
//! Relay erreichbar ist, und merkt sich, wann ein Peer zuletzt gesehen wurde.

mod contacts;

pub use contacts::{Contact, ContactBook, DirectoryError, NewContact};

/// Namensauflösung für Anrufziele
pub trait Directory: Send + Sync {
    /// Liefert die Relay-Identität für `name` (Identität oder Anzeigename)
    fn resolve(&self, name: &str) -> Result<String, DirectoryError>;

    /// Vermerkt, dass von `identity` gerade ein Envelope ankam
    fn record_seen(&self, identity: &str) -> Result<(), DirectoryError>;
}

//! Key list: import boundary, de-duplication, export, filters and user edits

use crate::server::models::Protocol;
use crate::server::parser::{KeyParser, ScannedLine};
use crate::server::ranking::{self, CollectionStats, KeyStatus};
use crate::server::record::ServerKey;
use crate::Result;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;

/// Outcome of importing a block of descriptor text
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    /// New keys appended to the list
    pub added: usize,
    /// Lines whose identity was already present
    pub duplicates: usize,
    /// Added keys that could not be normalized
    pub parse_errors: usize,
    /// Lines without a supported scheme prefix
    pub rejected: usize,
}

impl ImportReport {
    pub fn merge(&mut self, other: &ImportReport) {
        self.added += other.added;
        self.duplicates += other.duplicates;
        self.parse_errors += other.parse_errors;
        self.rejected += other.rejected;
    }
}

impl fmt::Display for ImportReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "added {}, duplicates {}, parse errors {}, rejected {}",
            self.added, self.duplicates, self.parse_errors, self.rejected
        )
    }
}

/// Criteria for narrowing a listing; unset fields match everything
#[derive(Debug, Clone, Default)]
pub struct KeyFilter {
    pub protocol: Option<Protocol>,
    pub group: Option<String>,
    pub status: Option<KeyStatus>,
    /// Case-insensitive match against name, host and country
    pub search: Option<String>,
    pub favorites_only: bool,
}

impl KeyFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn with_group(mut self, group: String) -> Self {
        self.group = Some(group);
        self
    }

    pub fn with_status(mut self, status: KeyStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_search(mut self, search: String) -> Self {
        self.search = Some(search.to_lowercase());
        self
    }

    pub fn favorites_only(mut self) -> Self {
        self.favorites_only = true;
        self
    }

    pub fn matches(&self, key: &ServerKey) -> bool {
        if self.protocol.is_some_and(|p| p != key.protocol) {
            return false;
        }
        if self.group.as_ref().is_some_and(|g| *g != key.group) {
            return false;
        }
        if self.status.is_some_and(|s| s != KeyStatus::of(key)) {
            return false;
        }
        if self.favorites_only && !key.is_favorite {
            return false;
        }
        if let Some(search) = self.search.as_deref().filter(|s| !s.is_empty()) {
            let search = search.to_lowercase();
            let hit = |text: &str| text.to_lowercase().contains(&search);
            let found = hit(&key.name)
                || key.host().is_some_and(hit)
                || key.country.as_deref().is_some_and(hit);
            if !found {
                return false;
            }
        }
        true
    }
}

/// Ordered collection of keys with unique identities
#[derive(Debug, Clone, Default)]
pub struct KeyList {
    keys: Vec<ServerKey>,
}

impl KeyList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap existing records as they are; see [`KeyList::remove_duplicates`]
    pub fn from_keys(keys: Vec<ServerKey>) -> Self {
        Self { keys }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[ServerKey] {
        &self.keys
    }

    pub fn keys_mut(&mut self) -> &mut [ServerKey] {
        &mut self.keys
    }

    pub fn into_keys(self) -> Vec<ServerKey> {
        self.keys
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServerKey> {
        self.keys.iter()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.keys.iter().any(|k| k.id == id)
    }

    pub fn get(&self, id: &str) -> Option<&ServerKey> {
        self.keys.iter().find(|k| k.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut ServerKey> {
        self.keys.iter_mut().find(|k| k.id == id)
    }

    /// Append a key unless its identity is already present
    pub fn push(&mut self, key: ServerKey) -> bool {
        if self.contains(&key.id) {
            return false;
        }
        self.keys.push(key);
        true
    }

    /// Import descriptor text, one descriptor per line
    ///
    /// Blank and `#` lines are skipped and lines without a supported prefix are
    /// only counted. Keys that fail to normalize are still added so they stay
    /// visible and exportable.
    pub fn import(&mut self, content: &str, group: &str) -> ImportReport {
        let mut report = ImportReport::default();

        for line in KeyParser::scan_lines(content) {
            let descriptor = match line {
                ScannedLine::Descriptor(descriptor) => descriptor,
                ScannedLine::Rejected(text) => {
                    tracing::debug!(line = %truncate(text, 50), "rejected unsupported line");
                    report.rejected += 1;
                    continue;
                }
            };

            let key = ServerKey::new(descriptor, group);
            if let Some(error) = key.config.error() {
                tracing::warn!(
                    key_id = %key.id,
                    line = %truncate(descriptor, 50),
                    %error,
                    "descriptor parse error"
                );
            }

            let parse_error = !key.config.is_valid();
            let id = key.id.clone();
            if self.push(key) {
                report.added += 1;
                if parse_error {
                    report.parse_errors += 1;
                }
                tracing::debug!(key_id = %id, group, "key added");
            } else {
                report.duplicates += 1;
            }
        }

        tracing::info!(group, %report, "import finished");
        report
    }

    /// Import descriptors from a text file
    pub fn import_file<P: AsRef<Path>>(&mut self, path: P, group: &str) -> Result<ImportReport> {
        let content = fs::read_to_string(path)?;
        Ok(self.import(&content, group))
    }

    /// Raw descriptors, one per line
    pub fn export_string(&self) -> String {
        export_keys(self.keys.iter())
    }

    /// Save all raw descriptors to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        save_keys(self.keys.iter(), path)
    }

    /// Remove a key by identity
    pub fn remove(&mut self, id: &str) -> Option<ServerKey> {
        let index = self.keys.iter().position(|k| k.id == id)?;
        Some(self.keys.remove(index))
    }

    /// Drop later keys that share an identity with an earlier one
    pub fn remove_duplicates(&mut self) -> usize {
        let mut seen = HashSet::new();
        let before = self.keys.len();
        self.keys.retain(|k| seen.insert(k.id.clone()));
        before - self.keys.len()
    }

    /// Drop keys that were probed and are not in a success streak
    pub fn remove_dead(&mut self) -> usize {
        let before = self.keys.len();
        self.keys.retain(|k| k.is_online() || !k.is_tested());
        before - self.keys.len()
    }

    /// Drop every key classified as worst
    pub fn remove_worst(&mut self) -> usize {
        let before = self.keys.len();
        self.keys.retain(|k| !ranking::is_worst(k));
        before - self.keys.len()
    }

    /// Drop every key of a group
    pub fn remove_group(&mut self, group: &str) -> usize {
        let before = self.keys.len();
        self.keys.retain(|k| k.group != group);
        before - self.keys.len()
    }

    /// Flip the favorite flag, returning the new value
    pub fn toggle_favorite(&mut self, id: &str) -> Option<bool> {
        let key = self.get_mut(id)?;
        key.is_favorite = !key.is_favorite;
        Some(key.is_favorite)
    }

    pub fn rename(&mut self, id: &str, name: &str) -> bool {
        match self.get_mut(id) {
            Some(key) => {
                key.name = name.to_string();
                true
            }
            None => false,
        }
    }

    pub fn set_note(&mut self, id: &str, note: &str) -> bool {
        match self.get_mut(id) {
            Some(key) => {
                key.notes = note.to_string();
                true
            }
            None => false,
        }
    }

    pub fn filter(&self, filter: &KeyFilter) -> Vec<&ServerKey> {
        self.keys.iter().filter(|k| filter.matches(k)).collect()
    }

    /// Distinct group labels in first-seen order
    pub fn groups(&self) -> Vec<&str> {
        let mut groups: Vec<&str> = Vec::new();
        for key in &self.keys {
            if !groups.contains(&key.group.as_str()) {
                groups.push(&key.group);
            }
        }
        groups
    }

    pub fn stats(&self) -> CollectionStats {
        CollectionStats::collect(&self.keys)
    }
}

/// Raw descriptors of the given keys, one per line
pub fn export_keys<'a, I>(keys: I) -> String
where
    I: IntoIterator<Item = &'a ServerKey>,
{
    keys.into_iter()
        .map(ServerKey::share_link)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Save raw descriptors of the given keys to a file
pub fn save_keys<'a, I, P>(keys: I, path: P) -> Result<()>
where
    I: IntoIterator<Item = &'a ServerKey>,
    P: AsRef<Path>,
{
    let mut content = export_keys(keys);
    if !content.is_empty() {
        content.push('\n');
    }
    fs::write(path, content)?;
    Ok(())
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => format!("{}...", &text[..index]),
        None => text.to_string(),
    }
}

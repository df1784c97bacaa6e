//! Session store (spec §6): lazy `webservSessionId`-bound sessions, each
//! backed by its own on-disk file (the absolute path CGI scripts receive as
//! `HTTP_SESSION_FILE`), indexed by a flat `id,last_access_unix_secs` manager
//! file so a restart doesn't silently orphan every logged-in client.
//! Grounded on the original session manager's `<storagePath>/<id>.session`
//! per-session files plus its combined `session_manager.sm` index.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Matches the original session manager's `SESSION_ID_LENGTH`.
const SESSION_ID_LENGTH: usize = 32;
const SESSION_ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Matches the original session manager's `SESSION_MAX_STORAGE_AGE` (1 day).
pub const SESSION_MAX_AGE_SECS: u64 = 60 * 60 * 24;

pub struct SessionStore {
    sessions: HashMap<String, u64>,
    store_path: PathBuf,
    storage_dir: PathBuf,
}

impl SessionStore {
    pub fn new(store_path: PathBuf) -> Self {
        let storage_dir = match store_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let _ = std::fs::create_dir_all(&storage_dir);
        let mut store = SessionStore { sessions: HashMap::new(), store_path, storage_dir };
        store.load();
        store
    }

    fn load(&mut self) {
        let Ok(contents) = std::fs::read_to_string(&self.store_path) else {
            return;
        };
        for line in contents.lines() {
            if let Some((id, ts)) = line.split_once(',') {
                if let Ok(ts) = ts.trim().parse::<u64>() {
                    self.sessions.insert(id.trim().to_string(), ts);
                }
            }
        }
    }

    fn persist(&self) {
        let mut out = String::new();
        for (id, ts) in &self.sessions {
            out.push_str(id);
            out.push(',');
            out.push_str(&ts.to_string());
            out.push('\n');
        }
        if let Ok(mut f) = std::fs::File::create(&self.store_path) {
            let _ = f.write_all(out.as_bytes());
        }
    }

    fn now_secs() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
    }

    /// The absolute path of `session_id`'s own storage file, handed to CGI
    /// scripts as `HTTP_SESSION_FILE`. The file is created empty on first
    /// touch so the path is always valid for a script to open.
    pub fn absolute_file_path(&self, session_id: &str) -> PathBuf {
        let relative = self.storage_dir.join(format!("{session_id}.session"));
        std::fs::canonicalize(&relative).unwrap_or_else(|_| {
            std::env::current_dir().map(|cwd| cwd.join(&relative)).unwrap_or(relative)
        })
    }

    fn ensure_session_file(&self, session_id: &str) {
        let path = self.storage_dir.join(format!("{session_id}.session"));
        if !path.exists() {
            let _ = std::fs::File::create(&path);
        }
    }

    /// A session is valid only while it both exists and hasn't gone idle
    /// longer than `SESSION_MAX_AGE_SECS`.
    pub fn exists(&self, session_id: &str) -> bool {
        match self.sessions.get(session_id) {
            Some(last) => Self::now_secs().saturating_sub(*last) <= SESSION_MAX_AGE_SECS,
            None => false,
        }
    }

    /// Stamps `session_id` as freshly used, creating it if unseen. Persists
    /// to disk on every touch — sessions are low-frequency enough that this
    /// isn't a hot path worth batching.
    pub fn touch(&mut self, session_id: &str) {
        self.sessions.insert(session_id.to_string(), Self::now_secs());
        self.ensure_session_file(session_id);
        self.persist();
    }

    /// Mints a new, fixed-width 32-character alphanumeric session id and
    /// registers it immediately.
    pub fn create(&mut self) -> String {
        let mut id;
        loop {
            id = random_session_id();
            if !self.sessions.contains_key(&id) {
                break;
            }
        }
        self.touch(&id);
        id
    }

    /// Drops sessions idle longer than `SESSION_MAX_AGE_SECS`, removing their
    /// backing files along with the manager-file entry.
    pub fn sweep_expired(&mut self) {
        let now = Self::now_secs();
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, last)| now.saturating_sub(**last) > SESSION_MAX_AGE_SECS)
            .map(|(id, _)| id.clone())
            .collect();
        if expired.is_empty() {
            return;
        }
        for id in &expired {
            self.sessions.remove(id);
            let _ = std::fs::remove_file(self.storage_dir.join(format!("{id}.session")));
        }
        self.persist();
    }

    pub fn path(&self) -> &Path {
        &self.store_path
    }
}

/// xorshift64*, seeded from wall-clock time, pid, and stack entropy — enough
/// to keep session ids unpredictable and collision-free without pulling in a
/// dependency the rest of the crate has no other use for.
fn random_session_id() -> String {
    let mut state = rng_seed();
    let mut id = String::with_capacity(SESSION_ID_LENGTH);
    for _ in 0..SESSION_ID_LENGTH {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        let idx = (state % SESSION_ID_ALPHABET.len() as u64) as usize;
        id.push(SESSION_ID_ALPHABET[idx] as char);
    }
    id
}

fn rng_seed() -> u64 {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as u64;
    let stack_marker = &nanos as *const u64 as u64;
    (nanos ^ stack_marker.rotate_left(17) ^ std::process::id() as u64) | 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("webserv_test_{name}_{:?}", std::thread::current().id()))
    }

    #[test]
    fn create_then_exists() {
        let path = temp_path("create");
        let _ = std::fs::remove_file(&path);
        let mut store = SessionStore::new(path.clone());
        let id = store.create();
        assert_eq!(id.len(), SESSION_ID_LENGTH);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(store.exists(&id));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn persists_and_reloads() {
        let path = temp_path("reload");
        let _ = std::fs::remove_file(&path);
        let id = {
            let mut store = SessionStore::new(path.clone());
            store.create()
        };
        let reloaded = SessionStore::new(path.clone());
        assert!(reloaded.exists(&id));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn expired_session_is_not_found() {
        let path = temp_path("expired");
        let _ = std::fs::remove_file(&path);
        let mut store = SessionStore::new(path.clone());
        store.sessions.insert("old".to_string(), 0);
        assert!(!store.exists("old"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn sweep_removes_stale_sessions_and_their_files() {
        let path = temp_path("sweep");
        let _ = std::fs::remove_file(&path);
        let mut store = SessionStore::new(path.clone());
        store.sessions.insert("old".to_string(), 0);
        store.ensure_session_file("old");
        store.sweep_expired();
        assert!(!store.exists("old"));
        assert!(!store.storage_dir.join("old.session").exists());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn absolute_file_path_points_inside_storage_dir() {
        let path = temp_path("abspath");
        let _ = std::fs::remove_file(&path);
        let mut store = SessionStore::new(path.clone());
        let id = store.create();
        let abs = store.absolute_file_path(&id);
        assert!(abs.is_absolute());
        assert!(abs.ends_with(format!("{id}.session")));
        let _ = std::fs::remove_file(&path);
    }
}

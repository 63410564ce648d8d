//! Local Maildir transport.
//!
//! Treats a Maildir directory (`new/` + `cur/`) as a mailbox. Uids are
//! assigned in discovery order and never reused. The transport keeps one uid
//! book per directory, so a reconnected session numbers a message the same
//! way and new messages always land above the caller's high-water mark. A
//! message keeps its uid when the delivery agent moves it from `new/` to
//! `cur/` (the part of the filename before `:` is stable).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::{MailAccount, MailMessage, MailSession, MailTransport, TransportError};

/// Provider type under which the Maildir factory is registered.
pub const MAILDIR_PROVIDER: &str = "maildir";

/// Subdirectories scanned for messages.
const MAILDIR_SUBDIRS: [&str; 2] = ["new", "cur"];

/// Uid assignments of one Maildir, shared by every session on it.
#[derive(Debug)]
struct UidBook {
    uids: HashMap<String, u64>,
    next_uid: u64,
}

impl Default for UidBook {
    fn default() -> Self {
        Self {
            uids: HashMap::new(),
            next_uid: 1,
        }
    }
}

impl UidBook {
    fn uid_for(&mut self, key: &str) -> u64 {
        if let Some(uid) = self.uids.get(key) {
            return *uid;
        }
        let uid = self.next_uid;
        self.next_uid = self.next_uid.saturating_add(1);
        self.uids.insert(key.to_owned(), uid);
        uid
    }

    /// Forget messages no longer on disk. Their uids are not handed out again.
    fn retain(&mut self, live: &HashSet<&str>) {
        self.uids.retain(|key, _| live.contains(key.as_str()));
    }
}

type SharedBook = Arc<Mutex<UidBook>>;

/// Opens [`MaildirSession`]s; the account endpoint is the Maildir path.
#[derive(Debug, Default)]
pub struct MaildirTransport {
    books: Mutex<HashMap<PathBuf, SharedBook>>,
}

impl MaildirTransport {
    /// Transport with no sessions opened yet.
    pub fn new() -> Self {
        Self::default()
    }

    fn book(&self, root: &Path) -> SharedBook {
        let mut books = self.books.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(books.entry(root.to_path_buf()).or_default())
    }
}

#[async_trait]
impl MailTransport for MaildirTransport {
    async fn connect(&self, account: &MailAccount) -> Result<Box<dyn MailSession>, TransportError> {
        let root = PathBuf::from(&account.endpoint);
        for sub in MAILDIR_SUBDIRS {
            let dir = root.join(sub);
            let is_dir = tokio::fs::metadata(&dir)
                .await
                .map(|meta| meta.is_dir())
                .unwrap_or(false);
            if !is_dir {
                return Err(TransportError::Unreachable(format!(
                    "{} is not a maildir (missing {sub}/)",
                    root.display()
                )));
            }
        }
        let book = self.book(&root);
        Ok(Box::new(MaildirSession { root, book }))
    }
}

/// Session over one Maildir directory.
#[derive(Debug)]
pub struct MaildirSession {
    root: PathBuf,
    book: SharedBook,
}

impl MaildirSession {
    /// Standalone session rooted at `root` with its own uid book.
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            book: SharedBook::default(),
        }
    }

    async fn scan(&self) -> Result<Vec<(String, PathBuf, SystemTime)>, TransportError> {
        let mut found = Vec::new();
        for sub in MAILDIR_SUBDIRS {
            let dir = self.root.join(sub);
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| TransportError::Io(format!("read {}: {e}", dir.display())))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| TransportError::Io(format!("read {}: {e}", dir.display())))?
            {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    continue;
                }
                let key = name.split(':').next().unwrap_or(&name).to_owned();
                let modified = entry
                    .metadata()
                    .await
                    .and_then(|meta| meta.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                found.push((key, entry.path(), modified));
            }
        }
        found.sort_by(|a, b| a.2.cmp(&b.2).then_with(|| a.0.cmp(&b.0)));
        Ok(found)
    }

    /// Number the scanned files, oldest first.
    fn assign_uids(
        &self,
        files: Vec<(String, PathBuf, SystemTime)>,
    ) -> Vec<(u64, PathBuf, SystemTime)> {
        let mut book = self.book.lock().unwrap_or_else(PoisonError::into_inner);
        let numbered = files
            .iter()
            .map(|(key, path, modified)| (book.uid_for(key), path.clone(), *modified))
            .collect();
        let live: HashSet<&str> = files.iter().map(|(key, _, _)| key.as_str()).collect();
        book.retain(&live);
        numbered
    }
}

#[async_trait]
impl MailSession for MaildirSession {
    async fn fetch_since(&mut self, after_uid: Option<u64>) -> Result<Vec<MailMessage>, TransportError> {
        let files = self.scan().await?;
        let mut messages = Vec::new();
        for (uid, path, modified) in self.assign_uids(files) {
            if after_uid.is_some_and(|after| uid <= after) {
                continue;
            }
            let raw = tokio::fs::read(&path)
                .await
                .map_err(|e| TransportError::Io(format!("read {}: {e}", path.display())))?;
            messages.push(parse_message(uid, &String::from_utf8_lossy(&raw), modified));
        }
        debug!(root = %self.root.display(), count = messages.len(), "maildir scanned");
        Ok(messages)
    }

    async fn close(&mut self) {}
}

/// Parse an RFC 5322 message into a [`MailMessage`].
///
/// Only `From`, `Subject` and `Date` are read; folded header lines are
/// joined. A missing or unparsable `Date` falls back to `fallback`.
pub fn parse_message(uid: u64, raw: &str, fallback: SystemTime) -> MailMessage {
    let normalized = raw.replace("\r\n", "\n");
    let (head, body) = normalized
        .split_once("\n\n")
        .unwrap_or((normalized.as_str(), ""));

    let mut headers: Vec<(String, String)> = Vec::new();
    for line in head.lines() {
        if line.starts_with([' ', '\t']) {
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
        } else if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_owned()));
        }
    }
    let header = |name: &str| {
        headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
    };

    let received_at = header("date")
        .and_then(|d| DateTime::parse_from_rfc2822(&d).ok())
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|| DateTime::<Utc>::from(fallback));

    MailMessage {
        uid,
        from: header("from").unwrap_or_default(),
        subject: header("subject").unwrap_or_default(),
        body: body.trim_end().to_owned(),
        received_at,
    }
}

/// Create the `new/`, `cur/` and `tmp/` directories of a Maildir.
///
/// # Errors
///
/// Returns an error if a directory cannot be created.
pub fn create_maildir(root: &Path) -> std::io::Result<()> {
    for sub in ["new", "cur", "tmp"] {
        std::fs::create_dir_all(root.join(sub))?;
    }
    Ok(())
}

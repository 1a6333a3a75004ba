#![forbid(unsafe_code)]

//! Download archive: the append-only ledger of items that finished
//! downloading. The on-disk format mirrors yt-dlp's own `--download-archive`
//! file (`<extractor> <id>` per line) so either tool can read the other's
//! ledger.
//!
//! The file is the source of truth. Every lookup first picks up lines that
//! were appended since the previous read, so a second invocation writing to
//! the same ledger is noticed without restarting.

use crate::error::{JobError, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Ledger key: lower-case extractor name plus the site's item id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArchiveId {
    extractor: String,
    item: String,
}

impl ArchiveId {
    pub fn new(extractor: &str, item: &str) -> Self {
        Self {
            extractor: extractor.trim().to_lowercase(),
            item: item.trim().to_string(),
        }
    }

    /// Fallback key used when no probe ran: the URL itself, with the fragment
    /// and trailing slash removed.
    pub fn from_url(raw: &str) -> Self {
        let normalized = match url::Url::parse(raw.trim()) {
            Ok(mut parsed) => {
                parsed.set_fragment(None);
                parsed.as_str().trim_end_matches('/').to_string()
            }
            Err(_) => raw.trim().to_string(),
        };
        Self::new("url", &normalized)
    }

    /// Parses one ledger line. Single-token lines are accepted as ids without
    /// an extractor, as older hand-written archives sometimes contain them.
    pub fn parse_line(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        match trimmed.split_once(char::is_whitespace) {
            Some((extractor, item)) if !item.trim().is_empty() => {
                Some(Self::new(extractor, item))
            }
            _ => Some(Self::new("", trimmed)),
        }
    }

    pub fn extractor(&self) -> &str {
        &self.extractor
    }

    pub fn item(&self) -> &str {
        &self.item
    }
}

impl fmt::Display for ArchiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.extractor.is_empty() {
            f.write_str(&self.item)
        } else {
            write!(f, "{} {}", self.extractor, self.item)
        }
    }
}

/// Outcome of [`ArchiveLedger::try_claim`].
pub enum Claim {
    /// The ledger already lists the item.
    Archived,
    /// Another job in this process is downloading the item right now.
    InFlight,
    Claimed(ClaimGuard),
}

/// Exclusive right to download one item. Committing records the item in the
/// ledger; dropping the guard without committing releases it again.
pub struct ClaimGuard {
    ledger: Arc<ArchiveLedger>,
    id: ArchiveId,
    committed: bool,
}

impl ClaimGuard {
    pub fn id(&self) -> &ArchiveId {
        &self.id
    }

    pub fn commit(mut self) -> Result<()> {
        let result = self.ledger.record(&self.id);
        self.ledger.state.lock().in_flight.remove(&self.id);
        self.committed = true;
        result
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if !self.committed {
            debug!(id = %self.id, "releasing unfinished archive claim");
            self.ledger.state.lock().in_flight.remove(&self.id);
        }
    }
}

#[derive(Default)]
struct LedgerState {
    entries: HashSet<ArchiveId>,
    in_flight: HashSet<ArchiveId>,
    /// Bytes of the file already folded into `entries`.
    read_offset: u64,
}

pub struct ArchiveLedger {
    path: PathBuf,
    state: Mutex<LedgerState>,
}

impl ArchiveLedger {
    /// Opens the ledger at `path`, creating the parent directory and an empty
    /// file when missing.
    pub fn open(path: &Path) -> Result<Arc<Self>> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|err| JobError::io(parent, err))?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| JobError::io(path, err))?;

        let ledger = Arc::new(Self {
            path: path.to_path_buf(),
            state: Mutex::new(LedgerState::default()),
        });
        {
            let mut state = ledger.state.lock();
            ledger.refresh(&mut state, true)?;
            debug!(
                path = %ledger.path.display(),
                entries = state.entries.len(),
                "opened download archive"
            );
        }
        Ok(ledger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, id: &ArchiveId) -> Result<bool> {
        let mut state = self.state.lock();
        self.refresh(&mut state, false)?;
        Ok(state.entries.contains(id))
    }

    /// Appends `id` unless it is already present.
    pub fn record(&self, id: &ArchiveId) -> Result<()> {
        let mut state = self.state.lock();
        self.refresh(&mut state, false)?;
        if state.entries.contains(id) {
            return Ok(());
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| JobError::io(&self.path, err))?;
        if !ends_with_newline(&mut file).map_err(|err| JobError::io(&self.path, err))? {
            writeln!(file).map_err(|err| JobError::io(&self.path, err))?;
        }
        writeln!(file, "{id}").map_err(|err| JobError::io(&self.path, err))?;
        state.entries.insert(id.clone());
        debug!(%id, "recorded in download archive");
        Ok(())
    }

    /// Atomically checks the ledger and reserves `id` for the caller.
    pub fn try_claim(self: &Arc<Self>, id: &ArchiveId) -> Result<Claim> {
        let mut state = self.state.lock();
        self.refresh(&mut state, false)?;
        if state.entries.contains(id) {
            return Ok(Claim::Archived);
        }
        if !state.in_flight.insert(id.clone()) {
            return Ok(Claim::InFlight);
        }
        Ok(Claim::Claimed(ClaimGuard {
            ledger: Arc::clone(self),
            id: id.clone(),
            committed: false,
        }))
    }

    pub fn len(&self) -> Result<usize> {
        let mut state = self.state.lock();
        self.refresh(&mut state, false)?;
        Ok(state.entries.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Folds lines appended since the last read into the in-memory set. A
    /// trailing line without newline is left for the next refresh since its
    /// writer may still be mid-append, unless `include_partial` is set.
    fn refresh(&self, state: &mut LedgerState, include_partial: bool) -> Result<()> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %self.path.display(), "download archive disappeared");
                state.entries.clear();
                state.read_offset = 0;
                return Ok(());
            }
            Err(err) => return Err(JobError::io(&self.path, err)),
        };
        let len = file
            .metadata()
            .map_err(|err| JobError::io(&self.path, err))?
            .len();
        if len < state.read_offset {
            debug!(path = %self.path.display(), "download archive shrank, rereading");
            state.entries.clear();
            state.read_offset = 0;
        }
        if len == state.read_offset {
            return Ok(());
        }

        file.seek(SeekFrom::Start(state.read_offset))
            .map_err(|err| JobError::io(&self.path, err))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|err| JobError::io(&self.path, err))?;
        let consumed = if include_partial {
            buf.len()
        } else {
            match buf.iter().rposition(|byte| *byte == b'\n') {
                Some(complete) => complete + 1,
                None => return Ok(()),
            }
        };

        let text = String::from_utf8_lossy(&buf[..consumed]);
        for line in text.lines() {
            if let Some(id) = ArchiveId::parse_line(line) {
                state.entries.insert(id);
            }
        }
        state.read_offset += consumed as u64;
        Ok(())
    }
}

/// True for an empty file or one whose last byte is `\n`.
fn ends_with_newline(file: &mut File) -> std::io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_missing_file_and_parent() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("archive.txt");
        let ledger = ArchiveLedger::open(&path)?;
        assert!(path.exists());
        assert!(ledger.is_empty()?);
        Ok(())
    }

    #[test]
    fn archive_roundtrip_loads_ids() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("archive.txt");
        fs::write(&path, "youtube alpha\n\n  Vimeo 12345  \nlegacy\n").unwrap();
        let ledger = ArchiveLedger::open(&path)?;
        assert!(ledger.contains(&ArchiveId::new("youtube", "alpha"))?);
        assert!(ledger.contains(&ArchiveId::new("vimeo", "12345"))?);
        assert!(ledger.contains(&ArchiveId::new("", "legacy"))?);
        assert_eq!(ledger.len()?, 3);
        Ok(())
    }

    #[test]
    fn unterminated_last_line_is_read_and_kept_intact() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("archive.txt");
        fs::write(&path, "youtube alpha").unwrap();
        let ledger = ArchiveLedger::open(&path)?;
        assert!(ledger.contains(&ArchiveId::new("youtube", "alpha"))?);

        ledger.record(&ArchiveId::new("youtube", "beta"))?;
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "youtube alpha\nyoutube beta\n"
        );
        assert_eq!(ledger.len()?, 2);
        assert_eq!(ArchiveLedger::open(&path)?.len()?, 2);
        Ok(())
    }

    #[test]
    fn record_twice_keeps_one_line() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("archive.txt");
        let ledger = ArchiveLedger::open(&path)?;
        let id = ArchiveId::new("YouTube", "abc");
        ledger.record(&id)?;
        ledger.record(&id)?;
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "youtube abc\n");
        Ok(())
    }

    #[test]
    fn lookups_see_lines_appended_by_another_writer() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("archive.txt");
        let ledger = ArchiveLedger::open(&path)?;
        let id = ArchiveId::new("youtube", "late");
        assert!(!ledger.contains(&id)?);

        let mut other = OpenOptions::new().append(true).open(&path).unwrap();
        write!(other, "youtube la").unwrap();
        assert!(!ledger.contains(&id)?, "partial line must not count");
        writeln!(other, "te").unwrap();
        assert!(ledger.contains(&id)?);
        Ok(())
    }

    #[test]
    fn claims_are_exclusive_until_released() -> Result<()> {
        let dir = tempdir().unwrap();
        let ledger = ArchiveLedger::open(&dir.path().join("archive.txt"))?;
        let id = ArchiveId::new("youtube", "dup");

        let Claim::Claimed(first) = ledger.try_claim(&id)? else {
            panic!("first claim should succeed");
        };
        assert!(matches!(ledger.try_claim(&id)?, Claim::InFlight));
        drop(first);

        let Claim::Claimed(second) = ledger.try_claim(&id)? else {
            panic!("released claim should be available again");
        };
        second.commit()?;
        assert!(matches!(ledger.try_claim(&id)?, Claim::Archived));
        assert!(ledger.contains(&id)?);
        Ok(())
    }

    #[test]
    fn from_url_drops_fragment_and_trailing_slash() {
        let id = ArchiveId::from_url("https://example.com/v1/#t=30");
        assert_eq!(id.to_string(), "url https://example.com/v1");
        assert_eq!(ArchiveId::parse_line(&id.to_string()), Some(id));
    }

    #[cfg(unix)]
    #[test]
    fn open_fails_for_unwritable_location() {
        let err = match ArchiveLedger::open(Path::new("/proc/mediagrab/archive.txt")) {
            Ok(_) => panic!("opening under /proc should fail"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), crate::error::ErrorKind::Io);
    }
}

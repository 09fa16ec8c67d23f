//! Session store.
//!
//! Every capture session owns one directory under the storage root:
//!
//! ```text
//! <root>/<session_id>/0.jpeg, 1.jpeg, ...
//! <root>/<session_id>/index.csv
//! ```
//!
//! Frame files are written once and never modified. The index is written once
//! per session, as a whole file swapped in by rename, so a reader sees either
//! no index or a complete one.
//!
//! Deleting a session while an export stream over it is open is the caller's
//! problem; the store takes no locks.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::export::{ExportRequest, ExportSelection, ExportStream};
use crate::index::{self, FrameMeta};

pub const INDEX_FILE: &str = "index.csv";
pub const FRAME_EXTENSION: &str = "jpeg";

#[derive(Clone, Debug)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Opens a store rooted at an existing, writable directory.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let access = |reason: &str| Error::Access {
            path: root.clone(),
            reason: reason.to_string(),
        };
        let meta = fs::metadata(&root).map_err(|e| access(&e.to_string()))?;
        if !meta.is_dir() {
            return Err(access("not a directory"));
        }
        if meta.permissions().readonly() || !is_writable(&root) {
            return Err(access("not writable"));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the directory for a new session. Never reuses an existing one.
    pub fn prepare(&self, session_id: &str) -> Result<()> {
        let dir = self.session_dir(session_id)?;
        match fs::create_dir(&dir) {
            Ok(()) => {
                log::debug!("storage: prepared session {}", session_id);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(Error::AlreadyExists(session_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn session_exists(&self, session_id: &str) -> Result<bool> {
        Ok(self.session_dir(session_id)?.is_dir())
    }

    pub fn store_frame(&self, session_id: &str, ordinal: usize, bytes: &[u8]) -> Result<()> {
        let dir = self.existing_session_dir(session_id)?;
        fs::write(dir.join(frame_file_name(ordinal)), bytes)?;
        Ok(())
    }

    /// Writes the complete index, replacing any earlier one.
    pub fn write_index(&self, session_id: &str, frames: &[FrameMeta]) -> Result<()> {
        let dir = self.existing_session_dir(session_id)?;
        write_atomic(&dir.join(INDEX_FILE), index::encode_index(frames).as_bytes())?;
        log::debug!(
            "storage: wrote index for session {} ({} frames)",
            session_id,
            frames.len()
        );
        Ok(())
    }

    /// Reads the index. A session still being captured has none yet and
    /// reports `NotFound`.
    pub fn read_index(&self, session_id: &str) -> Result<Vec<FrameMeta>> {
        let dir = self.existing_session_dir(session_id)?;
        let raw = match fs::read(dir.join(INDEX_FILE)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("index of session {session_id}")));
            }
            Err(e) => return Err(e.into()),
        };
        let text = String::from_utf8(raw).map_err(|e| {
            let valid = &e.as_bytes()[..e.utf8_error().valid_up_to()];
            Error::BadIndex {
                session: session_id.to_string(),
                line: valid.iter().filter(|b| **b == b'\n').count() + 1,
                reason: "not valid UTF-8".to_string(),
            }
        })?;
        index::parse_index(session_id, &text)
    }

    pub fn read_frame_meta(&self, session_id: &str, ordinal: usize) -> Result<FrameMeta> {
        self.read_index(session_id)?
            .get(ordinal)
            .copied()
            .ok_or_else(|| Error::frame_not_found(session_id, ordinal))
    }

    pub fn read_frame(&self, session_id: &str, ordinal: usize) -> Result<Vec<u8>> {
        let dir = self.existing_session_dir(session_id)?;
        match fs::read(dir.join(frame_file_name(ordinal))) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::frame_not_found(session_id, ordinal))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn frame_path(&self, session_id: &str, ordinal: usize) -> Result<PathBuf> {
        Ok(self.session_dir(session_id)?.join(frame_file_name(ordinal)))
    }

    /// Immediate subdirectories of the root whose names are valid session
    /// ids, in ascending order.
    pub fn list_sessions(&self) -> Result<Vec<String>> {
        let mut sessions = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) if validate_session_id(&name).is_ok() => sessions.push(name),
                Ok(name) => log::debug!("storage: skipping foreign directory {:?}", name),
                Err(name) => log::warn!("storage: skipping non UTF-8 directory {:?}", name),
            }
        }
        sessions.sort();
        Ok(sessions)
    }

    /// Removes every file of the session and then its directory.
    ///
    /// Not crash safe: an interrupted delete can leave a partial directory.
    pub fn delete_session(&self, session_id: &str) -> Result<()> {
        let dir = self.existing_session_dir(session_id)?;
        for entry in fs::read_dir(&dir)? {
            fs::remove_file(entry?.path())?;
        }
        fs::remove_dir(&dir)?;
        log::info!("storage: deleted session {}", session_id);
        Ok(())
    }

    /// Deletes every session, stopping at the first failure.
    pub fn clear(&self) -> Result<()> {
        for session_id in self.list_sessions()? {
            self.delete_session(&session_id)?;
        }
        Ok(())
    }

    /// Finds the session that was recording at absolute time `time` (µs).
    ///
    /// Sessions are checked in `list_sessions` order and the first one with a
    /// frame window containing `time` wins. Sessions without a readable index
    /// are skipped.
    pub fn find_session(&self, time: i64) -> Result<Option<String>> {
        for session_id in self.list_sessions()? {
            let frames = match self.read_index(&session_id) {
                Ok(frames) => frames,
                Err(err) => {
                    log::debug!("storage: lookup skips session {}: {}", session_id, err);
                    continue;
                }
            };
            if index::frame_containing(&frames, time).is_some() {
                return Ok(Some(session_id));
            }
        }
        Ok(None)
    }

    /// Resolves an HTTP level request into concrete frame ordinals.
    pub fn resolve_request(&self, session_id: &str, request: &ExportRequest) -> Result<ExportSelection> {
        match request {
            ExportRequest::FromOffset(offset) => Ok(ExportSelection::FromOffset(*offset)),
            ExportRequest::AtOffsets(targets) => {
                let frames = self.read_index(session_id)?;
                let ordinals = targets
                    .iter()
                    .map(|target| {
                        index::nearest_frame(&frames, *target).ok_or_else(|| {
                            Error::NotFound(format!(
                                "no frame near offset {target} in session {session_id}"
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(ExportSelection::Frames(ordinals))
            }
        }
    }

    /// Opens an export over a selection of this session's frames.
    pub fn open_export(&self, session_id: &str, selection: &ExportSelection) -> Result<ExportStream> {
        let frame_count = self.read_index(session_id)?.len();
        let dir = self.session_dir(session_id)?;

        let paths = match selection {
            ExportSelection::FromOffset(offset) => (*offset..frame_count)
                .map(|ordinal| dir.join(frame_file_name(ordinal)))
                .collect::<Vec<_>>(),
            ExportSelection::Frames(ordinals) => ordinals
                .iter()
                .map(|ordinal| {
                    if *ordinal < frame_count {
                        Ok(dir.join(frame_file_name(*ordinal)))
                    } else {
                        Err(Error::frame_not_found(session_id, *ordinal))
                    }
                })
                .collect::<Result<Vec<_>>>()?,
        };

        log::info!(
            "storage: export of session {} opened ({} of {} frames)",
            session_id,
            paths.len(),
            frame_count
        );
        ExportStream::open(paths)
    }

    pub fn open_export_request(&self, session_id: &str, request: &ExportRequest) -> Result<ExportStream> {
        let selection = self.resolve_request(session_id, request)?;
        self.open_export(session_id, &selection)
    }

    fn session_dir(&self, session_id: &str) -> Result<PathBuf> {
        validate_session_id(session_id)?;
        Ok(self.root.join(session_id))
    }

    fn existing_session_dir(&self, session_id: &str) -> Result<PathBuf> {
        let dir = self.session_dir(session_id)?;
        if !dir.is_dir() {
            return Err(Error::session_not_found(session_id));
        }
        Ok(dir)
    }
}

/// Session ids become directory names: `[A-Za-z0-9_-]+` only.
pub fn validate_session_id(session_id: &str) -> Result<()> {
    if session_id.is_empty() {
        return Err(Error::BadRequest("session id cannot be empty".to_string()));
    }
    if !session_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::BadRequest(
            "session id must be [A-Za-z0-9_-] only".to_string(),
        ));
    }
    Ok(())
}

pub fn frame_file_name(ordinal: usize) -> String {
    format!("{ordinal}.{FRAME_EXTENSION}")
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    let written = File::create(&tmp_path).and_then(|mut file| {
        file.write_all(data)?;
        file.sync_all()
    });
    if let Err(err) = written.and_then(|()| fs::rename(&tmp_path, path)) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}

#[cfg(unix)]
fn is_writable(path: &Path) -> bool {
    use std::os::unix::ffi::OsStrExt;

    let Ok(c_path) = std::ffi::CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call.
    unsafe { libc::access(c_path.as_ptr(), libc::W_OK) == 0 }
}

#[cfg(not(unix))]
fn is_writable(_path: &Path) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn open_requires_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Store::open(dir.path().join("missing")),
            Err(Error::Access { .. })
        ));
        let file = dir.path().join("plain");
        fs::write(&file, b"x").unwrap();
        assert!(matches!(Store::open(&file), Err(Error::Access { .. })));
    }

    #[test]
    fn prepare_refuses_existing_session() {
        let (_dir, store) = store();
        store.prepare("1529488179409").unwrap();
        assert!(matches!(
            store.prepare("1529488179409"),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn session_ids_cannot_escape_root() {
        let (_dir, store) = store();
        for bad in ["", "..", "a/b", "../etc", "x.y"] {
            assert!(
                matches!(store.prepare(bad), Err(Error::BadRequest(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn writes_require_prepared_session() {
        let (_dir, store) = store();
        assert!(store.store_frame("nope", 0, b"x").unwrap_err().is_not_found());
        assert!(store.write_index("nope", &[]).unwrap_err().is_not_found());
        assert!(store.read_frame("nope", 0).unwrap_err().is_not_found());
    }

    #[test]
    fn index_is_missing_until_written() {
        let (_dir, store) = store();
        store.prepare("live").unwrap();
        store.store_frame("live", 0, b"frame").unwrap();
        assert!(store.read_index("live").unwrap_err().is_not_found());

        store.write_index("live", &[FrameMeta::new(1, 2)]).unwrap();
        assert_eq!(store.read_index("live").unwrap(), vec![FrameMeta::new(1, 2)]);
        assert_eq!(store.read_frame_meta("live", 0).unwrap(), FrameMeta::new(1, 2));
        assert!(store.read_frame_meta("live", 1).unwrap_err().is_not_found());
    }

    #[test]
    fn corrupt_index_is_reported() {
        let (dir, store) = store();
        store.prepare("bad").unwrap();
        fs::write(dir.path().join("bad").join(INDEX_FILE), b"1,2\nthree,4\n").unwrap();
        assert!(matches!(
            store.read_index("bad"),
            Err(Error::BadIndex { line: 2, .. })
        ));
    }

    #[test]
    fn list_skips_plain_files_and_sorts() {
        let (dir, store) = store();
        store.prepare("b").unwrap();
        store.prepare("a").unwrap();
        fs::write(dir.path().join("stray.txt"), b"x").unwrap();
        assert_eq!(store.list_sessions().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn clear_leaves_foreign_directories_alone() {
        let (dir, store) = store();
        store.prepare("1700000000000").unwrap();
        store.prepare("zz").unwrap();
        fs::create_dir(dir.path().join("lost+found")).unwrap();

        assert_eq!(store.list_sessions().unwrap(), vec!["1700000000000", "zz"]);
        store.clear().unwrap();
        assert!(store.list_sessions().unwrap().is_empty());
        assert!(dir.path().join("lost+found").is_dir());
    }

    #[test]
    #[cfg(unix)]
    fn failed_index_write_removes_temp_file() {
        let (dir, store) = store();
        store.prepare("s").unwrap();
        // a non-empty directory in place of the index makes the rename fail
        let blocker = dir.path().join("s").join(INDEX_FILE);
        fs::create_dir(&blocker).unwrap();
        fs::write(blocker.join("keep"), b"x").unwrap();

        assert!(store.write_index("s", &[FrameMeta::new(0, 1)]).is_err());
        assert!(!dir.path().join("s").join("index.tmp").exists());
    }

    #[test]
    fn delete_removes_everything() {
        let (dir, store) = store();
        store.prepare("gone").unwrap();
        store.store_frame("gone", 0, b"x").unwrap();
        store.write_index("gone", &[FrameMeta::new(0, 1)]).unwrap();
        store.delete_session("gone").unwrap();
        assert!(!dir.path().join("gone").exists());
        assert!(store.delete_session("gone").unwrap_err().is_not_found());
    }
}

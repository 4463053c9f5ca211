use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use log::warn;

use crate::errors::IpcError;

pub const MAX_LOOKUP_DELAY_US: u64 = 2_500_000;

/// An open resource with a known length. Chunk reads are positioned so
/// concurrent requests for the same entry never share a cursor.
pub struct StoreEntry {
    file: File,
    len: u64,
}

impl StoreEntry {
    #[cfg(test)]
    pub(crate) fn from_parts(file: File, len: u64) -> StoreEntry {
        StoreEntry { file, len }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn read_chunk(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read_at(buf, offset)
    }
}

/// The backing-store boundary consumed by the cache workers. Resolution
/// failure and absence both collapse to "not found" at the wire.
pub trait Store: Send + Sync {
    fn resolve(&self, path: &str) -> Result<Option<StoreEntry>, IpcError>;
}

/// File-backed store driven by a map file: one `<request-path>
/// <local-file>` pair per line, `#` lines and blanks skipped.
pub struct FileStore {
    entries: HashMap<String, PathBuf>,
    lookup_delay: Duration,
}

impl FileStore {
    pub fn load(map_path: &Path, lookup_delay_us: u64) -> Result<FileStore, IpcError> {
        if lookup_delay_us > MAX_LOOKUP_DELAY_US {
            return Err(IpcError::Config(format!(
                "lookup delay must be at most {} us",
                MAX_LOOKUP_DELAY_US
            )));
        }
        let reader = BufReader::new(File::open(map_path)?);
        let mut entries = HashMap::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some(key), Some(local)) => {
                    entries.insert(key.to_string(), PathBuf::from(local));
                }
                _ => {
                    return Err(IpcError::Config(format!(
                        "{}:{}: expected `<path> <file>`",
                        map_path.display(),
                        lineno + 1
                    )));
                }
            }
        }
        Ok(FileStore {
            entries,
            lookup_delay: Duration::from_micros(lookup_delay_us),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Store for FileStore {
    fn resolve(&self, path: &str) -> Result<Option<StoreEntry>, IpcError> {
        if !self.lookup_delay.is_zero() {
            thread::sleep(self.lookup_delay);
        }
        let local = match self.entries.get(path) {
            Some(local) => local,
            None => return Ok(None),
        };
        let file = match File::open(local) {
            Ok(file) => file,
            Err(e) => {
                // A mapped-but-unreadable file is a resolution error, which
                // the protocol reports the same way as absence.
                warn!("store entry {} ({}) unreadable: {}", path, local.display(), e);
                return Ok(None);
            }
        };
        let len = file.metadata()?.len();
        Ok(Some(StoreEntry { file, len }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_file(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        path
    }

    #[test]
    fn load_resolve_and_read() {
        let dir = tempdir().unwrap();
        let data = write_file(dir.path(), "road.jpg", b"0123456789");
        let map = write_file(
            dir.path(),
            "locals.txt",
            format!(
                "# test map\n\n/courses/road.jpg {}\n",
                data.display()
            )
            .as_bytes(),
        );

        let store = FileStore::load(&map, 0).unwrap();
        assert_eq!(store.len(), 1);

        let entry = store.resolve("/courses/road.jpg").unwrap().unwrap();
        assert_eq!(entry.len(), 10);
        let mut buf = [0u8; 4];
        assert_eq!(entry.read_chunk(6, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"6789");

        assert!(store.resolve("/missing").unwrap().is_none());
    }

    #[test]
    fn malformed_map_line_is_a_config_error() {
        let dir = tempdir().unwrap();
        let map = write_file(dir.path(), "locals.txt", b"/only-a-key\n");
        assert!(matches!(
            FileStore::load(&map, 0),
            Err(IpcError::Config(_))
        ));
    }

    #[test]
    fn mapped_but_missing_file_reports_not_found() {
        let dir = tempdir().unwrap();
        let map = write_file(dir.path(), "locals.txt", b"/gone /nonexistent/file\n");
        let store = FileStore::load(&map, 0).unwrap();
        assert!(store.resolve("/gone").unwrap().is_none());
    }

    #[test]
    fn excessive_delay_is_rejected() {
        let dir = tempdir().unwrap();
        let map = write_file(dir.path(), "locals.txt", b"");
        assert!(matches!(
            FileStore::load(&map, MAX_LOOKUP_DELAY_US + 1),
            Err(IpcError::Config(_))
        ));
    }
}

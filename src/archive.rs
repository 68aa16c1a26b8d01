use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::PathBuf;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use fs2::FileExt;
use parking_lot::Mutex;

use crate::error::SyncError;
use crate::state::LocalTables;

const ARCHIVE_VERSION: u32 = 4;
const TABLES_FILE: &str = "tables.bin";
const LOCK_FILE: &str = "tables.lock";

/// Durable home of a workspace's local tables.
///
/// Implementations only need atomic whole-table reads and writes; transactions and
/// in-process exclusion are layered on top by `WorkspaceLock`.
pub trait LocalStateStore: Send + Sync {
    fn load(&self) -> Result<LocalTables, SyncError>;
    fn save(&self, tables: &LocalTables) -> Result<(), SyncError>;
}

/// Stores the tables in a single versioned bincode file.
#[derive(Debug)]
pub struct Archive {
    pub directory: PathBuf,
}

impl Archive {
    pub fn new(directory: PathBuf) -> Result<Self, io::Error> {
        // creates the archive directory
        if !directory.exists() {
            fs::create_dir_all(&directory)?;
        }
        Ok(Archive { directory })
    }

    pub fn tables_file(&self) -> PathBuf {
        self.directory.join(TABLES_FILE)
    }

    fn lock_file(&self) -> io::Result<File> {
        OpenOptions::new()
            .create(true)
            .write(true)
            .open(self.directory.join(LOCK_FILE))
    }
}

impl LocalStateStore for Archive {
    fn load(&self) -> Result<LocalTables, SyncError> {
        let lock = self.lock_file()?;
        FileExt::lock_shared(&lock)?;

        let path = self.tables_file();
        if !path.exists() {
            trace!("No archive at {:?}, starting empty", path);
            return Ok(LocalTables::default());
        }

        let mut reader = BufReader::new(File::open(&path)?);
        let tables = match read_tables(&mut reader) {
            Ok(tables) => tables,
            Err(ReadError::InvalidVersion(version)) => {
                warn!("Archive file {:?} using outdated version ({}), starting empty", path, version);
                LocalTables::default()
            }
            Err(e) => return Err(e.into()),
        };
        FileExt::unlock(&lock)?;
        Ok(tables)
    }

    fn save(&self, tables: &LocalTables) -> Result<(), SyncError> {
        let lock = self.lock_file()?;
        FileExt::lock_exclusive(&lock)?;

        let path = self.tables_file();
        let temp = path.with_extension("bin.tmp");
        debug!(
            "Writing archive file {:?} ({} local versions, {} unacknowledged removals, {} pending changes)",
            path,
            tables.versions.len(),
            tables.versions.removed().count(),
            tables.pending.len()
        );
        {
            let mut writer = BufWriter::new(File::create(&temp)?);
            write_tables(&mut writer, tables)?;
            let file = writer.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
        }
        fs::rename(&temp, &path)?;
        FileExt::unlock(&lock)?;
        Ok(())
    }
}

/// Keeps the tables in memory; used for server workspaces and offline tooling.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<LocalTables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_tables(tables: LocalTables) -> Self {
        MemoryStore {
            tables: Mutex::new(tables),
        }
    }

    pub fn snapshot(&self) -> LocalTables {
        self.tables.lock().clone()
    }
}

impl LocalStateStore for MemoryStore {
    fn load(&self) -> Result<LocalTables, SyncError> {
        Ok(self.tables.lock().clone())
    }

    fn save(&self, tables: &LocalTables) -> Result<(), SyncError> {
        *self.tables.lock() = tables.clone();
        Ok(())
    }
}

#[derive(Debug)]
pub enum ReadError {
    InvalidVersion(u32),
    IoError(io::Error),
    DeserializeError(bincode::Error),
}

impl From<bincode::Error> for ReadError {
    fn from(e: bincode::Error) -> Self {
        ReadError::DeserializeError(e)
    }
}

impl From<io::Error> for ReadError {
    fn from(e: io::Error) -> Self {
        ReadError::IoError(e)
    }
}

#[derive(Debug)]
pub enum WriteError {
    IoError(io::Error),
    SerializeError(bincode::Error),
}

impl From<bincode::Error> for WriteError {
    fn from(e: bincode::Error) -> Self {
        WriteError::SerializeError(e)
    }
}

impl From<io::Error> for WriteError {
    fn from(e: io::Error) -> Self {
        WriteError::IoError(e)
    }
}

/// reads the tables from a binary stream
fn read_tables<R: io::Read>(read: &mut R) -> Result<LocalTables, ReadError> {
    let version = read.read_u32::<LittleEndian>()?;
    if version != ARCHIVE_VERSION {
        return Err(ReadError::InvalidVersion(version));
    }
    Ok(bincode::deserialize_from(read)?)
}

// writes the tables to a binary stream
fn write_tables<W: Write>(out: &mut W, tables: &LocalTables) -> Result<(), WriteError> {
    out.write_u32::<LittleEndian>(ARCHIVE_VERSION)?;
    bincode::serialize_into(&mut *out, tables)?;
    out.flush()?;
    Ok(())
}

//! Baseline files: cached copies of committed content, named by baseline id.
//!
//! Layout: `<root>/<n>/<id>.gz` for gzip content and `<root>/<n>/<id>.rw` for raw content,
//! where `n` is the first byte of the id modulo 16. Downloads in progress use `<id>.tmp`.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::config::BaselineOptions;
use crate::error::{DescribeIoError, SyncError};
use crate::server::{ItemSpec, QueryItemsOptions, VersionControlServer, VersionSpec};
use crate::state::{BaselineId, HashValue};
use crate::transfer::{ContentType, DownloadOutput, DownloadSpec, FileOutput, HashOutput, TransferRetryCoordinator};
use crate::util::{md5_copy, md5_file, run_bounded, Cancellation};

const PARTITIONS: u8 = 16;
const GZIP_EXTENSION: &str = "gz";
const RAW_EXTENSION: &str = "rw";
const TEMP_EXTENSION: &str = "tmp";

/// Where the content of a baseline comes from.
#[derive(Clone, Debug, PartialEq)]
pub enum BaselineSource {
    /// The committed content is already on disk; `fallback` is used if it no longer matches.
    LocalItem { path: PathBuf, fallback: Box<BaselineSource> },
    /// Download from a known query string.
    Download(String),
    /// Ask the server for the download query string of an item at a version first.
    Lookup { server_item: String, version: i32 },
    /// Nothing to fetch; any stale file for the id is removed.
    None,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BaselineRequest {
    pub baseline_id: BaselineId,
    pub source: BaselineSource,
    pub expected_hash: Option<HashValue>,
    pub expected_length: Option<u64>,
}

impl BaselineRequest {
    pub fn new(baseline_id: BaselineId, source: BaselineSource, expected_hash: Option<HashValue>) -> Self {
        BaselineRequest {
            baseline_id,
            source,
            expected_hash,
            expected_length: None,
        }
    }

    pub fn expected_length(mut self, length: Option<u64>) -> Self {
        self.expected_length = length;
        self
    }
}

pub struct BaselineManager {
    options: BaselineOptions,
    transfers: Arc<TransferRetryCoordinator>,
    server: Arc<dyn VersionControlServer>,
    freed: Mutex<BTreeSet<BaselineId>>,
    // held while resolving or maintaining the folder
    content_lock: Mutex<()>,
}

impl BaselineManager {
    pub fn new(
        options: BaselineOptions,
        transfers: Arc<TransferRetryCoordinator>,
        server: Arc<dyn VersionControlServer>,
    ) -> Self {
        BaselineManager {
            options,
            transfers,
            server,
            freed: Mutex::new(BTreeSet::new()),
            content_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.options.root
    }

    pub fn partition_folder(&self, id: &BaselineId) -> PathBuf {
        self.options.root.join((id.as_bytes()[0] % PARTITIONS).to_string())
    }

    pub fn baseline_path(&self, id: &BaselineId, compressed: bool) -> PathBuf {
        let extension = if compressed { GZIP_EXTENSION } else { RAW_EXTENSION };
        self.partition_folder(id).join(format!("{}.{}", id, extension))
    }

    fn temp_path(&self, id: &BaselineId) -> PathBuf {
        self.partition_folder(id).join(format!("{}.{}", id, TEMP_EXTENSION))
    }

    /// The file holding the baseline, and whether it is gzip-compressed.
    pub fn find_baseline(&self, id: &BaselineId) -> Option<(PathBuf, bool)> {
        [true, false]
            .iter()
            .map(|&compressed| (self.baseline_path(id, compressed), compressed))
            .find(|(path, _)| path.is_file())
    }

    pub fn has_baseline(&self, id: &BaselineId) -> bool {
        self.find_baseline(id).is_some()
    }

    /// Fetches the content of every request, at most `max_concurrency` at a time.
    ///
    /// All requests are attempted; the first failure is returned.
    pub fn resolve(&self, requests: Vec<BaselineRequest>, cancel: &Cancellation) -> Result<(), SyncError> {
        if requests.is_empty() {
            return Ok(());
        }
        let _content = self.content_lock.lock();
        debug!("Resolving {} baselines", requests.len());
        let results = run_bounded(requests, self.options.max_concurrency, |request| {
            self.resolve_one(request, cancel)
        });
        results.into_iter().collect::<Result<Vec<()>, SyncError>>()?;
        Ok(())
    }

    fn resolve_one(&self, mut request: BaselineRequest, cancel: &Cancellation) -> Result<(), SyncError> {
        let folder = self.partition_folder(&request.baseline_id);
        fs::create_dir_all(&folder).describe(|| format!("creating baseline folder {:?}", folder))?;

        let mut source = request.source.clone();
        loop {
            source = match source {
                BaselineSource::LocalItem { path, fallback } => {
                    if path.is_file() && self.copy_from_local(&request, &path)? {
                        return Ok(());
                    }
                    debug!("Local copy {:?} does not match baseline {}", path, request.baseline_id);
                    *fallback
                }
                BaselineSource::Download(query) => {
                    return self.download(&request, &query, cancel);
                }
                BaselineSource::Lookup { server_item, version } => {
                    let (query, hash, length) = self.look_up(&server_item, version)?;
                    if request.expected_hash.is_none() {
                        request.expected_hash = hash;
                    }
                    if request.expected_length.is_none() {
                        request.expected_length = Some(length);
                    }
                    BaselineSource::Download(query)
                }
                BaselineSource::None => {
                    trace!("No source for baseline {}, removing it", request.baseline_id);
                    return self.delete_baseline(&request.baseline_id);
                }
            };
        }
    }

    /// Asks the server where to download an item at a version, and what the content should hash to.
    fn look_up(&self, server_item: &str, version: i32) -> Result<(String, Option<HashValue>, u64), SyncError> {
        let results = self.server.query_items(
            &[ItemSpec::single(server_item)],
            VersionSpec::Changeset(version),
            QueryItemsOptions::for_download(),
        )?;
        results
            .into_iter()
            .flatten()
            .find_map(|item| {
                let (hash, length) = (item.content_hash, item.content_length);
                item.download_url.map(|url| (url, hash, length))
            })
            .ok_or_else(|| SyncError::server_fault(format!("no download URL for {};{}", server_item, version)))
    }

    /// Copies a matching local file into the baseline folder. Returns false if it doesn't match.
    fn copy_from_local(&self, request: &BaselineRequest, path: &Path) -> Result<bool, SyncError> {
        let (hash, length) = md5_file(path).describe(|| format!("hashing {:?}", path))?;
        if request.expected_hash.map_or(false, |expected| expected != hash)
            || request.expected_length.map_or(false, |expected| expected != length)
        {
            return Ok(false);
        }

        let id = &request.baseline_id;
        let compressed = self.options.compress_local_copies;
        let temp = self.temp_path(id);
        {
            let mut source = File::open(path).describe(|| format!("opening {:?}", path))?;
            let target = File::create(&temp).describe(|| format!("creating {:?}", temp))?;
            if compressed {
                let mut encoder = GzEncoder::new(target, Compression::default());
                io::copy(&mut source, &mut encoder)?;
                encoder.finish()?.sync_all()?;
            } else {
                let mut target = target;
                io::copy(&mut source, &mut target)?;
                target.sync_all()?;
            }
        }
        self.install(id, &temp, compressed)?;
        debug!("Baseline {} copied from {:?}", id, path);
        Ok(true)
    }

    fn download(&self, request: &BaselineRequest, query: &str, cancel: &Cancellation) -> Result<(), SyncError> {
        let id = &request.baseline_id;
        let temp = self.temp_path(id);
        let mut wire = FileOutput::create(&temp, false).describe(|| format!("creating {:?}", temp))?;
        let mut content = HashOutput::new(true);

        let result = {
            let mut outputs: [&mut dyn DownloadOutput; 2] = [&mut wire, &mut content];
            self.transfers.download(&DownloadSpec::new(query), &mut outputs, cancel)
        };
        if let Err(e) = result {
            if let Err(delete) = wire.delete() {
                warn!("Could not remove partial baseline {:?}: {}", temp, delete);
            }
            return Err(e.into());
        }

        let (hash, length) = content.hash();
        let mismatch = match (request.expected_hash, request.expected_length) {
            (Some(expected), _) if expected != hash => Some(format!("hash mismatch for {}", query)),
            (_, Some(expected)) if expected != length => {
                Some(format!("expected {} bytes, received {}", expected, length))
            }
            _ => None,
        };
        if let Some(reason) = mismatch {
            error!("Downloaded baseline {} is corrupt: {}", id, reason);
            if let Err(delete) = wire.delete() {
                warn!("Could not remove corrupt baseline {:?}: {}", temp, delete);
            }
            return Err(SyncError::BaselineCorruption { baseline: *id, reason });
        }

        let compressed = wire.content_type() == Some(ContentType::Gzip);
        drop(wire);
        self.install(id, &temp, compressed)?;
        debug!("Baseline {} downloaded ({} bytes)", id, length);
        Ok(())
    }

    /// Moves a finished temp file into place, replacing any other copy of the baseline.
    fn install(&self, id: &BaselineId, temp: &Path, compressed: bool) -> Result<(), SyncError> {
        let other = self.baseline_path(id, !compressed);
        if other.exists() {
            fs::remove_file(&other).describe(|| format!("removing {:?}", other))?;
        }
        let target = self.baseline_path(id, compressed);
        fs::rename(temp, &target).describe(|| format!("moving {:?} to {:?}", temp, target))
    }

    /// Marks a baseline for deletion at the next maintenance pass or queue close.
    pub fn free_baseline(&self, id: BaselineId) {
        trace!("Freeing baseline {}", id);
        self.freed.lock().insert(id);
    }

    /// Takes a freed baseline back. Returns true if it had been freed.
    pub fn reclaim(&self, id: &BaselineId) -> bool {
        self.freed.lock().remove(id)
    }

    pub fn is_freed(&self, id: &BaselineId) -> bool {
        self.freed.lock().contains(id)
    }

    pub fn delete_baseline(&self, id: &BaselineId) -> Result<(), SyncError> {
        for &compressed in &[true, false] {
            let path = self.baseline_path(id, compressed);
            match fs::remove_file(&path) {
                Ok(()) => trace!("Deleted baseline {:?}", path),
                Err(ref e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).describe(|| format!("deleting baseline {:?}", path)),
            }
        }
        Ok(())
    }

    /// Deletes every freed baseline, logging failures instead of returning them.
    pub fn delete_freed(&self) -> usize {
        let freed: Vec<BaselineId> = std::mem::take(&mut *self.freed.lock()).into_iter().collect();
        let mut deleted = 0;
        for id in freed {
            match self.delete_baseline(&id) {
                Ok(()) => deleted += 1,
                Err(e) => warn!("Could not delete freed baseline {}: {}", id, e),
            }
        }
        deleted
    }

    /// Tidies the baseline folder.
    ///
    /// Removes leftover temp files, moves files that sit in the wrong partition, and deletes
    /// freed baselines. Must not run inside a table transaction.
    pub fn maintenance(&self) -> Result<(), SyncError> {
        let _content = self.content_lock.lock();
        let root = &self.options.root;
        if !root.is_dir() {
            return Ok(());
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(root).min_depth(1).max_depth(2) {
            let entry = entry?;
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }

        for path in files {
            let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if extension == TEMP_EXTENSION {
                debug!("Removing stale download {:?}", path);
                fs::remove_file(&path).describe(|| format!("removing {:?}", path))?;
                continue;
            }
            if extension != GZIP_EXTENSION && extension != RAW_EXTENSION {
                continue;
            }
            let id = match path.file_stem().and_then(|s| s.to_str()).map(Uuid::parse_str) {
                Some(Ok(id)) => id,
                _ => {
                    trace!("Ignoring {:?} in the baseline folder", path);
                    continue;
                }
            };
            let expected = self.partition_folder(&id);
            if path.parent() != Some(expected.as_path()) {
                let target = self.baseline_path(&id, extension == GZIP_EXTENSION);
                info!("Relocating baseline {:?} to {:?}", path, target);
                fs::create_dir_all(&expected).describe(|| format!("creating {:?}", expected))?;
                fs::rename(&path, &target).describe(|| format!("moving {:?}", path))?;
            }
        }

        let deleted = self.delete_freed();
        debug!("Baseline maintenance deleted {} freed baselines", deleted);
        Ok(())
    }

    /// Restores `target` from a baseline, checking its length and hash.
    ///
    /// A baseline that doesn't match is deleted.
    pub fn copy_to_target(
        &self,
        id: &BaselineId,
        target: &Path,
        expected_length: Option<u64>,
        expected_hash: Option<HashValue>,
    ) -> Result<(), SyncError> {
        let (path, compressed) = match self.find_baseline(id) {
            Some(found) => found,
            None => return Err(SyncError::MissingBaseline(target.to_path_buf())),
        };

        let mut temp_name = target.as_os_str().to_owned();
        temp_name.push(".tmp");
        let temp = PathBuf::from(temp_name);

        let copied = {
            let file = File::open(&path).describe(|| format!("opening baseline {:?}", path))?;
            let mut reader: Box<dyn Read> = if compressed {
                Box::new(GzDecoder::new(file))
            } else {
                Box::new(file)
            };
            let mut out = File::create(&temp).describe(|| format!("creating {:?}", temp))?;
            md5_copy(&mut reader, &mut out)
        };

        let reason = match copied {
            Ok((hash, length)) => {
                if expected_length.map_or(false, |expected| expected != length) {
                    Some(format!("expected {} bytes, found {}", expected_length.unwrap_or(0), length))
                } else if expected_hash.map_or(false, |expected| expected != hash) {
                    Some("hash mismatch".to_owned())
                } else {
                    None
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::InvalidData || e.kind() == io::ErrorKind::InvalidInput => {
                Some(format!("unreadable: {}", e))
            }
            Err(e) => {
                let _ = fs::remove_file(&temp);
                return Err(e).describe(|| format!("restoring {:?} from baseline", target));
            }
        };

        if let Some(reason) = reason {
            let _ = fs::remove_file(&temp);
            error!("Baseline {} for {:?} is corrupt ({}), deleting it", id, target, reason);
            self.delete_baseline(id)?;
            return Err(SyncError::BaselineCorruption { baseline: *id, reason });
        }

        fs::rename(&temp, target).describe(|| format!("moving {:?} to {:?}", temp, target))
    }
}

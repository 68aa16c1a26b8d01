use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::hash::BuildHasherDefault;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread;

use crossbeam::channel;
use fnv::FnvHasher;
use md5::{Digest, Md5};

use crate::state::HashValue;

pub type FnvHashMap<K, T> = HashMap<K, T, BuildHasherDefault<FnvHasher>>;
pub type FnvHashSet<K> = HashSet<K, BuildHasherDefault<FnvHasher>>;

/// Server paths compare case-insensitively; this is the canonical key form.
pub fn server_path_key(path: &str) -> String {
    path.to_lowercase()
}

pub fn server_paths_equal(a: &str, b: &str) -> bool {
    a.len() == b.len() && a.to_lowercase() == b.to_lowercase()
}

pub fn local_paths_equal(a: &str, b: &str) -> bool {
    Path::new(a) == Path::new(b)
}

/// Orders server paths so that parents sort before their children,
/// comparing one `/`-separated segment at a time, ignoring case.
pub fn compare_top_down(a: &str, b: &str) -> Ordering {
    let mut left = a.split('/').map(str::to_lowercase);
    let mut right = b.split('/').map(str::to_lowercase);
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) => match l.cmp(&r) {
                Ordering::Equal => continue,
                other => return other,
            },
        }
    }
}

pub fn md5_bytes(bytes: &[u8]) -> HashValue {
    Md5::digest(bytes)
}

/// Hashes a reader to the end, returning the hash and the number of bytes read.
pub fn md5_reader<R: Read>(reader: &mut R) -> io::Result<(HashValue, u64)> {
    md5_copy(reader, &mut io::sink())
}

/// Copies a reader into a writer, hashing the bytes on the way through.
pub fn md5_copy<R: Read, W: Write>(reader: &mut R, writer: &mut W) -> io::Result<(HashValue, u64)> {
    let mut hasher = Md5::new();
    let mut buffer = vec![0; 64 * 1024];
    let mut total = 0u64;
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        writer.write_all(&buffer[..read])?;
        total += read as u64;
    }
    writer.flush()?;
    Ok((hasher.finalize(), total))
}

pub fn md5_file(path: &Path) -> io::Result<(HashValue, u64)> {
    let mut file = File::open(path)?;
    md5_reader(&mut file)
}

/// A cooperative cancellation flag shared between a caller and long-running work.
#[derive(Clone, Debug, Default)]
pub struct Cancellation {
    cancelled: Arc<AtomicBool>,
}

impl Cancellation {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::SeqCst)
    }
}

/// Runs `work` over every item on at most `max_workers` threads.
///
/// Results come back in input order. Remaining items are still processed after a failure;
/// callers decide which error wins.
pub fn run_bounded<T, R, F>(items: Vec<T>, max_workers: usize, work: F) -> Vec<R>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Sync,
{
    let count = items.len();
    if count == 0 {
        return Vec::new();
    }
    let workers = max_workers.max(1).min(count);
    if workers == 1 {
        return items.into_iter().map(|item| work(item)).collect();
    }

    let (job_tx, job_rx) = channel::bounded::<(usize, T)>(count);
    let (result_tx, result_rx) = channel::bounded::<(usize, R)>(count);
    for job in items.into_iter().enumerate() {
        // capacity equals the number of jobs, so this never blocks
        let _ = job_tx.send(job);
    }
    drop(job_tx);

    thread::scope(|scope| {
        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            let work = &work;
            scope.spawn(move || {
                for (index, item) in job_rx.iter() {
                    if result_tx.send((index, work(item))).is_err() {
                        break;
                    }
                }
            });
        }
    });
    drop(result_tx);

    let mut results: Vec<(usize, R)> = result_rx.iter().collect();
    results.sort_by_key(|&(index, _)| index);
    results.into_iter().map(|(_, result)| result).collect()
}

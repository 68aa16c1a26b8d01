//! Single-attempt content transfers over HTTP.
//!
//! A `ContentTransferClient` makes exactly one attempt and classifies what went wrong;
//! `retry::TransferRetryCoordinator` decides what to do about it.

use std::error::Error;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use md5::{Digest, Md5};
use regex::Regex;

use crate::config::TransferOptions;
use crate::state::HashValue;
use crate::util::Cancellation;

pub mod retry;

pub use self::retry::TransferRetryCoordinator;

const DOWNLOAD_ENDPOINT: &str = "download";
const UPLOAD_ENDPOINT: &str = "upload";

/// How a single transfer attempt failed.
#[derive(Debug)]
pub enum TransferError {
    /// The peer reset the connection.
    ConnectionReset(String),
    Timeout(String),
    /// The download proxy could not serve the request.
    ProxyUnavailable(String),
    Http { status: u16, url: String },
    UnsupportedContentType(String),
    /// An output was already written to and cannot be rewound for another attempt.
    ResetUnsupported,
    Io(io::Error),
    Cancelled,
}

/// The failures worth another attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryKind {
    SocketReset,
    Timeout,
    Proxy,
}

impl RetryKind {
    /// Socket-class failures may have left partial content in the outputs.
    pub fn is_socket(self) -> bool {
        self != RetryKind::Proxy
    }
}

impl TransferError {
    pub fn retry_kind(&self) -> Option<RetryKind> {
        match *self {
            TransferError::ConnectionReset(_) => Some(RetryKind::SocketReset),
            TransferError::Timeout(_) => Some(RetryKind::Timeout),
            TransferError::ProxyUnavailable(_) => Some(RetryKind::Proxy),
            _ => None,
        }
    }

    /// Classifies an io error raised while talking to the server.
    pub fn from_io(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                TransferError::ConnectionReset(e.to_string())
            }
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TransferError::Timeout(e.to_string()),
            _ if is_connection_reset(&e.to_string()) => TransferError::ConnectionReset(e.to_string()),
            _ => TransferError::Io(e),
        }
    }
}

fn is_connection_reset(message: &str) -> bool {
    static CONNECTION_RESET: OnceLock<Option<Regex>> = OnceLock::new();
    CONNECTION_RESET
        .get_or_init(|| Regex::new(r"(?i)connection\s+(was\s+)?reset").ok())
        .as_ref()
        .map_or(false, |re| re.is_match(message))
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            TransferError::ConnectionReset(ref msg) => write!(f, "connection reset: {}", msg),
            TransferError::Timeout(ref msg) => write!(f, "timed out: {}", msg),
            TransferError::ProxyUnavailable(ref msg) => write!(f, "download proxy unavailable: {}", msg),
            TransferError::Http { status, ref url } => write!(f, "HTTP status {} from {}", status, url),
            TransferError::UnsupportedContentType(ref ct) => write!(f, "unsupported content type {:?}", ct),
            TransferError::ResetUnsupported => write!(f, "download output cannot be reset for a retry"),
            TransferError::Io(ref e) => write!(f, "io error: {}", e),
            TransferError::Cancelled => write!(f, "transfer cancelled"),
        }
    }
}

impl Error for TransferError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match *self {
            TransferError::Io(ref e) => Some(e),
            _ => None,
        }
    }
}

/// Encoding of a download response body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentType {
    /// Bytes as stored; zero-length bodies are always treated as binary.
    Binary,
    Gzip,
}

impl ContentType {
    pub fn from_header(header: Option<&str>, content_length: Option<u64>) -> Result<Self, TransferError> {
        if content_length == Some(0) {
            return Ok(ContentType::Binary);
        }
        let header = match header {
            Some(header) => header,
            None => return Ok(ContentType::Binary),
        };
        let mime = header.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
        match mime.as_str() {
            "" | "application/octet-stream" => Ok(ContentType::Binary),
            "application/gzip" | "application/x-gzip" => Ok(ContentType::Gzip),
            _ => Err(TransferError::UnsupportedContentType(header.to_owned())),
        }
    }
}

/// Identifies the content to download; the query string comes from the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadSpec {
    pub query: String,
}

impl DownloadSpec {
    pub fn new<S: Into<String>>(query: S) -> Self {
        DownloadSpec { query: query.into() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadSpec {
    pub params: Vec<(String, String)>,
    pub compress: bool,
}

impl UploadSpec {
    pub fn new(params: Vec<(String, String)>) -> Self {
        UploadSpec { params, compress: false }
    }

    pub fn compressed(mut self) -> Self {
        self.compress = true;
        self
    }
}

/// A destination for downloaded bytes.
pub trait DownloadOutput: Send {
    /// True if gzip content should be decoded before it reaches this output.
    fn auto_decompress(&self) -> bool;

    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Rewinds the output so another attempt can start from the first byte.
    fn reset(&mut self) -> Result<(), TransferError>;

    /// Called once per attempt, before any bytes are written.
    fn set_content_type(&mut self, _content_type: ContentType) {}

    fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct FileOutput {
    path: PathBuf,
    file: BufWriter<File>,
    auto_decompress: bool,
    content_type: Option<ContentType>,
}

impl FileOutput {
    pub fn create(path: &Path, auto_decompress: bool) -> io::Result<Self> {
        Ok(FileOutput {
            path: path.to_path_buf(),
            file: BufWriter::new(File::create(path)?),
            auto_decompress,
            content_type: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The content type of the last attempt.
    pub fn content_type(&self) -> Option<ContentType> {
        self.content_type
    }

    /// Closes and removes the file.
    pub fn delete(self) -> io::Result<()> {
        let FileOutput { path, file, .. } = self;
        drop(file);
        fs::remove_file(path)
    }
}

impl DownloadOutput for FileOutput {
    fn auto_decompress(&self) -> bool {
        self.auto_decompress
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file.write_all(bytes)
    }

    fn reset(&mut self) -> Result<(), TransferError> {
        // buffered bytes of the failed attempt must land before the truncate
        self.file.flush().map_err(TransferError::Io)?;
        self.file = BufWriter::new(File::create(&self.path).map_err(TransferError::Io)?);
        self.content_type = None;
        Ok(())
    }

    fn set_content_type(&mut self, content_type: ContentType) {
        self.content_type = Some(content_type);
    }

    fn finish(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_all()
    }
}

#[derive(Debug, Default)]
pub struct MemoryOutput {
    bytes: Vec<u8>,
    auto_decompress: bool,
}

impl MemoryOutput {
    pub fn new(auto_decompress: bool) -> Self {
        MemoryOutput {
            bytes: Vec::new(),
            auto_decompress,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl DownloadOutput for MemoryOutput {
    fn auto_decompress(&self) -> bool {
        self.auto_decompress
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.bytes.extend_from_slice(bytes);
        Ok(())
    }

    fn reset(&mut self) -> Result<(), TransferError> {
        self.bytes.clear();
        Ok(())
    }
}

/// Forwards bytes to a caller-owned stream. It can only be reset before the first byte.
pub struct StreamOutput<W> {
    writer: W,
    written: u64,
    auto_decompress: bool,
}

impl<W: Write + Send> StreamOutput<W> {
    pub fn new(writer: W, auto_decompress: bool) -> Self {
        StreamOutput {
            writer,
            written: 0,
            auto_decompress,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> DownloadOutput for StreamOutput<W> {
    fn auto_decompress(&self) -> bool {
        self.auto_decompress
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes)?;
        self.written += bytes.len() as u64;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), TransferError> {
        if self.written == 0 {
            Ok(())
        } else {
            Err(TransferError::ResetUnsupported)
        }
    }

    fn finish(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Hashes the content instead of storing it.
#[derive(Clone)]
pub struct HashOutput {
    hasher: Md5,
    length: u64,
    auto_decompress: bool,
}

impl HashOutput {
    pub fn new(auto_decompress: bool) -> Self {
        HashOutput {
            hasher: Md5::new(),
            length: 0,
            auto_decompress,
        }
    }

    /// The hash and length of everything written since the last reset.
    pub fn hash(&self) -> (HashValue, u64) {
        (self.hasher.clone().finalize(), self.length)
    }
}

impl DownloadOutput for HashOutput {
    fn auto_decompress(&self) -> bool {
        self.auto_decompress
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.hasher.update(bytes);
        self.length += bytes.len() as u64;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), TransferError> {
        self.hasher = Md5::new();
        self.length = 0;
        Ok(())
    }
}

/// Copies the wire bytes to the outputs that want them as they are read.
struct TeeReader<'o, 'a, 'b, R> {
    inner: R,
    wire: &'o mut [&'a mut (dyn DownloadOutput + 'b)],
}

impl<'o, 'a, 'b, R: Read> Read for TeeReader<'o, 'a, 'b, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        for output in self.wire.iter_mut() {
            output.write_bytes(&buf[..read])?;
        }
        Ok(read)
    }
}

fn copy_chunks<'a, 'b, R: Read>(
    mut reader: R,
    outputs: &mut [&'a mut (dyn DownloadOutput + 'b)],
    cancel: &Cancellation,
    buffer_size: usize,
) -> Result<u64, TransferError> {
    let mut buffer = vec![0; buffer_size.max(1)];
    let mut total = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let read = match reader.read(&mut buffer) {
            Ok(0) => return Ok(total),
            Ok(read) => read,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransferError::from_io(e)),
        };
        for output in outputs.iter_mut() {
            output.write_bytes(&buffer[..read]).map_err(TransferError::Io)?;
        }
        total += read as u64;
    }
}

/// Streams a response body into every output in a single pass.
///
/// Raw bodies go to every output unchanged. A gzip body goes unchanged to the outputs that
/// do not auto-decompress, and decoded to the ones that do.
pub fn copy_response<'a, 'b, R: Read>(
    body: R,
    content_type: ContentType,
    outputs: &mut [&'a mut (dyn DownloadOutput + 'b)],
    cancel: &Cancellation,
    buffer_size: usize,
) -> Result<(), TransferError> {
    for output in outputs.iter_mut() {
        output.set_content_type(content_type);
    }

    let needs_gunzip = content_type == ContentType::Gzip && outputs.iter().any(|o| o.auto_decompress());
    if needs_gunzip {
        let (mut normal, mut wire): (Vec<_>, Vec<_>) = outputs
            .iter_mut()
            .map(|output| &mut **output)
            .partition(|output| output.auto_decompress());
        let tee = TeeReader {
            inner: body,
            wire: &mut wire,
        };
        let mut decoder = GzDecoder::new(tee);
        let decoded = copy_chunks(&mut decoder, &mut normal, cancel, buffer_size)?;
        // whatever follows the gzip stream still belongs to the wire copy
        let mut tee = decoder.into_inner();
        io::copy(&mut tee, &mut io::sink()).map_err(TransferError::from_io)?;
        trace!("Decoded {} bytes of gzip content", decoded);
    } else {
        let copied = copy_chunks(body, outputs, cancel, buffer_size)?;
        trace!("Copied {} bytes of {:?} content", copied, content_type);
    }

    for output in outputs.iter_mut() {
        output.finish().map_err(TransferError::Io)?;
    }
    Ok(())
}

/// Makes one attempt at a transfer; knows nothing about retries.
pub trait ContentTransferClient: Send + Sync {
    fn download(
        &self,
        spec: &DownloadSpec,
        use_proxy: bool,
        outputs: &mut [&mut dyn DownloadOutput],
        cancel: &Cancellation,
    ) -> Result<(), TransferError>;

    fn upload(&self, spec: &UploadSpec, content: &[u8]) -> Result<(), TransferError>;
}

pub struct HttpTransferClient {
    agent: ureq::Agent,
    server_url: String,
    proxy_url: Option<String>,
    buffer_size: usize,
}

impl HttpTransferClient {
    pub fn new<S: Into<String>>(server_url: S, options: &TransferOptions) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(options.connect_timeout)
            .timeout_read(options.read_timeout)
            .build();
        HttpTransferClient {
            agent,
            server_url: server_url.into(),
            proxy_url: options.download_proxy.clone(),
            buffer_size: options.buffer_size,
        }
    }

    fn endpoint(&self, use_proxy: bool, endpoint: &str) -> String {
        let base = match self.proxy_url {
            Some(ref proxy) if use_proxy => proxy,
            _ => &self.server_url,
        };
        format!("{}/{}", base.trim_end_matches('/'), endpoint)
    }
}

fn classify(error: ureq::Error, url: &str, use_proxy: bool) -> TransferError {
    match error {
        ureq::Error::Status(status, _) if use_proxy && status >= 500 => {
            TransferError::ProxyUnavailable(format!("HTTP status {} from {}", status, url))
        }
        ureq::Error::Status(status, _) => TransferError::Http {
            status,
            url: url.to_owned(),
        },
        ureq::Error::Transport(transport) => {
            let message = transport.to_string();
            match transport.kind() {
                ureq::ErrorKind::Dns | ureq::ErrorKind::ConnectionFailed | ureq::ErrorKind::ProxyConnect
                    if use_proxy =>
                {
                    TransferError::ProxyUnavailable(message)
                }
                _ => match transport.source().and_then(|e| e.downcast_ref::<io::Error>()) {
                    Some(io) => TransferError::from_io(io::Error::new(io.kind(), message)),
                    None => TransferError::from_io(io::Error::new(io::ErrorKind::Other, message)),
                },
            }
        }
    }
}

impl ContentTransferClient for HttpTransferClient {
    fn download(
        &self,
        spec: &DownloadSpec,
        use_proxy: bool,
        outputs: &mut [&mut dyn DownloadOutput],
        cancel: &Cancellation,
    ) -> Result<(), TransferError> {
        let url = format!("{}?{}", self.endpoint(use_proxy, DOWNLOAD_ENDPOINT), spec.query);
        debug!("GET {}", url);
        let response = self
            .agent
            .get(&url)
            .call()
            .map_err(|e| classify(e, &url, use_proxy))?;

        let length = response.header("Content-Length").and_then(|v| v.trim().parse::<u64>().ok());
        let content_type = ContentType::from_header(response.header("Content-Type"), length)?;
        copy_response(response.into_reader(), content_type, outputs, cancel, self.buffer_size)
    }

    fn upload(&self, spec: &UploadSpec, content: &[u8]) -> Result<(), TransferError> {
        let url = self.endpoint(false, UPLOAD_ENDPOINT);
        let mut request = self.agent.post(&url);
        for (name, value) in &spec.params {
            request = request.query(name, value);
        }

        let result = if spec.compress {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(content).map_err(TransferError::Io)?;
            let body = encoder.finish().map_err(TransferError::Io)?;
            debug!("POST {} ({} bytes, {} compressed)", url, content.len(), body.len());
            request.set("Content-Type", "application/gzip").send_bytes(&body)
        } else {
            debug!("POST {} ({} bytes)", url, content.len());
            request.set("Content-Type", "application/octet-stream").send_bytes(content)
        };
        result.map(|_| ()).map_err(|e| classify(e, &url, false))
    }
}

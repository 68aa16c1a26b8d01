use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::TransferOptions;
use crate::events::{EventListener, NonFatalError};
use crate::transfer::{
    ContentTransferClient, DownloadOutput, DownloadSpec, FileOutput, MemoryOutput, RetryKind, TransferError,
    UploadSpec,
};
use crate::util::Cancellation;

/// Wraps a `ContentTransferClient` with classified retries and exponential backoff.
///
/// Socket resets and timeouts are retried up to `max_retry` attempts, resetting every output
/// before each retry. A proxy failure turns the proxy off for the rest of the session and is
/// retried once against the server; a second one is fatal.
pub struct TransferRetryCoordinator {
    client: Arc<dyn ContentTransferClient>,
    options: TransferOptions,
    events: Arc<dyn EventListener>,
    proxy_disabled: AtomicBool,
}

impl TransferRetryCoordinator {
    pub fn new(client: Arc<dyn ContentTransferClient>, options: TransferOptions, events: Arc<dyn EventListener>) -> Self {
        TransferRetryCoordinator {
            client,
            options,
            events,
            proxy_disabled: AtomicBool::new(false),
        }
    }

    pub fn options(&self) -> &TransferOptions {
        &self.options
    }

    /// True while downloads still go through the configured proxy.
    pub fn proxy_enabled(&self) -> bool {
        self.options.download_proxy.is_some() && !self.proxy_disabled.load(Ordering::SeqCst)
    }

    fn disable_proxy(&self, cause: &TransferError) {
        warn!("Download proxy failed ({}), disabling it for this session", cause);
        self.proxy_disabled.store(true, Ordering::SeqCst);
        self.events.non_fatal_error(&NonFatalError::DownloadProxyFailed {
            message: cause.to_string(),
        });
        self.events.non_fatal_error(&NonFatalError::DownloadProxyDisabled);
    }

    fn wait(&self, delay: Duration) {
        if delay > Duration::from_millis(0) {
            thread::sleep(delay);
        }
    }

    pub fn download(
        &self,
        spec: &DownloadSpec,
        outputs: &mut [&mut dyn DownloadOutput],
        cancel: &Cancellation,
    ) -> Result<(), TransferError> {
        let max_retry = self.options.max_retry.max(1);
        let mut attempt = 0;
        let mut needs_reset = false;
        let mut proxy_failed = false;

        loop {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            if needs_reset {
                for output in outputs.iter_mut() {
                    output.reset()?;
                }
            }

            let use_proxy = self.proxy_enabled();
            attempt += 1;
            info!(
                "Downloading {} (attempt {} of {}{})",
                spec.query,
                attempt,
                max_retry,
                if use_proxy { ", through proxy" } else { "" }
            );

            let error = match self.client.download(spec, use_proxy, outputs, cancel) {
                Ok(()) => return Ok(()),
                Err(error) => error,
            };

            match error.retry_kind() {
                Some(RetryKind::Proxy) => {
                    if proxy_failed || !use_proxy {
                        error!("Download of {} failed through proxy again: {}", spec.query, error);
                        return Err(error);
                    }
                    proxy_failed = true;
                    self.disable_proxy(&error);
                    // the proxy attempt does not count against the retry budget
                    attempt -= 1;
                }
                Some(kind) => {
                    warn!("Download of {} failed ({:?}): {}", spec.query, kind, error);
                    if attempt >= max_retry {
                        error!("Giving up on {} after {} attempts", spec.query, attempt);
                        return Err(error);
                    }
                    needs_reset = needs_reset || kind.is_socket();
                    let delay = self.options.backoff(attempt);
                    info!("Retrying {} in {:?}", spec.query, delay);
                    self.events
                        .download_retrying(&spec.query, attempt, delay.as_millis() as u64);
                    self.wait(delay);
                }
                None => {
                    warn!("Download of {} failed: {}", spec.query, error);
                    return Err(error);
                }
            }
        }
    }

    /// Downloads into `path`, decoding gzip content. A partial file is removed on failure.
    pub fn download_to_file(&self, spec: &DownloadSpec, path: &Path, cancel: &Cancellation) -> Result<(), TransferError> {
        let mut output = FileOutput::create(path, true).map_err(TransferError::Io)?;
        let result = {
            let mut outputs: [&mut dyn DownloadOutput; 1] = [&mut output];
            self.download(spec, &mut outputs, cancel)
        };
        if let Err(e) = result {
            if let Err(delete) = output.delete() {
                warn!("Could not remove partial download {:?}: {}", path, delete);
            }
            return Err(e);
        }
        Ok(())
    }

    pub fn download_to_memory(&self, spec: &DownloadSpec, cancel: &Cancellation) -> Result<Vec<u8>, TransferError> {
        let mut output = MemoryOutput::new(true);
        {
            let mut outputs: [&mut dyn DownloadOutput; 1] = [&mut output];
            self.download(spec, &mut outputs, cancel)?;
        }
        Ok(output.into_bytes())
    }

    pub fn upload(&self, spec: &UploadSpec, content: &[u8]) -> Result<(), TransferError> {
        let max_retry = self.options.max_retry.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match self.client.upload(spec, content) {
                Ok(()) => return Ok(()),
                Err(error) => error,
            };
            match error.retry_kind() {
                Some(kind) if kind.is_socket() && attempt < max_retry => {
                    warn!("Upload failed ({:?}): {}", kind, error);
                    let delay = self.options.backoff(attempt);
                    info!("Retrying upload in {:?}", delay);
                    self.wait(delay);
                }
                _ => {
                    warn!("Upload failed after {} attempts: {}", attempt, error);
                    return Err(error);
                }
            }
        }
    }
}

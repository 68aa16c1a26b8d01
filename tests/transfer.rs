extern crate tidewater;

mod common;

use std::env;
use std::io::Write;
use std::sync::atomic::Ordering;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;

use tidewater::config::MAX_RETRY_ENV;
use tidewater::transfer::{ContentType, DownloadOutput, DownloadSpec, MemoryOutput, StreamOutput, UploadSpec};
use tidewater::util::Cancellation;
use tidewater::{NonFatalError, TransferError, TransferOptions, WorkspaceLocation};

use common::{transfer_options, Fixture, Step};

const QUERY: &str = "type=rsa&sfid=42";

fn proxied() -> TransferOptions {
    TransferOptions {
        download_proxy: Some("http://proxy.local:8081".to_owned()),
        ..transfer_options()
    }
}

fn gzip(content: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(content).unwrap();
    encoder.finish().unwrap()
}

#[test]
fn test_resets_are_retried_from_the_first_byte() {
    let fixture = Fixture::new(WorkspaceLocation::Local);
    fixture.transfer.push(Step::Reset(b"par".to_vec()));
    fixture.transfer.push(Step::Reset(b"partial co".to_vec()));
    fixture.transfer.serve(QUERY, ContentType::Binary, b"partial content".to_vec());

    let bytes = fixture
        .coordinator
        .download_to_memory(&DownloadSpec::new(QUERY), &Cancellation::new())
        .unwrap();
    assert_eq!(bytes, b"partial content".to_vec());
    assert_eq!(fixture.transfer.call_count(), 3);
    assert_eq!(*fixture.events.retries.lock(), vec![(1, 0), (2, 0)]);
}

#[test]
fn test_timeouts_are_retried() {
    let fixture = Fixture::new(WorkspaceLocation::Local);
    fixture.transfer.push(Step::Timeout);
    fixture.transfer.serve(QUERY, ContentType::Binary, b"late".to_vec());

    let bytes = fixture
        .coordinator
        .download_to_memory(&DownloadSpec::new(QUERY), &Cancellation::new())
        .unwrap();
    assert_eq!(bytes, b"late".to_vec());
    assert_eq!(fixture.transfer.call_count(), 2);
}

#[test]
fn test_exhausted_resets_are_fatal() {
    let fixture = Fixture::new(WorkspaceLocation::Local);
    for _ in 0..3 {
        fixture.transfer.push(Step::Reset(Vec::new()));
    }
    fixture.transfer.serve(QUERY, ContentType::Binary, b"never reached".to_vec());

    let result = fixture
        .coordinator
        .download_to_memory(&DownloadSpec::new(QUERY), &Cancellation::new());
    match result {
        Err(TransferError::ConnectionReset(_)) => {}
        other => panic!("expected a connection reset, got {:?}", other),
    }
    assert_eq!(fixture.transfer.call_count(), 3);
}

#[test]
fn test_retry_count_comes_from_options() {
    let mut options = transfer_options();
    options.max_retry = 5;
    let fixture = Fixture::with_options(WorkspaceLocation::Local, options);
    for _ in 0..4 {
        fixture.transfer.push(Step::Timeout);
    }
    fixture.transfer.serve(QUERY, ContentType::Binary, b"fifth".to_vec());

    let bytes = fixture
        .coordinator
        .download_to_memory(&DownloadSpec::new(QUERY), &Cancellation::new())
        .unwrap();
    assert_eq!(bytes, b"fifth".to_vec());
    assert_eq!(fixture.events.retries.lock().len(), 4);
}

#[test]
fn test_written_stream_cannot_be_retried() {
    let fixture = Fixture::new(WorkspaceLocation::Local);
    fixture.transfer.push(Step::Reset(b"xx".to_vec()));
    fixture.transfer.serve(QUERY, ContentType::Binary, b"content".to_vec());

    let mut stream = StreamOutput::new(Vec::new(), true);
    let result = {
        let mut outputs: [&mut dyn DownloadOutput; 1] = [&mut stream];
        fixture
            .coordinator
            .download(&DownloadSpec::new(QUERY), &mut outputs, &Cancellation::new())
    };
    match result {
        Err(TransferError::ResetUnsupported) => {}
        other => panic!("expected the reset to be refused, got {:?}", other),
    }
    assert_eq!(fixture.transfer.call_count(), 1);
    assert_eq!(stream.into_inner(), b"xx".to_vec());
}

#[test]
fn test_second_proxy_failure_is_fatal() {
    let fixture = Fixture::with_options(WorkspaceLocation::Local, proxied());
    assert!(fixture.coordinator.proxy_enabled());
    fixture.transfer.push(Step::Proxy);
    fixture.transfer.push(Step::Proxy);

    let result = fixture
        .coordinator
        .download_to_memory(&DownloadSpec::new(QUERY), &Cancellation::new());
    match result {
        Err(TransferError::ProxyUnavailable(_)) => {}
        other => panic!("expected the proxy failure, got {:?}", other),
    }

    let calls: Vec<bool> = fixture.transfer.calls.lock().iter().map(|&(_, proxy)| proxy).collect();
    assert_eq!(calls, vec![true, false]);
    assert!(!fixture.coordinator.proxy_enabled());

    let errors = fixture.events.errors.lock();
    assert_eq!(errors.len(), 2);
    match errors[0] {
        NonFatalError::DownloadProxyFailed { .. } => {}
        ref other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(errors[1], NonFatalError::DownloadProxyDisabled);
}

#[test]
fn test_proxy_stays_disabled_after_failure() {
    let fixture = Fixture::with_options(WorkspaceLocation::Local, proxied());
    fixture.transfer.push(Step::Proxy);
    fixture.transfer.serve(QUERY, ContentType::Binary, b"from the server".to_vec());

    let cancel = Cancellation::new();
    let bytes = fixture
        .coordinator
        .download_to_memory(&DownloadSpec::new(QUERY), &cancel)
        .unwrap();
    assert_eq!(bytes, b"from the server".to_vec());
    assert!(fixture.events.retries.lock().is_empty());

    fixture
        .coordinator
        .download_to_memory(&DownloadSpec::new(QUERY), &cancel)
        .unwrap();
    let calls: Vec<bool> = fixture.transfer.calls.lock().iter().map(|&(_, proxy)| proxy).collect();
    assert_eq!(calls, vec![true, false, false]);
}

#[test]
fn test_http_errors_are_not_retried() {
    let fixture = Fixture::new(WorkspaceLocation::Local);
    fixture.transfer.push(Step::Http(500));
    fixture.transfer.serve(QUERY, ContentType::Binary, b"content".to_vec());

    let result = fixture
        .coordinator
        .download_to_memory(&DownloadSpec::new(QUERY), &Cancellation::new());
    match result {
        Err(TransferError::Http { status: 500, .. }) => {}
        other => panic!("expected HTTP 500, got {:?}", other),
    }
    assert_eq!(fixture.transfer.call_count(), 1);
}

#[test]
fn test_backoff_doubles() {
    let options = TransferOptions::default();
    assert_eq!(options.backoff(1), Duration::from_secs(10));
    assert_eq!(options.backoff(2), Duration::from_secs(20));
    assert_eq!(options.backoff(3), Duration::from_secs(40));
}

#[test]
fn test_retry_count_from_environment() {
    env::set_var(MAX_RETRY_ENV, "5");
    assert_eq!(TransferOptions::from_env().max_retry, 5);
    env::set_var(MAX_RETRY_ENV, "many");
    assert_eq!(TransferOptions::from_env().max_retry, 3);
    env::remove_var(MAX_RETRY_ENV);
    assert_eq!(TransferOptions::from_env().max_retry, 3);
}

#[test]
fn test_failed_file_download_leaves_nothing() {
    let fixture = Fixture::new(WorkspaceLocation::Local);
    for _ in 0..3 {
        fixture.transfer.push(Step::Reset(b"half".to_vec()));
    }
    let path = fixture.dir.path().join("download.bin");

    let result = fixture
        .coordinator
        .download_to_file(&DownloadSpec::new(QUERY), &path, &Cancellation::new());
    assert!(result.is_err());
    assert!(!path.exists());
}

#[test]
fn test_file_download_decodes_gzip() {
    let fixture = Fixture::new(WorkspaceLocation::Local);
    let content = b"line one\nline two\n".repeat(50);
    fixture.transfer.push(Step::Reset(b"\x1f\x8b".to_vec()));
    fixture.transfer.serve(QUERY, ContentType::Gzip, gzip(&content));
    let path = fixture.dir.path().join("download.txt");

    fixture
        .coordinator
        .download_to_file(&DownloadSpec::new(QUERY), &path, &Cancellation::new())
        .unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), content);
}

#[test]
fn test_gzip_reaches_outputs_in_their_own_form() {
    let fixture = Fixture::new(WorkspaceLocation::Local);
    let content = b"compressible ".repeat(100);
    let wire = gzip(&content);
    fixture.transfer.serve(QUERY, ContentType::Gzip, wire.clone());

    let mut decoded = MemoryOutput::new(true);
    let mut raw = MemoryOutput::new(false);
    {
        let mut outputs: [&mut dyn DownloadOutput; 2] = [&mut decoded, &mut raw];
        fixture
            .coordinator
            .download(&DownloadSpec::new(QUERY), &mut outputs, &Cancellation::new())
            .unwrap();
    }
    assert_eq!(decoded.bytes(), &content[..]);
    assert_eq!(raw.bytes(), &wire[..]);
}

#[test]
fn test_uploads_retry_socket_failures() {
    let fixture = Fixture::new(WorkspaceLocation::Local);
    let spec = UploadSpec::new(vec![("item".to_owned(), "$/p/a.txt".to_owned())]).compressed();

    fixture.transfer.upload_resets.store(2, Ordering::SeqCst);
    fixture.coordinator.upload(&spec, b"payload").unwrap();
    assert_eq!(*fixture.transfer.uploads.lock(), vec![b"payload".to_vec()]);

    fixture.transfer.upload_resets.store(5, Ordering::SeqCst);
    assert!(fixture.coordinator.upload(&spec, b"payload").is_err());
}

#[test]
fn test_cancelled_download_makes_no_attempt() {
    let fixture = Fixture::new(WorkspaceLocation::Local);
    fixture.transfer.serve(QUERY, ContentType::Binary, b"content".to_vec());
    let cancel = Cancellation::new();
    cancel.cancel();

    match fixture.coordinator.download_to_memory(&DownloadSpec::new(QUERY), &cancel) {
        Err(TransferError::Cancelled) => {}
        other => panic!("expected cancellation, got {:?}", other),
    }
    assert_eq!(fixture.transfer.call_count(), 0);
}

mod common;

use std::sync::Arc;

use tokio::sync::mpsc;

use common::{checksum_of, pattern, Harness, URL};
use media_writer::catalog::{Checksum, ChecksumAlgorithm};
use media_writer::download::{DownloadEvent, DownloadRequest, SourceError, TaskStatus};
use media_writer::error::DownloadError;
use media_writer::utils::part_path;

fn request(harness: &Harness, data: &[u8], checksum: Option<Checksum>) -> DownloadRequest {
    DownloadRequest {
        url: URL.to_string(),
        destination: harness.downloads().join("image.img.xz"),
        expected_size: data.len() as u64,
        checksum,
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<DownloadEvent>) -> Vec<DownloadEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_complete_download_is_checked_and_renamed() {
    let data = pattern(300_000);
    let harness = Harness::new(data.clone());
    let request = request(&harness, &data, Some(checksum_of(&data)));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let path = harness.engine().start(request.clone(), tx).join().await.unwrap();

    assert_eq!(path, request.destination);
    assert_eq!(std::fs::read(&path).unwrap(), data);
    assert!(!part_path(&path).exists());

    let events = drain(&mut rx);
    assert_eq!(events.first(), Some(&DownloadEvent::Started { offset: 0, total: data.len() as u64 }));
    assert_eq!(events.last(), Some(&DownloadEvent::Checking));
}

#[tokio::test]
async fn test_dropped_connections_resume_byte_identical() {
    let data = pattern(1_000_000);
    let harness = Harness::new(data.clone());
    harness.source.drop_at(250_000);
    harness.source.drop_at(700_000);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let path = harness
        .engine()
        .start(request(&harness, &data, Some(checksum_of(&data))), tx)
        .join()
        .await
        .unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), data);
    assert_eq!(harness.source.fetches(), vec![0, 250_000, 700_000]);
    let resumes: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, DownloadEvent::Resuming { .. }))
        .collect();
    assert_eq!(
        resumes,
        vec![
            DownloadEvent::Resuming { offset: 250_000, attempt: 1 },
            DownloadEvent::Resuming { offset: 700_000, attempt: 1 },
        ]
    );
}

#[tokio::test]
async fn test_full_response_to_range_request_restarts() {
    let data = pattern(400_000);
    let harness = Harness::new(data.clone());
    harness.source.drop_at(100_000);
    harness.source.ignore_range();
    let (tx, _rx) = mpsc::unbounded_channel();

    let path = harness
        .engine()
        .start(request(&harness, &data, Some(checksum_of(&data))), tx)
        .join()
        .await
        .unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), data);
    assert_eq!(harness.source.fetches(), vec![0, 100_000]);
}

#[tokio::test]
async fn test_checksum_mismatch_deletes_the_image() {
    let data = pattern(100_000);
    let harness = Harness::new(data.clone());
    let wrong = Checksum::new(ChecksumAlgorithm::Sha256, &"0".repeat(64)).unwrap();
    let request = request(&harness, &data, Some(wrong));
    let (tx, _rx) = mpsc::unbounded_channel();

    let err = harness.engine().start(request.clone(), tx).join().await.unwrap_err();

    assert!(matches!(err, DownloadError::Corrupted { .. }));
    assert!(!request.destination.exists());
    assert!(!part_path(&request.destination).exists());
}

#[tokio::test]
async fn test_exhausted_resumes_keep_the_partial_file() {
    let data = pattern(200_000);
    let harness = Harness::new(data.clone());
    harness.source.always_drop_at(Some(80_000));
    let request = request(&harness, &data, Some(checksum_of(&data)));
    let (tx, _rx) = mpsc::unbounded_channel();

    let err = harness.engine().start(request.clone(), tx).join().await.unwrap_err();
    assert!(matches!(err, DownloadError::ConnectionFailed { attempts: 3, .. }));

    let part = part_path(&request.destination);
    assert_eq!(std::fs::metadata(&part).unwrap().len(), 80_000);

    // The next attempt picks up where the last one stopped
    harness.source.always_drop_at(None);
    let (tx, _rx) = mpsc::unbounded_channel();
    let path = harness.engine().start(request, tx).join().await.unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), data);
    assert_eq!(harness.source.fetches().last(), Some(&80_000));
}

#[tokio::test]
async fn test_connect_timeout_is_terminal() {
    let data = pattern(10_000);
    let harness = Harness::new(data.clone());
    harness.source.refuse(SourceError::Timeout("connect".to_string()));
    let (tx, _rx) = mpsc::unbounded_channel();

    let err = harness
        .engine()
        .start(request(&harness, &data, None), tx)
        .join()
        .await
        .unwrap_err();

    assert!(matches!(err, DownloadError::ConnectionTimedOut(_)));
    assert_eq!(harness.source.fetches().len(), 1);
}

#[tokio::test]
async fn test_server_rejection() {
    let data = pattern(10_000);
    let harness = Harness::new(data.clone());
    harness.source.respond_with(404);
    let (tx, _rx) = mpsc::unbounded_channel();

    let err = harness
        .engine()
        .start(request(&harness, &data, None), tx)
        .join()
        .await
        .unwrap_err();
    assert!(matches!(err, DownloadError::ServerRejected(404)));
}

#[tokio::test]
async fn test_range_not_satisfiable_at_full_size_completes() {
    let data = pattern(50_000);
    let harness = Harness::new(data.clone());
    let mut request = request(&harness, &data, Some(checksum_of(&data)));
    request.expected_size = 0;
    std::fs::create_dir_all(harness.downloads()).unwrap();
    std::fs::write(part_path(&request.destination), &data).unwrap();
    let (tx, _rx) = mpsc::unbounded_channel();

    let path = harness.engine().start(request, tx).join().await.unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), data);
    assert_eq!(harness.source.fetches(), vec![data.len() as u64]);
}

#[tokio::test]
async fn test_pause_and_resume() {
    let data = pattern(100_000);
    let harness = Harness::new(data.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();

    let handle = harness.engine().start(request(&harness, &data, None), tx);
    handle.pause();
    assert_eq!(rx.recv().await, Some(DownloadEvent::Started { offset: 0, total: data.len() as u64 }));
    assert_eq!(rx.recv().await, Some(DownloadEvent::Paused));
    assert_eq!(handle.task().status, TaskStatus::Paused);
    assert!(harness.source.fetches().is_empty());

    handle.resume();
    let path = handle.join().await.unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), data);
    assert_eq!(rx.recv().await, Some(DownloadEvent::Resumed));
}

#[tokio::test]
async fn test_cancel_discards_the_partial_file() {
    let data = pattern(100_000);
    let harness = Harness::new(data.clone());
    let request = request(&harness, &data, None);
    let (tx, _rx) = mpsc::unbounded_channel();

    let handle = harness.engine().start(request.clone(), tx);
    handle.cancel();
    let err = handle.join().await.unwrap_err();

    assert!(matches!(err, DownloadError::Cancelled));
    assert!(!part_path(&request.destination).exists());
    assert!(!request.destination.exists());
}

#[tokio::test]
async fn test_insufficient_space_is_reported_up_front() {
    let data = pattern(100_000);
    let harness = Harness::new(data.clone());
    let engine = harness.engine().with_space_probe(Arc::new(|_| Some(1_000)));
    let (tx, _rx) = mpsc::unbounded_channel();

    let err = engine
        .start(request(&harness, &data, None), tx)
        .join()
        .await
        .unwrap_err();
    assert!(matches!(err, DownloadError::OutOfSpace { available: 1_000, .. }));
    assert!(harness.source.fetches().is_empty());
}

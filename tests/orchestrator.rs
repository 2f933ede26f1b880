mod common;

use tokio::sync::broadcast::{self, error::TryRecvError};

use common::{eventually, gzip, pattern, remote_variant, xz, Harness, URL};
use media_writer::catalog::{Checksum, ChecksumAlgorithm, ContainerType, Variant};
use media_writer::devices::RestoreStatus;
use media_writer::error::{FailureKind, OrchestratorError, PrimaryAction};
use media_writer::helper::HelperLauncher;
use media_writer::orchestrator::{restore_drive, Orchestrator, OrchestratorEvent, VariantStatus};

use VariantStatus::*;

const GZ_URL: &str = "https://images.example.org/dl/board/image.img.gz";
const MIB: u64 = 1024 * 1024;

fn drain(events: &mut broadcast::Receiver<OrchestratorEvent>) -> Vec<OrchestratorEvent> {
    let mut out = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => out.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => return out,
        }
    }
}

fn statuses(events: &[OrchestratorEvent]) -> Vec<VariantStatus> {
    events
        .iter()
        .filter_map(|e| match e {
            OrchestratorEvent::StatusChanged { to, .. } => Some(*to),
            _ => None,
        })
        .collect()
}

fn failure_kind(result: Result<(), OrchestratorError>) -> FailureKind {
    match result {
        Err(OrchestratorError::Failed(failure)) => failure.kind,
        other => panic!("expected a failure, got {:?}", other),
    }
}

fn gz_variant(image: &[u8]) -> (Vec<u8>, Variant) {
    let payload = gzip(image);
    let variant = remote_variant(GZ_URL, &payload, ContainerType::RawGz, Some(image.len() as u64));
    (payload, variant)
}

#[tokio::test]
async fn test_gzip_image_is_downloaded_written_and_verified() {
    let image = pattern(3 * MIB as usize);
    let (payload, variant) = gz_variant(&image);
    let harness = Harness::new(payload);
    let drive = harness.add_drive("sdb", 6 * MIB).await;
    let orchestrator = harness.orchestrator(variant);
    let mut events = orchestrator.subscribe();

    assert_eq!(orchestrator.status(), Preparing);
    orchestrator.download().await.unwrap();
    assert!(orchestrator.can_write_now());
    orchestrator.write(&drive).await.unwrap();

    assert_eq!(
        statuses(&drain(&mut events)),
        [Downloading, CheckingDownload, ReadyToWrite, Writing, CheckingWrittenData, Finished]
    );
    let contents = harness.backend.read_contents("sdb").unwrap();
    assert_eq!(&contents[..image.len()], &image[..]);
    assert!(!harness.backend.is_locked("sdb"));
    assert!(!harness.drives.is_reserved("sdb"));
    assert_eq!(harness.drives.last_restorable().unwrap().id, "sdb");

    orchestrator.restore(&drive).await.unwrap();
    assert_eq!(harness.drives.drive("sdb").unwrap().restore_status, RestoreStatus::Restored);
    assert!(harness.drives.last_restorable().is_none());
}

#[tokio::test]
async fn test_too_small_drive_fails_before_any_byte_is_written() {
    let image = pattern(3 * MIB as usize);
    let (payload, variant) = gz_variant(&image);
    let harness = Harness::new(payload);
    let drive = harness.add_drive("sdb", MIB).await;
    let orchestrator = harness.orchestrator(variant);
    let mut events = orchestrator.subscribe();

    orchestrator.download().await.unwrap();
    let kind = failure_kind(orchestrator.write(&drive).await);

    assert_eq!(kind, FailureKind::DriveTooSmall);
    assert_eq!(kind.primary_action(), PrimaryAction::Close);
    assert_eq!(
        statuses(&drain(&mut events)),
        [Downloading, CheckingDownload, ReadyToWrite, WriteFailed]
    );
    let contents = harness.backend.read_contents("sdb").unwrap();
    assert!(contents.iter().all(|b| *b == 0));
    assert!(!harness.drives.is_reserved("sdb"));
}

#[tokio::test]
async fn test_larger_drive_can_be_written_after_too_small_one() {
    let image = pattern(3 * MIB as usize);
    let (payload, variant) = gz_variant(&image);
    let harness = Harness::new(payload);
    let small = harness.add_drive("sdb", MIB).await;
    let orchestrator = harness.orchestrator(variant);

    orchestrator.download().await.unwrap();
    assert_eq!(failure_kind(orchestrator.write(&small).await), FailureKind::DriveTooSmall);
    assert_eq!(orchestrator.status(), WriteFailed);
    assert!(matches!(
        orchestrator.retry().await,
        Err(OrchestratorError::NotReady(WriteFailed))
    ));

    let large = harness.add_drive("sdc", 6 * MIB).await;
    assert!(orchestrator.can_write_now());
    let mut events = orchestrator.subscribe();
    orchestrator.write(&large).await.unwrap();

    assert_eq!(
        statuses(&drain(&mut events)),
        [ReadyToWrite, Writing, CheckingWrittenData, Finished]
    );
    assert!(orchestrator.snapshot().failure.is_none());
    let contents = harness.backend.read_contents("sdc").unwrap();
    assert_eq!(&contents[..image.len()], &image[..]);
}

#[tokio::test]
async fn test_image_shorter_than_declared_is_written_data_corrupted() {
    let image = pattern(2 * MIB as usize);
    let payload = gzip(&image);
    let variant = remote_variant(GZ_URL, &payload, ContainerType::RawGz, Some(3 * MIB));
    let harness = Harness::new(payload);
    let drive = harness.add_drive("sdb", 6 * MIB).await;
    let orchestrator = harness.orchestrator(variant);

    orchestrator.download().await.unwrap();
    let kind = failure_kind(orchestrator.write(&drive).await);

    assert_eq!(kind, FailureKind::WrittenDataCorrupted);
    assert_eq!(orchestrator.status(), WriteFailed);
    assert!(!harness.backend.is_locked("sdb"));
    assert!(!harness.drives.is_reserved("sdb"));
}

#[tokio::test]
async fn test_interrupted_download_resumes_once() {
    let image = pattern(2 * MIB as usize);
    let payload = xz(&image);
    let variant = remote_variant(URL, &payload, ContainerType::RawXz, Some(image.len() as u64));
    let cut = payload.len() as u64 * 4 / 10;
    let harness = Harness::new(payload.clone());
    harness.source.drop_at(cut);
    let orchestrator = harness.orchestrator(variant);
    let mut events = orchestrator.subscribe();

    orchestrator.download().await.unwrap();

    let events = drain(&mut events);
    let resumes: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, OrchestratorEvent::Resuming { .. }))
        .collect();
    assert_eq!(resumes, [&OrchestratorEvent::Resuming { offset: cut, attempt: 1 }]);
    assert_eq!(statuses(&events), [Downloading, CheckingDownload, ReadyToWrite]);
    assert_eq!(harness.source.fetches(), vec![0, cut]);
    assert_eq!(std::fs::read(orchestrator.image_path()).unwrap(), payload);
}

#[tokio::test]
async fn test_drive_removed_mid_write_then_retry_waits_for_a_drive() {
    let image = pattern(3 * MIB as usize);
    let payload = xz(&image);
    let variant = remote_variant(URL, &payload, ContainerType::RawXz, Some(image.len() as u64));
    let harness = Harness::new(payload);
    let drive = harness.add_drive("sdb", 6 * MIB).await;
    harness.backend.remove_after_bytes("sdb", image.len() as u64 * 7 / 10);
    let orchestrator = harness.orchestrator(variant);

    orchestrator.download().await.unwrap();
    let kind = failure_kind(orchestrator.write(&drive).await);

    assert_eq!(kind, FailureKind::DriveRemovedDuringWrite);
    assert_eq!(orchestrator.status(), WriteFailed);
    assert!(!harness.backend.is_locked("sdb"));
    assert!(!harness.drives.is_reserved("sdb"));

    harness.drives.refresh().await;
    orchestrator.retry().await.unwrap();
    assert_eq!(orchestrator.status(), ReadyToWrite);

    let replacement = harness.add_drive("sdc", 6 * MIB).await;
    orchestrator.write(&replacement).await.unwrap();
    assert_eq!(orchestrator.status(), Finished);
}

#[tokio::test]
async fn test_checksum_mismatch_never_reaches_finished() {
    let image = pattern(MIB as usize);
    let (payload, mut variant) = gz_variant(&image);
    variant.checksum = Some(Checksum::new(ChecksumAlgorithm::Sha256, &"a".repeat(64)).unwrap());
    let harness = Harness::new(payload);
    let orchestrator = harness.orchestrator(variant);

    let kind = failure_kind(orchestrator.download().await);

    assert_eq!(kind, FailureKind::DownloadedImageCorrupted);
    let snapshot = orchestrator.snapshot();
    assert_eq!(snapshot.status, DownloadFailed);
    assert_eq!(snapshot.failure.unwrap().primary_action(), PrimaryAction::Retry);
    assert!(!orchestrator.image_path().exists());
}

#[tokio::test]
async fn test_cancel_during_write_stops_and_unlocks() {
    let image = pattern(3 * MIB as usize);
    let (payload, variant) = gz_variant(&image);
    let harness = Harness::new(payload);
    let drive = harness.add_drive("sdb", 6 * MIB).await;
    let orchestrator = harness.orchestrator(variant);
    orchestrator.download().await.unwrap();
    let mut events = orchestrator.subscribe();

    let job = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.write(&drive).await })
    };
    loop {
        if let Ok(OrchestratorEvent::StatusChanged { to: Writing, .. }) = events.recv().await {
            break;
        }
    }
    orchestrator.cancel();

    assert!(matches!(job.await.unwrap(), Err(OrchestratorError::Cancelled)));
    assert_eq!(orchestrator.status(), Preparing);
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, OrchestratorEvent::WriteStopped { .. })));
    assert!(!harness.backend.is_locked("sdb"));
    assert!(!harness.drives.is_reserved("sdb"));
}

#[tokio::test]
async fn test_read_back_mismatch_is_written_data_corrupted() {
    let image = pattern(2 * MIB as usize);
    let (payload, variant) = gz_variant(&image);
    let harness = Harness::new(payload);
    let drive = harness.add_drive("sdb", 4 * MIB).await;
    harness.backend.corrupt_read_at("sdb", 12_345);
    let orchestrator = harness.orchestrator(variant);

    orchestrator.download().await.unwrap();
    let kind = failure_kind(orchestrator.write(&drive).await);

    assert_eq!(kind, FailureKind::WrittenDataCorrupted);
    assert_eq!(kind.primary_action(), PrimaryAction::Retry);
    assert!(!harness.backend.is_locked("sdb"));
}

#[tokio::test]
async fn test_repeated_write_faults_mean_damaged_drive() {
    let image = pattern(2 * MIB as usize);
    let (payload, variant) = gz_variant(&image);
    let harness = Harness::new(payload);
    let drive = harness.add_drive("sdb", 4 * MIB).await;
    harness.backend.inject_write_faults("sdb", 100);
    let orchestrator = harness.orchestrator(variant);

    orchestrator.download().await.unwrap();
    assert_eq!(
        failure_kind(orchestrator.write(&drive).await),
        FailureKind::DriveProbablyDamaged
    );
    assert!(!harness.backend.is_locked("sdb"));
}

#[tokio::test]
async fn test_write_protected_drive() {
    let image = pattern(MIB as usize);
    let (payload, variant) = gz_variant(&image);
    let harness = Harness::new(payload);
    let drive = harness.add_drive("sdb", 4 * MIB).await;
    harness.backend.set_read_only("sdb", true);
    let orchestrator = harness.orchestrator(variant);

    orchestrator.download().await.unwrap();
    assert_eq!(
        failure_kind(orchestrator.write(&drive).await),
        FailureKind::DestinationNotWritable
    );
}

#[tokio::test]
async fn test_busy_drive_cannot_be_locked() {
    let image = pattern(MIB as usize);
    let (payload, variant) = gz_variant(&image);
    let harness = Harness::new(payload);
    let drive = harness.add_drive("sdb", 4 * MIB).await;
    let orchestrator = harness.orchestrator(variant);
    orchestrator.download().await.unwrap();

    let lease = harness.drives.reserve(&drive).unwrap();
    assert_eq!(
        failure_kind(orchestrator.write(&drive).await),
        FailureKind::CouldNotLockDrive
    );
    drop(lease);

    // The helper side lock fails too
    harness.backend.fail_lock("sdb");
    orchestrator.retry().await.unwrap_err();
    assert_eq!(
        orchestrator.snapshot().failure.unwrap().kind,
        FailureKind::CouldNotLockDrive
    );
    assert!(!harness.drives.is_reserved("sdb"));
}

#[tokio::test]
async fn test_missing_helper_binary() {
    let image = pattern(MIB as usize);
    let (payload, variant) = gz_variant(&image);
    let harness = Harness::new(payload);
    let drive = harness.add_drive("sdb", 4 * MIB).await;
    if std::env::var_os(media_writer::config::app::HELPER_ENV).is_some() {
        return;
    }

    let mut settings = harness.settings.clone();
    settings.helper_path = Some(harness.dir.path().join("no-helper-here"));
    let orchestrator = Orchestrator::new(
        variant,
        harness.engine(),
        harness.drives.clone(),
        HelperLauncher::Process { settings: settings.clone() },
        &settings,
    );
    orchestrator.download().await.unwrap();

    assert_eq!(
        failure_kind(orchestrator.write(&drive).await),
        FailureKind::HelperBinaryMissing
    );
    assert!(!harness.drives.is_reserved("sdb"));
}

#[tokio::test]
async fn test_existing_download_is_checked_not_fetched() {
    let image = pattern(MIB as usize);
    let (payload, variant) = gz_variant(&image);
    let harness = Harness::new(payload);

    harness.orchestrator(variant.clone()).download().await.unwrap();
    assert_eq!(harness.source.fetches().len(), 1);

    let again = harness.orchestrator(variant);
    let mut events = again.subscribe();
    again.download().await.unwrap();

    assert_eq!(statuses(&drain(&mut events)), [CheckingDownload, ReadyToWrite]);
    assert_eq!(harness.source.fetches().len(), 1);
}

#[tokio::test]
async fn test_delayed_write_starts_when_ready() {
    let image = pattern(MIB as usize);
    let (payload, variant) = gz_variant(&image);
    let harness = Harness::new(payload);
    let drive = harness.add_drive("sdb", 4 * MIB).await;
    let orchestrator = harness.orchestrator(variant);

    orchestrator.set_delayed_write(Some(drive));
    assert_eq!(orchestrator.snapshot().delayed_write.as_deref(), Some("sdb"));
    orchestrator.download().await.unwrap();

    eventually(|| orchestrator.status() == Finished).await;
    assert!(orchestrator.snapshot().delayed_write.is_none());
}

#[tokio::test]
async fn test_cancel_during_download_returns_to_preparing() {
    let image = pattern(MIB as usize);
    let (payload, variant) = gz_variant(&image);
    let harness = Harness::new(payload);
    harness.source.always_drop_at(Some(100_000));
    let orchestrator = harness.orchestrator(variant);
    let mut events = orchestrator.subscribe();

    let job = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.download().await })
    };
    loop {
        if let Ok(OrchestratorEvent::Resuming { .. }) = events.recv().await {
            break;
        }
    }
    orchestrator.cancel();

    assert!(matches!(job.await.unwrap(), Err(OrchestratorError::Cancelled)));
    assert_eq!(orchestrator.status(), Preparing);
    assert!(!media_writer::utils::part_path(&orchestrator.image_path()).exists());
}

#[tokio::test]
async fn test_pause_is_reflected_in_snapshot() {
    let image = pattern(MIB as usize);
    let (payload, variant) = gz_variant(&image);
    let harness = Harness::new(payload);
    harness.source.always_drop_at(Some(100_000));
    let orchestrator = harness.orchestrator(variant);
    let mut events = orchestrator.subscribe();

    assert!(orchestrator.pause().is_err());
    let job = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.download().await })
    };
    loop {
        if let Ok(OrchestratorEvent::Resuming { .. }) = events.recv().await {
            break;
        }
    }
    orchestrator.pause().unwrap();
    loop {
        if let Ok(OrchestratorEvent::Paused) = events.recv().await {
            break;
        }
    }
    assert!(orchestrator.snapshot().paused);
    assert_eq!(orchestrator.status(), Downloading);

    harness.source.always_drop_at(None);
    orchestrator.resume().unwrap();
    job.await.unwrap().unwrap();
    assert_eq!(orchestrator.status(), ReadyToWrite);
    assert!(!orchestrator.snapshot().paused);
}

#[tokio::test]
async fn test_erase_download_resets_to_preparing() {
    let image = pattern(MIB as usize);
    let (payload, variant) = gz_variant(&image);
    let harness = Harness::new(payload);
    let orchestrator = harness.orchestrator(variant);
    orchestrator.download().await.unwrap();
    assert!(orchestrator.image_path().exists());

    orchestrator.erase_download().unwrap();

    assert!(!orchestrator.image_path().exists());
    assert_eq!(orchestrator.status(), Preparing);
}

#[tokio::test]
async fn test_local_image_is_ready_and_never_erased() {
    let harness = Harness::new(Vec::new());
    let image = pattern(MIB as usize);
    let path = harness.dir.path().join("custom.img");
    std::fs::write(&path, &image).unwrap();
    let drive = harness.add_drive("sdb", 2 * MIB).await;

    let orchestrator = harness.orchestrator(Variant::local(&path).unwrap());
    assert_eq!(orchestrator.status(), ReadyToWrite);
    assert!(matches!(
        orchestrator.erase_download(),
        Err(OrchestratorError::OutsideDownloads(_))
    ));

    orchestrator.write(&drive).await.unwrap();
    assert_eq!(orchestrator.status(), Finished);
    assert!(path.exists());
    assert_eq!(&harness.backend.read_contents("sdb").unwrap()[..image.len()], &image[..]);
}

#[tokio::test]
async fn test_recovery_archive_cannot_be_written() {
    let harness = Harness::new(Vec::new());
    let path = harness.dir.path().join("board.recovery.tar");
    std::fs::write(&path, common::tar("recovery.img", &pattern(4096))).unwrap();
    let drive = harness.add_drive("sdb", 2 * MIB).await;
    let orchestrator = harness.orchestrator(Variant::local(&path).unwrap());

    assert!(!orchestrator.can_write_now());
    let err = orchestrator.write(&drive).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::WritingNotPossible(ContainerType::Recovery)));
    assert_eq!(err.kind(), Some(FailureKind::UnsupportedContainer));
    assert_eq!(orchestrator.status(), ReadyToWrite);
}

#[tokio::test]
async fn test_write_without_verification() {
    let image = pattern(MIB as usize);
    let (payload, variant) = gz_variant(&image);
    let mut harness = Harness::new(payload);
    harness.settings.verify_writes = false;
    let drive = harness.add_drive("sdb", 2 * MIB).await;
    let orchestrator = harness.orchestrator(variant);
    let mut events = orchestrator.subscribe();

    orchestrator.download().await.unwrap();
    orchestrator.write(&drive).await.unwrap();

    let statuses = statuses(&drain(&mut events));
    assert_eq!(statuses.last(), Some(&Finished));
    assert!(!statuses.contains(&CheckingWrittenData));
}

#[tokio::test]
async fn test_restore_through_helper() {
    let harness = Harness::new(Vec::new());
    let path = harness.dir.path().join("live.img");
    harness.backend.add_drive("live", "Live", path, 4 * MIB, true).unwrap();
    harness.drives.refresh().await;
    let drive = harness.drives.last_restorable().unwrap();

    restore_drive(&harness.drives, &harness.launcher(), &drive).await.unwrap();

    assert_eq!(harness.drives.drive("live").unwrap().restore_status, RestoreStatus::Restored);
    assert!(harness.drives.last_restorable().is_none());
    assert!(!harness.backend.is_locked("live"));
}

#[tokio::test]
async fn test_failed_restore_offers_restore_again() {
    let harness = Harness::new(Vec::new());
    let path = harness.dir.path().join("live.img");
    harness.backend.add_drive("live", "Live", path, 4 * MIB, true).unwrap();
    harness.backend.fail_restore("live");
    harness.drives.refresh().await;
    let drive = harness.drives.drive("live").unwrap();

    let failure = restore_drive(&harness.drives, &harness.launcher(), &drive)
        .await
        .unwrap_err();

    assert_eq!(failure.kind, FailureKind::RestoreFailed);
    assert_eq!(failure.primary_action(), PrimaryAction::Restore);
    assert_eq!(harness.drives.drive("live").unwrap().restore_status, RestoreStatus::Failed);
    assert!(!harness.backend.is_locked("live"));
    assert!(!harness.drives.is_reserved("live"));
}

#[tokio::test]
async fn test_drive_service_outage_blocks_writing() {
    let image = pattern(MIB as usize);
    let (payload, variant) = gz_variant(&image);
    let harness = Harness::new(payload);
    harness.add_drive("sdb", 2 * MIB).await;
    let orchestrator = harness.orchestrator(variant);
    orchestrator.download().await.unwrap();
    assert!(orchestrator.can_write_now());

    harness.backend.set_unavailable(Some("udisksd is not running"));
    harness.drives.refresh().await;
    assert!(!orchestrator.can_write_now());
}

//! Restarting after a crash: stranded containers are requeued, half-built ones
//! sealed with what made it to disk, leftovers removed, and redelivered orders
//! don't write twice.

mod common;

use common::{BUCKET, TAPES};
use reel_archive::ContainerBuilder;
use reel_referential::{
    ContainerEntry, ContainerRepository, ContainerState, Database, StateChange, TapeAddress, WriteOrderQueue,
};
use std::io::Write;

#[tokio::test]
async fn test_crash_between_seal_and_enqueue() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::config(dir.path(), 1 << 20);
    let mut builder = ContainerBuilder::new(BUCKET, config.storage.input_dir.join(BUCKET), 1);
    let container = builder.add_object("stranded", b"nobody queued me").unwrap().sealed.unwrap();
    {
        // The referential update made it, the enqueue didn't.
        let db = Database::connect(&config.storage.database).await.unwrap();
        ContainerRepository::from(&db).save(&ContainerEntry::ready(&container)).await.unwrap();
        db.close().await;
    }

    let library = common::library();
    let offer = common::start(&config, library.pool(1).unwrap()).await;
    common::wait_for_state(&offer, &container.id, ContainerState::OnTape).await;
    let orders = offer.queue().find_for_container(&container.id).await.unwrap();
    assert_eq!(orders.len(), 1);
    assert!(orders[0].acknowledged);

    // Later sweeps have nothing left to do.
    let report = offer.sweep().run().await.unwrap();
    assert!(report.stranded.is_empty());
    assert_eq!(offer.queue().find_for_container(&container.id).await.unwrap().len(), 1);
    offer.shutdown().await;
}

#[tokio::test]
async fn test_half_built_container_is_sealed_on_start() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::config(dir.path(), 1 << 20);
    let mut builder = ContainerBuilder::new(BUCKET, config.storage.input_dir.join(BUCKET), 1 << 20);
    let info = builder.add_object("first", b"made it to disk").unwrap().opened.unwrap();
    builder.add_object("second", b"this one too").unwrap();
    {
        let db = Database::connect(&config.storage.database).await.unwrap();
        ContainerRepository::from(&db).save(&ContainerEntry::building(&info)).await.unwrap();
        db.close().await;
    }
    // Crash half-way through the next header: no end-of-archive marker.
    std::mem::forget(builder);
    let mut file = std::fs::OpenOptions::new().append(true).open(&info.path).unwrap();
    file.write_all(&[0x41; 100]).unwrap();
    drop(file);

    let library = common::library();
    let offer = common::start(&config, library.pool(1).unwrap()).await;
    common::wait_for_state(&offer, &info.id, ContainerState::OnTape).await;
    assert_eq!(offer.storage().read_object(&info.id, "first").await.unwrap(), b"made it to disk");
    assert_eq!(offer.storage().read_object(&info.id, "second").await.unwrap(), b"this one too");
    assert_eq!(library.tape_files(TAPES[0]).len(), 1);
    offer.shutdown().await;
}

#[tokio::test]
async fn test_leftovers_without_objects_or_records_are_removed_on_start() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::config(dir.path(), 1 << 20);
    let mut builder = ContainerBuilder::new(BUCKET, config.storage.input_dir.join(BUCKET), 1 << 20);
    let empty = builder.add_object("partial", b"never sealed").unwrap().opened.unwrap();
    {
        let db = Database::connect(&config.storage.database).await.unwrap();
        ContainerRepository::from(&db).save(&ContainerEntry::building(&empty)).await.unwrap();
        db.close().await;
    }
    std::mem::forget(builder);
    // Torn inside the only header.
    std::fs::OpenOptions::new().write(true).open(&empty.path).unwrap().set_len(200).unwrap();
    // Crashed between creating the file and recording it.
    let mut unrecorded = ContainerBuilder::new(BUCKET, config.storage.input_dir.join(BUCKET), 1);
    let orphan = unrecorded.add_object("orphan", b"nobody knows me").unwrap().sealed.unwrap();
    // Crashed while reading a container back from tape.
    let staging = config.storage.read_cache_dir.join(BUCKET).join(format!("{}.partial", orphan.id));
    std::fs::create_dir_all(staging.parent().unwrap()).unwrap();
    std::fs::write(&staging, b"half a container").unwrap();

    let library = common::library();
    let offer = common::start(&config, library.pool(1).unwrap()).await;
    assert!(offer.containers().find(&empty.id).await.unwrap().is_none());
    assert!(!empty.path.exists());
    assert!(offer.containers().find(&orphan.id).await.unwrap().is_none());
    assert!(!orphan.path.exists());
    assert!(!staging.exists());
    assert!(offer.queue().pending(None).await.unwrap().is_empty());
    offer.shutdown().await;
}

#[tokio::test]
async fn test_redelivered_order_is_acknowledged_without_writing() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::config(dir.path(), 1 << 20);
    let mut builder = ContainerBuilder::new(BUCKET, config.storage.input_dir.join(BUCKET), 1);
    let container = builder.add_object("done", b"already on tape").unwrap().sealed.unwrap();
    {
        // Written and recorded, but the process died before acknowledging.
        let db = Database::connect(&config.storage.database).await.unwrap();
        let containers = ContainerRepository::from(&db);
        let entry = ContainerEntry::ready(&container);
        containers.save(&entry).await.unwrap();
        WriteOrderQueue::from(&db).enqueue(&(&entry).into()).await.unwrap();
        let written = StateChange::Written(TapeAddress { label: TAPES[0].to_string(), file: 0 });
        containers.update_state(&container.id, ContainerState::ReadyOnDisk, &written).await.unwrap();
        // A second application of the same transition is refused.
        assert!(containers.update_state(&container.id, ContainerState::ReadyOnDisk, &written).await.is_err());
        db.close().await;
    }

    let library = common::library();
    let offer = common::start(&config, library.pool(1).unwrap()).await;
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
    while !offer.queue().pending(None).await.unwrap().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "redelivered order never acknowledged");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(library.writes(0), 0);
    let entry = offer.storage().entry(&container.id).await.unwrap();
    assert_eq!(entry.state, ContainerState::OnTape);
    assert_eq!(entry.tape.map(|tape| tape.file), Some(0));
    offer.shutdown().await;
}

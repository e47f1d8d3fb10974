//! Tape write failures: tapes set aside, end of tape, busy drives, bounded retries and parked orders.

mod common;

use common::{BUCKET, TAPES};
use reel_referential::{ContainerState, TapeState};

#[tokio::test]
async fn test_failed_write_sets_tape_aside_and_retries_on_the_next() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::config(dir.path(), 8);
    let library = common::library();
    library.fail_next_writes(0, 1);
    let offer = common::start(&config, library.pool(1).unwrap()).await;

    let written = offer.storage().write(BUCKET, "object", vec![9; 64]).await.unwrap();
    common::wait_for_state(&offer, &written.id, ContainerState::OnTape).await;

    assert_eq!(common::tape_state(&offer, TAPES[0]).await, TapeState::Conflict);
    let entry = offer.storage().entry(&written.id).await.unwrap();
    assert_eq!(entry.tape.map(|tape| tape.label), Some(TAPES[1].to_string()));
    assert_eq!(library.tape_files(TAPES[1]).len(), 1);
    let orders = offer.queue().find_for_container(&written.id).await.unwrap();
    assert_eq!(orders[0].attempts, 2);
    offer.shutdown().await;
}

#[tokio::test]
async fn test_failed_write_near_capacity_moves_to_the_next_tape() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = common::config(dir.path(), 8);
    config.library.full_cartridge_threshold = 1;
    let library = common::library();
    library.fail_next_writes(0, 1);
    let offer = common::start(&config, library.pool(1).unwrap()).await;

    let written = offer.storage().write(BUCKET, "object", vec![9; 64]).await.unwrap();
    common::wait_for_state(&offer, &written.id, ContainerState::OnTape).await;

    assert_eq!(common::tape_state(&offer, TAPES[0]).await, TapeState::Full);
    assert_eq!(common::tape_state(&offer, TAPES[1]).await, TapeState::Open);
    // Same delivery, no retry needed.
    let orders = offer.queue().find_for_container(&written.id).await.unwrap();
    assert_eq!(orders[0].attempts, 1);
    offer.shutdown().await;
}

#[tokio::test]
async fn test_busy_drive_is_retried_on_the_same_tape() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::config(dir.path(), 8);
    let library = common::library();
    library.busy_next_writes(0, 1);
    let offer = common::start(&config, library.pool(1).unwrap()).await;

    let written = offer.storage().write(BUCKET, "object", vec![9; 64]).await.unwrap();
    common::wait_for_state(&offer, &written.id, ContainerState::OnTape).await;

    assert_eq!(common::tape_state(&offer, TAPES[0]).await, TapeState::Open);
    let entry = offer.storage().entry(&written.id).await.unwrap();
    assert_eq!(entry.tape.map(|tape| (tape.label, tape.file)), Some((TAPES[0].to_string(), 0)));
    let orders = offer.queue().find_for_container(&written.id).await.unwrap();
    assert_eq!(orders[0].attempts, 2);
    offer.shutdown().await;
}

#[tokio::test]
async fn test_held_drive_delays_delivery_without_failing_it() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = common::config(dir.path(), 8);
    // A single failed attempt would park the order.
    config.listener.max_attempts = 1;
    let library = common::library();
    let pool = library.pool(1).unwrap();
    // Someone else is using the bucket's drive.
    let busy = pool.checkout_drive(0).unwrap().unwrap();
    let offer = common::start(&config, pool.clone()).await;

    let first = offer.storage().write(BUCKET, "first", vec![1; 64]).await.unwrap();
    let second = offer.storage().write(BUCKET, "second", vec![2; 64]).await.unwrap();
    assert_ne!(first.id, second.id);
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert_eq!(offer.storage().status(&first.id).await.unwrap(), ContainerState::ReadyOnDisk);
    busy.release().unwrap();

    common::wait_for_state(&offer, &first.id, ContainerState::OnTape).await;
    common::wait_for_state(&offer, &second.id, ContainerState::OnTape).await;
    for (id, file) in [(&first.id, 0), (&second.id, 1)] {
        let entry = offer.storage().entry(id).await.unwrap();
        assert_eq!(entry.tape.map(|tape| (tape.label, tape.file)), Some((TAPES[0].to_string(), file)));
        let orders = offer.queue().find_for_container(id).await.unwrap();
        assert!(orders.iter().all(|order| order.acknowledged && !order.parked));
    }
    assert_eq!(library.tape_files(TAPES[0]).len(), 2);
    offer.shutdown().await;
}

#[tokio::test]
async fn test_exhausted_retries_park_the_order_until_requeued() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = common::config(dir.path(), 8);
    config.listener.max_attempts = 2;
    let library = common::library();
    library.busy_next_writes(0, 2);
    let offer = common::start(&config, library.pool(1).unwrap()).await;

    let written = offer.storage().write(BUCKET, "object", vec![9; 64]).await.unwrap();
    let parked = common::wait_for_parked(&offer, &written.id).await;
    assert_eq!(parked.attempts, 2);
    assert!(!parked.acknowledged);
    assert_eq!(offer.storage().status(&written.id).await.unwrap(), ContainerState::ReadyOnDisk);
    // Parked orders are the operator's business, not the sweep's.
    assert!(offer.sweep().run().await.unwrap().stranded.is_empty());

    // Later orders wait behind the parked one.
    let later = offer.storage().write(BUCKET, "later", vec![8; 64]).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(offer.storage().status(&later.id).await.unwrap(), ContainerState::ReadyOnDisk);

    assert_eq!(offer.queue().requeue_parked(BUCKET).await.unwrap(), 1);
    common::wait_for_state(&offer, &written.id, ContainerState::OnTape).await;
    common::wait_for_state(&offer, &later.id, ContainerState::OnTape).await;
    assert_eq!(common::tape_state(&offer, TAPES[0]).await, TapeState::Open);
    let entry = offer.storage().entry(&later.id).await.unwrap();
    assert_eq!(entry.tape.map(|tape| tape.file), Some(1));
    offer.shutdown().await;
}

#[tokio::test]
async fn test_no_writable_tape_parks_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::config(dir.path(), 8);
    let library = common::library();
    let offer = common::start(&config, library.pool(1).unwrap()).await;
    for label in TAPES {
        offer.catalog().set_state(label, TapeState::Full).await.unwrap();
    }

    let written = offer.storage().write(BUCKET, "object", vec![9; 64]).await.unwrap();
    let parked = common::wait_for_parked(&offer, &written.id).await;
    assert_eq!(parked.attempts, 1);
    assert_eq!(library.writes(0), 0);
    offer.shutdown().await;
}

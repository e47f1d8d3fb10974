//! Shared harness: a tape offer over an on-disk database and a simulated library.

#![allow(dead_code)]

use reel_archive::ContainerId;
use reel_config::{BucketConfig, Config, DriveConfig};
use reel_device::DevicePool;
use reel_device::simulator::SimulatedLibrary;
use reel_offer::TapeOffer;
use reel_referential::{ContainerState, Database, TapeState, WriteOrder};
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const BUCKET: &str = "backup";
pub const TAPES: [&str; 2] = ["A00001L8", "A00002L8"];
const PATIENCE: Duration = Duration::from_secs(10);

pub fn config(dir: &Path, container_threshold: u64) -> Config {
    let mut config = Config::default();
    config.storage.input_dir = dir.join("input");
    config.storage.read_cache_dir = dir.join("cache");
    config.storage.database = dir.join("referential.db");
    config.storage.container_threshold = container_threshold;
    config.library.robots = vec!["/dev/sim-changer".into()];
    config.library.drives = vec![DriveConfig { index: 0, device: "/dev/sim-nst0".into() }];
    config.buckets.insert(
        BUCKET.to_string(),
        BucketConfig { drive: 0, tapes: TAPES.iter().map(|tape| tape.to_string()).collect() },
    );
    config.listener.poll_wait_ms = 50;
    config.listener.retry_backoff_ms = 10;
    config.listener.robot_checkout_timeout_secs = 5;
    config
}

pub fn library() -> SimulatedLibrary {
    SimulatedLibrary::new(1, TAPES)
}

pub async fn start(config: &Config, pool: DevicePool) -> TapeOffer {
    let db = Database::connect(&config.storage.database).await.unwrap();
    TapeOffer::start_with(config.clone(), db, pool, CancellationToken::new()).await.unwrap()
}

/// Poll a container's state until it reaches `wanted`, returning every state observed on the way.
pub async fn wait_for_state(offer: &TapeOffer, id: &ContainerId, wanted: ContainerState) -> Vec<ContainerState> {
    let deadline = Instant::now() + PATIENCE;
    let mut observed = Vec::new();
    loop {
        let state = offer.storage().status(id).await.unwrap();
        if observed.last() != Some(&state) {
            observed.push(state);
        }
        if state == wanted {
            return observed;
        }
        assert!(Instant::now() < deadline, "container {id} stuck in {state} waiting for {wanted}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until every write order of the container has been parked or acknowledged.
pub async fn wait_for_parked(offer: &TapeOffer, id: &ContainerId) -> WriteOrder {
    let deadline = Instant::now() + PATIENCE;
    loop {
        let orders = offer.queue().find_for_container(id).await.unwrap();
        if let Some(order) = orders.into_iter().find(|order| order.parked) {
            return order;
        }
        assert!(Instant::now() < deadline, "write order of {id} never parked");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn tape_state(offer: &TapeOffer, label: &str) -> TapeState {
    offer.catalog().find(label).await.unwrap().unwrap().state
}

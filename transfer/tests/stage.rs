use std::time::{Duration, Instant};

use bulk::{MemoryBackend, Residency};
use common::Error;
use common::config::TransferConfig;

fn polling_every(interval: Duration) -> TransferConfig {
    TransferConfig {
        stage_poll_interval: interval,
        ..TransferConfig::default()
    }
}

#[test]
fn test_stage_polls_at_configured_interval() -> Result<(), Error> {
    let backend = MemoryBackend::new(64);
    backend.insert_object("bucket", "cold", vec![7; 300]);
    backend.archive("bucket", "cold", 3);
    let started = Instant::now();
    let residency = transfer::stage(
        &backend,
        "/bucket/cold",
        Duration::from_secs(30),
        &polling_every(Duration::from_millis(1)),
    )?;
    assert_eq!(residency, Residency::Resident);
    // three hidden polls at the default interval would take seconds
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(backend.stats().jobs_deleted, 1);
    Ok(())
}

#[test]
fn test_stage_gives_up_after_timeout() -> Result<(), Error> {
    let backend = MemoryBackend::new(64);
    backend.insert_object("bucket", "cold", vec![7; 300]);
    backend.archive("bucket", "cold", u32::MAX);
    let residency = transfer::stage(
        &backend,
        "/bucket/cold",
        Duration::from_millis(20),
        &polling_every(Duration::from_secs(3600)),
    )?;
    assert_eq!(residency, Residency::Archived);
    Ok(())
}

#[test]
fn test_stage_requires_object_path() {
    let backend = MemoryBackend::new(64);
    assert_eq!(
        transfer::stage(
            &backend,
            "/bucket",
            Duration::from_secs(1),
            &TransferConfig::default()
        ),
        Err(Error::InvalidPath(
            "Can only retrieve objects from within buckets".to_string()
        ))
    );
}

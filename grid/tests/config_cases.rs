use grid::config::StorageConfigBuilder;
use grid::error::BuildError;
use rstest::*;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[rstest]
#[case::missing_storage_id(None, 5_000, Some(BuildError::MissingStorageId))]
#[case::zero_timeout(Some("s"), 0, Some(BuildError::ZeroTimeout))]
#[case::valid(Some("s"), 5_000, None)]
fn builder_validates_required_fields(
    #[case] storage_id: Option<&str>,
    #[case] request_timeout_ms: u64,
    #[case] expected_error: Option<BuildError>,
) {
    init_logging();

    let mut builder = StorageConfigBuilder::new().request_timeout_ms(request_timeout_ms);
    if let Some(id) = storage_id {
        builder = builder.storage_id(id);
    }
    let result = builder.build();

    match expected_error {
        Some(expected) => assert_eq!(result.unwrap_err(), expected),
        None => assert!(result.is_ok()),
    }
}

#[rstest]
#[case::events(10, 1_000)]
#[case::single_event(1, 50)]
#[case::large_batch(10_000, 5_000)]
fn builder_carries_batching_knobs_through_to_the_built_config(#[case] max_collected_events: usize, #[case] max_collected_time_ms: u64) {
    let config = StorageConfigBuilder::new()
        .storage_id("batching")
        .max_collected_events(max_collected_events)
        .max_collected_time_ms(max_collected_time_ms)
        .build()
        .unwrap();

    assert_eq!(config.max_collected_events, max_collected_events);
    assert_eq!(config.max_collected_time().as_millis() as u64, max_collected_time_ms);
}

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use satchel_api::{StorageOptions, StoragePort};
use satchel_engine::{PlayConfig, PlaybackOutcome, PlaybackSession, Player, SatchelError, TopicFilter};

use common::{CaptureTransport, Fault, FaultyStorage, MS, msg, seeded, three_channel_bag};

async fn start(
    storage: Arc<dyn StoragePort>,
    transport: &CaptureTransport,
    config: PlayConfig,
) -> Result<PlaybackSession, SatchelError> {
    Player::new(Arc::new(transport.clone()), storage, StorageOptions::new("bag"), config)
        .start(CancellationToken::new())
        .await
}

fn rate(rate: f64) -> PlayConfig {
    PlayConfig {
        rate,
        ..PlayConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn three_channels_at_double_rate() {
    let transport = CaptureTransport::new();
    let origin = Instant::now();
    let session = start(Arc::new(three_channel_bag("bag")), &transport, rate(2.0)).await.unwrap();
    let summary = session.wait().await.unwrap();

    assert_eq!(summary.outcome, PlaybackOutcome::Completed);
    assert_eq!(summary.published, 3);
    assert_eq!(transport.channels(), vec!["a", "b", "c"]);
    assert_eq!(transport.offsets_ms(origin), vec![0, 5, 10]);
}

#[tokio::test(start_paused = true)]
async fn rate_one_reproduces_recorded_gaps() {
    let storage = seeded(
        "bag",
        &["a", "b"],
        vec![
            msg("a", 1_000 * MS, b"1"),
            msg("b", 1_003 * MS, b"2"),
            msg("a", 1_003 * MS, b"3"),
            msg("b", 1_050 * MS, b"4"),
        ],
    );
    let transport = CaptureTransport::new();
    let origin = Instant::now();
    start(Arc::new(storage), &transport, PlayConfig::default())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(transport.offsets_ms(origin), vec![0, 3, 3, 50]);
    // Equal timestamps keep read order.
    let payloads: Vec<Vec<u8>> = transport.published().into_iter().map(|p| p.payload).collect();
    assert_eq!(payloads, vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec(), b"4".to_vec()]);
}

#[tokio::test(start_paused = true)]
async fn rate_scales_gaps() {
    let records = || vec![msg("a", 0, b"x"), msg("a", 40 * MS, b"y"), msg("a", 80 * MS, b"z")];

    let fast = CaptureTransport::new();
    let origin = Instant::now();
    start(Arc::new(seeded("bag", &["a"], records())), &fast, rate(4.0))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(fast.offsets_ms(origin), vec![0, 10, 20]);

    let slow = CaptureTransport::new();
    let origin = Instant::now();
    start(Arc::new(seeded("bag", &["a"], records())), &slow, rate(0.5))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(slow.offsets_ms(origin), vec![0, 80, 160]);
}

#[tokio::test(start_paused = true)]
async fn pause_shifts_later_deadlines_by_pause_length() {
    let storage = seeded(
        "bag",
        &["a"],
        vec![msg("a", 0, b"0"), msg("a", 10 * MS, b"1"), msg("a", 20 * MS, b"2"), msg("a", 30 * MS, b"3")],
    );
    let transport = CaptureTransport::new();
    let origin = Instant::now();
    let session = start(Arc::new(storage), &transport, PlayConfig::default()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(15)).await;
    session.pause();
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(session.is_paused());
    assert_eq!(transport.published().len(), 2);
    session.resume();

    session.wait().await.unwrap();
    assert_eq!(transport.offsets_ms(origin), vec![0, 10, 60, 70]);
}

#[tokio::test(start_paused = true)]
async fn toggle_pause_flips_state() {
    let storage = seeded("bag", &["a"], vec![msg("a", 0, b"0"), msg("a", 100 * MS, b"1")]);
    let transport = CaptureTransport::new();
    let origin = Instant::now();
    let session = start(Arc::new(storage), &transport, PlayConfig::default()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;
    session.toggle_pause();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(session.is_paused());
    session.toggle_pause();
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(!session.is_paused());

    session.wait().await.unwrap();
    assert_eq!(transport.offsets_ms(origin), vec![0, 120]);
}

#[tokio::test(start_paused = true)]
async fn seek_starts_at_first_record_not_before_target() {
    let transport = CaptureTransport::new();
    let origin = Instant::now();
    let config = PlayConfig {
        start_paused: true,
        ..PlayConfig::default()
    };
    let session = start(Arc::new(three_channel_bag("bag")), &transport, config).await.unwrap();
    assert!(session.is_paused());

    session.seek(15 * MS);
    session.resume();
    let summary = session.wait().await.unwrap();

    assert_eq!(summary.published, 1);
    assert_eq!(transport.timestamps(), vec![20 * MS]);
    assert_eq!(transport.offsets_ms(origin), vec![5]);
}

fn five_steps() -> Arc<dyn StoragePort> {
    Arc::new(seeded("bag", &["a"], (0..5).map(|i| msg("a", i * 10 * MS, b"x")).collect()))
}

#[tokio::test(start_paused = true)]
async fn seek_forward_while_playing_skips_ahead() {
    let transport = CaptureTransport::new();
    let origin = Instant::now();
    let session = start(five_steps(), &transport, PlayConfig::default()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(15)).await;
    session.seek(30 * MS);
    let summary = session.wait().await.unwrap();

    assert_eq!(summary.outcome, PlaybackOutcome::Completed);
    assert_eq!(transport.timestamps(), vec![0, 10 * MS, 30 * MS, 40 * MS]);
    assert_eq!(transport.offsets_ms(origin), vec![0, 10, 15, 25]);
}

#[tokio::test(start_paused = true)]
async fn seek_backward_replays_records() {
    let transport = CaptureTransport::new();
    let origin = Instant::now();
    let session = start(five_steps(), &transport, PlayConfig::default()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(25)).await;
    session.seek(10 * MS);
    let summary = session.wait().await.unwrap();

    assert_eq!(summary.published, 7);
    assert_eq!(
        transport.timestamps(),
        vec![0, 10 * MS, 20 * MS, 10 * MS, 20 * MS, 30 * MS, 40 * MS]
    );
    assert_eq!(transport.offsets_ms(origin), vec![0, 10, 20, 25, 35, 45, 55]);
}

#[tokio::test(start_paused = true)]
async fn seek_past_end_completes() {
    let transport = CaptureTransport::new();
    let session = start(Arc::new(three_channel_bag("bag")), &transport, PlayConfig::default())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    session.seek(1_000 * MS);
    let summary = session.wait().await.unwrap();

    assert_eq!(summary.outcome, PlaybackOutcome::Completed);
    assert_eq!(summary.published, 1);
    assert_eq!(summary.loops, 0);
}

#[tokio::test(start_paused = true)]
async fn seek_past_end_with_loop_rewinds() {
    let storage = seeded("bag", &["a"], (0..3).map(|i| msg("a", i * 10 * MS, b"x")).collect());
    let transport = CaptureTransport::new();
    let origin = Instant::now();
    let config = PlayConfig {
        loop_playback: true,
        ..PlayConfig::default()
    };
    let session = start(Arc::new(storage), &transport, config).await.unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    session.seek(1_000 * MS);
    tokio::time::sleep(Duration::from_millis(15)).await;
    let summary = session.stop_and_wait().await.unwrap();

    assert_eq!(summary.outcome, PlaybackOutcome::Stopped);
    assert_eq!(summary.loops, 1);
    assert_eq!(transport.timestamps(), vec![0, 0, 10 * MS]);
    assert_eq!(transport.offsets_ms(origin), vec![0, 5, 15]);
}

#[tokio::test(start_paused = true)]
async fn allow_list_publishes_only_selected_channels() {
    let transport = CaptureTransport::new();
    let origin = Instant::now();
    let config = PlayConfig {
        filter: TopicFilter::only(["c"]),
        ..PlayConfig::default()
    };
    let summary = start(Arc::new(three_channel_bag("bag")), &transport, config)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(summary.published, 1);
    assert_eq!(summary.skipped, 2);
    assert_eq!(transport.channels(), vec!["c"]);
    // The clock is anchored at the bag's first record, selected or not.
    assert_eq!(transport.offsets_ms(origin), vec![20]);
}

#[tokio::test(start_paused = true)]
async fn remap_renames_published_channel() {
    let transport = CaptureTransport::new();
    let mut config = PlayConfig::default();
    config.remap.insert("a".into(), "/replay/a".into());
    start(Arc::new(three_channel_bag("bag")), &transport, config)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(transport.channels(), vec!["/replay/a", "b", "c"]);
}

#[tokio::test(start_paused = true)]
async fn loop_restarts_from_the_beginning() {
    let storage = seeded("bag", &["a"], vec![msg("a", 0, b"0"), msg("a", 10 * MS, b"1")]);
    let transport = CaptureTransport::new();
    let config = PlayConfig {
        loop_playback: true,
        ..PlayConfig::default()
    };
    let session = start(Arc::new(storage), &transport, config).await.unwrap();
    tokio::time::sleep(Duration::from_millis(35)).await;
    let summary = session.stop_and_wait().await.unwrap();

    assert_eq!(summary.outcome, PlaybackOutcome::Stopped);
    assert!(summary.loops >= 2, "loops = {}", summary.loops);
    let ts = transport.timestamps();
    assert!(ts.len() >= 5);
    for (i, t) in ts.iter().enumerate() {
        assert_eq!(*t, if i % 2 == 0 { 0 } else { 10 * MS });
    }
}

#[tokio::test(start_paused = true)]
async fn stop_ends_early() {
    let storage = seeded(
        "bag",
        &["a"],
        (0..10).map(|i| msg("a", i * 10 * MS, b"x")).collect(),
    );
    let transport = CaptureTransport::new();
    let session = start(Arc::new(storage), &transport, PlayConfig::default()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(15)).await;
    let summary = session.stop_and_wait().await.unwrap();

    assert_eq!(summary.outcome, PlaybackOutcome::Stopped);
    assert_eq!(summary.published, 2);
}

#[tokio::test(start_paused = true)]
async fn publish_failure_is_counted_and_skipped() {
    let transport = CaptureTransport::new().failing_publish("b");
    let summary = start(Arc::new(three_channel_bag("bag")), &transport, PlayConfig::default())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(summary.outcome, PlaybackOutcome::Completed);
    assert_eq!(summary.published, 2);
    assert_eq!(summary.publish_failures, 1);
    assert_eq!(transport.channels(), vec!["a", "c"]);
}

#[tokio::test(start_paused = true)]
async fn advertise_failure_skips_channel() {
    let transport = CaptureTransport::new().failing_advertise("a");
    let summary = start(Arc::new(three_channel_bag("bag")), &transport, PlayConfig::default())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(summary.published, 2);
    assert_eq!(summary.skipped, 1);
    assert_eq!(transport.channels(), vec!["b", "c"]);
}

#[tokio::test(start_paused = true)]
async fn read_failure_aborts_playback() {
    let storage = FaultyStorage::new(three_channel_bag("bag"), Fault::FailReadAfter(2));
    let transport = CaptureTransport::new();
    let config = PlayConfig {
        read_ahead: 1,
        ..PlayConfig::default()
    };
    let err = start(Arc::new(storage), &transport, config)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap_err();

    assert!(matches!(err, SatchelError::Storage(_)), "{err}");
    assert_eq!(transport.channels(), vec!["a", "b"]);
}

#[tokio::test(start_paused = true)]
async fn burst_while_paused_publishes_immediately() {
    let transport = CaptureTransport::new();
    let origin = Instant::now();
    let config = PlayConfig {
        start_paused: true,
        ..PlayConfig::default()
    };
    let session = start(Arc::new(three_channel_bag("bag")), &transport, config).await.unwrap();

    assert_eq!(session.burst(2).await.unwrap(), 2);
    assert_eq!(transport.channels(), vec!["a", "b"]);
    assert!(session.is_paused());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.published().len(), 2);
    session.resume();
    session.wait().await.unwrap();

    // c is 10ms after b, counted from the resume.
    assert_eq!(transport.offsets_ms(origin), vec![0, 0, 110]);
}

#[tokio::test(start_paused = true)]
async fn burst_is_ignored_while_playing() {
    let storage = seeded("bag", &["a"], vec![msg("a", 0, b"0"), msg("a", 50 * MS, b"1")]);
    let transport = CaptureTransport::new();
    let session = start(Arc::new(storage), &transport, PlayConfig::default()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(session.burst(5).await.unwrap(), 0);
    assert_eq!(transport.published().len(), 1);
    session.wait().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn set_rate_applies_from_current_position() {
    let storage = seeded(
        "bag",
        &["a"],
        vec![msg("a", 0, b"0"), msg("a", 100 * MS, b"1"), msg("a", 200 * MS, b"2")],
    );
    let transport = CaptureTransport::new();
    let origin = Instant::now();
    let session = start(Arc::new(storage), &transport, PlayConfig::default()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    session.set_rate(2.0).unwrap();
    assert!(matches!(session.set_rate(0.0), Err(SatchelError::Config(_))));
    session.wait().await.unwrap();

    assert_eq!(transport.offsets_ms(origin), vec![0, 75, 125]);
}

#[tokio::test(start_paused = true)]
async fn delay_postpones_first_publish() {
    let transport = CaptureTransport::new();
    let origin = Instant::now();
    let config = PlayConfig {
        delay_ms: 50,
        ..PlayConfig::default()
    };
    start(Arc::new(three_channel_bag("bag")), &transport, config)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(transport.offsets_ms(origin), vec![50, 60, 70]);
}

#[tokio::test(start_paused = true)]
async fn empty_bag_completes() {
    let transport = CaptureTransport::new();
    let summary = start(Arc::new(seeded("bag", &["a"], Vec::new())), &transport, PlayConfig::default())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(summary.outcome, PlaybackOutcome::Completed);
    assert_eq!(summary.published, 0);
}

#[tokio::test]
async fn invalid_config_fails_before_publishing() {
    let transport = CaptureTransport::new();
    let err = start(Arc::new(three_channel_bag("bag")), &transport, rate(-1.0))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, SatchelError::Config(_)));

    let err = start(Arc::new(three_channel_bag("other")), &transport, PlayConfig::default())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, SatchelError::Storage(_)));
    assert!(transport.published().is_empty());
}

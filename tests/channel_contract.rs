//! Channel contract, exercised identically against both transports.
//!
//! Run with: cargo test --test channel_contract

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use frameport::{
    Channel, ChannelConfig, ChannelError, DrawInstruction, FrameChannel, HostCapabilities, InputSnapshot,
    Key, PointerButtons, ProtocolError, Rgba, TimingSnapshot, TransportMode, WaitStrategy,
    create_channel_pair,
};
use proptest::prelude::*;

// =============================================================================
// HELPERS
// =============================================================================

const MODES: [TransportMode; 2] = [TransportMode::SharedMemory, TransportMode::MessagePassing];

fn pair_with(config: ChannelConfig) -> (Channel, Channel) {
    let (host, resource) = create_channel_pair(&config, &HostCapabilities::native())
        .expect("create pair")
        .into_parts();
    (host, resource.bind())
}

fn pair(mode: TransportMode) -> (Channel, Channel) {
    pair_with(ChannelConfig {
        mode,
        ..ChannelConfig::default()
    })
}

fn rect(i: u32) -> DrawInstruction {
    DrawInstruction::FillRect {
        x: i as f32,
        y: 0.0,
        width: 1.0,
        height: 1.0,
    }
}

// =============================================================================
// CONTRACT
// =============================================================================

#[test]
fn test_zero_values_before_publish() {
    for mode in MODES {
        let (host, isolated) = pair(mode);
        assert_eq!(isolated.read_input(), InputSnapshot::default(), "{mode:?}");
        assert_eq!(isolated.read_timing(), TimingSnapshot::default(), "{mode:?}");
        assert!(host.drain_instructions().unwrap().is_empty(), "{mode:?}");
    }
}

#[test]
fn test_every_instruction_kind_crosses() {
    let batch = vec![
        DrawInstruction::Clear,
        DrawInstruction::SetColor { color: Rgba::new(10, 20, 30, 40) },
        DrawInstruction::SetLineWidth { width: 2.5 },
        DrawInstruction::StrokeRect { x: 1.0, y: 2.0, width: 3.0, height: 4.0 },
        DrawInstruction::FillRect { x: -1.0, y: -2.0, width: 3.0, height: 4.0 },
        DrawInstruction::StrokeCircle { x: 5.0, y: 6.0, radius: 7.0 },
        DrawInstruction::FillCircle { x: 5.0, y: 6.0, radius: 0.5 },
        DrawInstruction::Line { x1: 0.0, y1: 0.0, x2: 10.0, y2: 10.0 },
        DrawInstruction::Text { x: 1.0, y: 1.0, text: "score: 7 ✓".into() },
        DrawInstruction::DrawImage { image: "player".into(), x: 0.0, y: 0.0, width: 16.0, height: 16.0 },
    ];
    for mode in MODES {
        let (host, isolated) = pair(mode);
        isolated.publish_instructions(batch.clone()).unwrap();
        assert_eq!(host.drain_instructions().unwrap(), batch, "{mode:?}");
    }
}

#[test]
fn test_publish_before_signal_is_visible_after_await() {
    for mode in MODES {
        let (host, isolated) = pair(mode);
        let isolated = Arc::new(isolated);

        let reader = {
            let isolated = isolated.clone();
            thread::spawn(move || {
                let mut seen = Vec::new();
                for _ in 0..50 {
                    isolated.await_turn().unwrap();
                    let timing = isolated.read_timing();
                    let input = isolated.read_input();
                    assert_eq!(input.pointer_x, timing.frame as f32);
                    seen.push(timing.frame);
                    isolated.publish_instructions(vec![rect(timing.frame as u32)]).unwrap();
                }
                seen
            })
        };

        let mut drained = Vec::new();
        for frame in 1..=50u64 {
            let input = InputSnapshot {
                pointer_x: frame as f32,
                ..InputSnapshot::default()
            };
            host.publish_input(&input).unwrap();
            host.publish_timing(&TimingSnapshot { delta: 0.016, elapsed: 0.016 * frame as f64, frame })
                .unwrap();
            host.signal_turn();

            // Wait for this frame's batch before handing over the next turn.
            loop {
                let batch = host.drain_instructions().unwrap();
                if !batch.is_empty() {
                    drained.extend(batch);
                    break;
                }
                thread::yield_now();
            }
        }

        let seen = reader.join().unwrap();
        assert_eq!(seen, (1..=50).collect::<Vec<_>>(), "{mode:?}");
        assert_eq!(drained, (1..=50).map(rect).collect::<Vec<_>>(), "{mode:?}");
    }
}

#[test]
fn test_input_snapshot_fields_survive() {
    let mut input = InputSnapshot::default();
    input.keys_down.insert(Key::LEFT);
    input.keys_down.insert(Key(255));
    input.keys_pressed.insert(Key::ENTER);
    input.pointer_x = 320.25;
    input.pointer_y = 200.75;
    input.buttons_down = PointerButtons::PRIMARY | PointerButtons::FORWARD;
    input.buttons_pressed = PointerButtons::FORWARD;

    for mode in MODES {
        let (host, isolated) = pair(mode);
        host.publish_input(&input).unwrap();
        assert_eq!(isolated.read_input(), input, "{mode:?}");
    }
}

#[test]
fn test_second_await_is_rejected() {
    for mode in MODES {
        let (host, isolated) = pair(mode);
        let isolated = Arc::new(isolated);
        let first = {
            let isolated = isolated.clone();
            thread::spawn(move || isolated.await_turn())
        };
        thread::sleep(Duration::from_millis(30));

        assert_eq!(
            isolated.await_turn(),
            Err(ChannelError::Protocol(ProtocolError::TurnAlreadyAwaited)),
            "{mode:?}"
        );
        host.signal_turn();
        assert_eq!(first.join().unwrap(), Ok(()), "{mode:?}");
    }
}

#[test]
fn test_dispose_unblocks_outstanding_wait() {
    for mode in MODES {
        for dispose_host in [true, false] {
            let (host, isolated) = pair(mode);
            let isolated = Arc::new(isolated);
            let waiter = {
                let isolated = isolated.clone();
                thread::spawn(move || isolated.await_turn())
            };
            thread::sleep(Duration::from_millis(30));

            if dispose_host {
                host.dispose();
            } else {
                isolated.dispose();
            }
            assert_eq!(waiter.join().unwrap(), Err(ChannelError::Disposed), "{mode:?}");

            // Everything after dispose fails cleanly or does nothing.
            host.dispose();
            isolated.dispose();
            host.signal_turn();
            assert!(host.is_disposed() && isolated.is_disposed(), "{mode:?}");
            assert_eq!(isolated.publish_instructions(vec![rect(1)]), Err(ChannelError::Disposed));
            assert_eq!(host.publish_timing(&TimingSnapshot::default()), Err(ChannelError::Disposed));
            assert!(host.drain_instructions().unwrap().is_empty());
            assert_eq!(isolated.await_turn(), Err(ChannelError::Disposed));
        }
    }
}

#[test]
fn test_dispose_discards_undrained_instructions() {
    for mode in MODES {
        for dispose_host in [true, false] {
            let (host, isolated) = pair(mode);
            isolated.publish_instructions(vec![rect(1), rect(2)]).unwrap();
            isolated.complete_frame().unwrap();

            if dispose_host {
                host.dispose();
            } else {
                isolated.dispose();
            }
            // Same on both transports, whichever side disposed.
            assert!(host.drain_instructions().unwrap().is_empty(), "{mode:?} host={dispose_host}");
            assert!(isolated.drain_instructions().unwrap().is_empty(), "{mode:?} host={dispose_host}");
        }
    }
}

#[test]
fn test_completed_frames_counted_on_both_transports() {
    for mode in MODES {
        let (host, isolated) = pair(mode);
        assert_eq!(host.take_completed_frames(), 0, "{mode:?}");

        isolated.complete_frame().unwrap();
        isolated.publish_instructions(vec![rect(7)]).unwrap();
        isolated.complete_frame().unwrap();
        assert_eq!(host.take_completed_frames(), 2, "{mode:?}");
        assert_eq!(host.take_completed_frames(), 0, "{mode:?}");
        assert_eq!(host.drain_instructions().unwrap(), vec![rect(7)], "{mode:?}");
    }
}

#[test]
fn test_backoff_wait_strategy() {
    let (host, isolated) = pair_with(ChannelConfig {
        mode: TransportMode::SharedMemory,
        wait: WaitStrategy::Backoff,
        ..ChannelConfig::default()
    });
    let isolated = Arc::new(isolated);
    let turns = Arc::new(AtomicU32::new(0));
    let waiter = {
        let isolated = isolated.clone();
        let turns = turns.clone();
        thread::spawn(move || {
            while isolated.await_turn().is_ok() {
                turns.fetch_add(1, Ordering::AcqRel);
            }
        })
    };

    for expected in 1..=10 {
        host.signal_turn();
        // Capacity 1: the next signal waits until this one is consumed.
        while turns.load(Ordering::Acquire) < expected {
            thread::yield_now();
        }
    }
    host.dispose();
    waiter.join().unwrap();
    assert_eq!(turns.load(Ordering::Acquire), 10);
}

#[test]
fn test_overflow_reported_and_batch_dropped() {
    let (host, isolated) = pair_with(ChannelConfig {
        mode: TransportMode::SharedMemory,
        segment_size: 256,
        ..ChannelConfig::default()
    });
    let big: Vec<DrawInstruction> = (0..100).map(rect).collect();
    assert!(matches!(
        isolated.publish_instructions(big),
        Err(ChannelError::Overflow { .. })
    ));
    assert!(host.drain_instructions().unwrap().is_empty());

    isolated.publish_instructions(vec![rect(1)]).unwrap();
    assert_eq!(host.drain_instructions().unwrap(), vec![rect(1)]);
}

// =============================================================================
// PROPERTIES
// =============================================================================

fn instruction_strategy() -> impl Strategy<Value = DrawInstruction> {
    let coord = -1000.0f32..1000.0;
    prop_oneof![
        Just(DrawInstruction::Clear),
        any::<u32>().prop_map(|packed| DrawInstruction::SetColor { color: Rgba::from_packed(packed) }),
        (coord.clone(), coord.clone(), 0.0f32..500.0, 0.0f32..500.0)
            .prop_map(|(x, y, width, height)| DrawInstruction::FillRect { x, y, width, height }),
        (coord.clone(), coord.clone(), 0.0f32..100.0)
            .prop_map(|(x, y, radius)| DrawInstruction::StrokeCircle { x, y, radius }),
        (coord.clone(), coord, "[a-z ]{0,12}").prop_map(|(x, y, text)| DrawInstruction::Text { x, y, text }),
    ]
}

fn batches_strategy() -> impl Strategy<Value = Vec<Vec<DrawInstruction>>> {
    prop::collection::vec(prop::collection::vec(instruction_strategy(), 0..8), 0..8)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_drain_returns_concatenation(batches in batches_strategy()) {
        for mode in MODES {
            let (host, isolated) = pair(mode);
            for batch in &batches {
                isolated.publish_instructions(batch.clone()).unwrap();
            }
            let expected: Vec<DrawInstruction> = batches.iter().flatten().cloned().collect();
            prop_assert_eq!(host.drain_instructions().unwrap(), expected);
            prop_assert!(host.drain_instructions().unwrap().is_empty());
        }
    }

    #[test]
    fn prop_last_timing_wins(frames in prop::collection::vec(any::<u64>(), 1..16)) {
        for mode in MODES {
            let (host, isolated) = pair(mode);
            for &frame in &frames {
                host.publish_timing(&TimingSnapshot { delta: 0.0, elapsed: 0.0, frame }).unwrap();
            }
            prop_assert_eq!(isolated.read_timing().frame, *frames.last().unwrap());
        }
    }
}

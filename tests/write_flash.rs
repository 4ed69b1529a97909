use flashwriter::{
    config::ImagePair,
    connection::{LinkStatus, Personality, SessionState},
    controller::{CancelToken, LivenessMonitor, SessionController},
    error::Error,
    events::{Event, EventSink, VerifyStage},
    flasher::{FlashFrequency, FlashMode, FlashSettings, FlashSize, WriteOutcome},
};
use pretty_assertions::assert_eq;

mod common;

use common::*;

fn count(events: &[Event], f: impl Fn(&Event) -> bool) -> usize {
    events.iter().filter(|event| f(event)).count()
}

#[test]
fn write_three_images_with_stub() {
    let sim = SimulatedEsp32::new();
    let controller = SessionController::new(sim.transport());
    let images = three_images();
    let config = session_config(images.clone());

    let mut events = Vec::new();
    let outcome = controller
        .write(&config, &CancelToken::new(), &mut events)
        .unwrap();

    assert_eq!(outcome, WriteOutcome::Completed { written: 3 });
    for image in &images {
        assert_eq!(sim.flash(image.address, image.data.len()), image.data);
    }

    assert!(events.contains(&Event::StubLoaded));
    assert!(matches!(events.first(), Some(Event::Connecting { port }) if port == "sim0"));
    assert_eq!(events.last(), Some(&Event::Done));
    assert_eq!(count(&events, |e| matches!(e, Event::PairStarted { total: 3, .. })), 3);
    assert_eq!(
        count(&events, |e| matches!(
            e,
            Event::PairComplete {
                compressed_size: Some(_),
                ..
            }
        )),
        3
    );
    assert_eq!(
        count(&events, |e| matches!(
            e,
            Event::VerifyOk {
                stage: VerifyStage::Write,
                ..
            }
        )),
        3
    );

    let identity = controller.identity().unwrap();
    assert_eq!(identity.description, "ESP32D0WDQ6 (revision 1)");
    assert_eq!(controller.state(), SessionState::Synced(Personality::Stub));
    assert!(!controller.is_writing());

    // Finalized with an empty begin and a compressed end, staying in the loader
    let commands = sim.commands();
    assert_eq!(commands.last(), Some(&OP_FLASH_DEFL_END));
    assert_eq!(sim.with(|device| device.begin_sizes.last().copied()), Some(0));
    assert!(!commands.contains(&OP_FLASH_DATA));
    assert!(sim.with(|device| device.download_mode));
}

#[test]
fn bootloader_partitions_and_app_with_read_back() {
    let sim = SimulatedEsp32::new();
    let controller = SessionController::new(sim.transport());
    let images = vec![
        ImagePair {
            address: 0x1000,
            name: "bootloader.bin".into(),
            data: bootloader_image(4096),
        },
        ImagePair {
            address: 0x8000,
            name: "partition-table.bin".into(),
            data: pseudo_random(3072, 2),
        },
        ImagePair {
            address: 0x10000,
            name: "app.bin".into(),
            data: pseudo_random(1_048_576, 3),
        },
    ];
    let mut config = session_config(images.clone());
    config.verify = true;

    let mut events = Vec::new();
    let outcome = controller
        .write(&config, &CancelToken::new(), &mut events)
        .unwrap();

    assert_eq!(outcome, WriteOutcome::Completed { written: 3 });
    assert_eq!(events.last(), Some(&Event::Done));
    assert_eq!(count(&events, |e| matches!(e, Event::Failed(_))), 0);
    for stage in [VerifyStage::Write, VerifyStage::ReadBack] {
        let verified: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                Event::VerifyOk {
                    address, stage: s, ..
                } if *s == stage => Some(*address),
                _ => None,
            })
            .collect();
        assert_eq!(verified, vec![0x1000, 0x8000, 0x10000]);
    }

    for image in &images {
        assert_eq!(sim.flash(image.address, image.data.len()), image.data);
    }
    assert_eq!(controller.state(), SessionState::Synced(Personality::Stub));
}

#[test]
fn block_progress_is_reported() {
    let sim = SimulatedEsp32::new();
    let controller = SessionController::new(sim.transport());
    let config = session_config(vec![ImagePair {
        address: 0x10000,
        name: "app.bin".into(),
        data: pseudo_random(0x9000, 9),
    }]);

    let mut events = Vec::new();
    controller
        .write(&config, &CancelToken::new(), &mut events)
        .unwrap();

    let progress: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            Event::WritingBlock {
                block_address,
                block,
                blocks,
                percent,
                ..
            } => Some((*block_address, *block, *blocks, *percent)),
            _ => None,
        })
        .collect();

    // Random data does not compress, three stub-sized blocks
    assert_eq!(progress.len(), 3);
    assert_eq!(progress[0], (0x10000, 0, 3, 33));
    assert_eq!(progress[1], (0x14000, 1, 3, 66));
    assert_eq!(progress[2], (0x18000, 2, 3, 100));
}

#[test]
fn second_write_reuses_session() {
    let sim = SimulatedEsp32::new();
    let controller = SessionController::new(sim.transport());
    let images = three_images();

    controller
        .write(&session_config(images.clone()), &CancelToken::new(), &mut ())
        .unwrap();
    let syncs = count_op(&sim, OP_SYNC);
    let stub_uploads = count_op(&sim, OP_MEM_BEGIN);

    let update = vec![ImagePair {
        address: 0x10000,
        name: "app.bin".into(),
        data: pseudo_random(0x1_0000, 21),
    }];
    let outcome = controller
        .write(&session_config(update.clone()), &CancelToken::new(), &mut ())
        .unwrap();

    assert_eq!(outcome, WriteOutcome::Completed { written: 1 });
    assert_eq!(sim.flash(0x10000, 0x1_0000), update[0].data);
    assert_eq!(count_op(&sim, OP_SYNC), syncs);
    assert_eq!(count_op(&sim, OP_MEM_BEGIN), stub_uploads);
}

fn count_op(sim: &SimulatedEsp32, op: u8) -> usize {
    sim.commands().iter().filter(|&&c| c == op).count()
}

#[test]
fn write_through_rom_loader() {
    let sim = SimulatedEsp32::new();
    let controller = SessionController::new(sim.transport());
    let images = vec![
        ImagePair {
            address: 0x1000,
            name: "bootloader.bin".into(),
            data: bootloader_image(0x1000),
        },
        ImagePair {
            address: 0x10000,
            name: "app.bin".into(),
            // Not a multiple of the block size
            data: pseudo_random(0x2410, 4),
        },
    ];
    let config = flashwriter::config::SessionConfig::new("sim0", images.clone());

    let mut events = Vec::new();
    let outcome = controller
        .write(&config, &CancelToken::new(), &mut events)
        .unwrap();

    assert_eq!(outcome, WriteOutcome::Completed { written: 2 });
    for image in &images {
        assert_eq!(sim.flash(image.address, image.data.len()), image.data);
    }

    assert!(matches!(&events[..], [.., Event::Done]));
    assert_eq!(count(&events, |e| matches!(e, Event::Warning(_))), 1);
    assert_eq!(
        count(&events, |e| matches!(
            e,
            Event::PairComplete {
                compressed_size: None,
                ..
            }
        )),
        2
    );
    assert_eq!(controller.state(), SessionState::Synced(Personality::Rom));

    let blocks = sim.with(|device| device.data_blocks.clone());
    assert_eq!(blocks.len(), 4 + 10);
    assert!(blocks.iter().all(|(op, _)| *op == OP_FLASH_DATA));
    // The ROM loader is never told to leave flash mode
    assert!(!sim.commands().contains(&OP_FLASH_END));
}

#[test]
fn baud_rate_is_changed_and_reverted() {
    let sim = SimulatedEsp32::new();
    let controller = SessionController::new(sim.transport());
    let mut config = session_config(three_images());
    config.baud = 921_600;

    let mut events = Vec::new();
    controller
        .write(&config, &CancelToken::new(), &mut events)
        .unwrap();

    let bauds: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            Event::BaudChanged { baud } => Some(*baud),
            _ => None,
        })
        .collect();
    assert_eq!(bauds, vec![921_600, 115_200]);
    assert_eq!(sim.with(|device| device.baud), 115_200);
    assert_eq!(controller.state(), SessionState::Synced(Personality::Stub));
}

#[test]
fn read_back_verification() {
    let sim = SimulatedEsp32::new();
    let controller = SessionController::new(sim.transport());
    let mut config = session_config(three_images());
    config.verify = true;

    let mut events = Vec::new();
    controller
        .write(&config, &CancelToken::new(), &mut events)
        .unwrap();

    let read_back: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            Event::VerifyOk {
                stage: VerifyStage::ReadBack,
                address,
                ..
            } => Some(*address),
            _ => None,
        })
        .collect();
    assert_eq!(read_back, vec![0x1000, 0x8000, 0x10000]);
    assert_eq!(
        events[events.len() - 2].to_string(),
        "-- verify OK (digest matched) at 0x00010000"
    );
}

#[test]
fn bit_flip_fails_verification() {
    let sim = SimulatedEsp32::new();
    sim.with(|device| device.corrupt_address = Some(0x8010));
    let controller = SessionController::new(sim.transport());
    let images = three_images();

    let mut events = Vec::new();
    let err = controller
        .write(&session_config(images.clone()), &CancelToken::new(), &mut events)
        .unwrap_err();

    match err {
        Error::VerificationFailed {
            address,
            expected,
            actual,
        } => {
            assert_eq!(address, 0x8000);
            assert_ne!(expected, actual);
        }
        err => panic!("unexpected error: {err:?}"),
    }

    assert!(events.contains(&Event::VerifyFailed {
        index: 1,
        address: 0x8000
    }));
    assert!(matches!(events.last(), Some(Event::Failed(_))));
    assert_eq!(controller.state(), SessionState::Failed);

    // The first image is intact, the third was never written
    assert_eq!(sim.flash(0x1000, images[0].data.len()), images[0].data);
    assert_eq!(sim.flash(0x10000, 16), vec![0xff; 16]);
}

#[test]
fn missing_digest_support_skips_verification() {
    let sim = SimulatedEsp32::new();
    sim.with(|device| device.md5_supported = false);
    let controller = SessionController::new(sim.transport());

    let mut events = Vec::new();
    let outcome = controller
        .write(&session_config(three_images()), &CancelToken::new(), &mut events)
        .unwrap();

    assert_eq!(outcome, WriteOutcome::Completed { written: 3 });
    assert_eq!(count(&events, |e| matches!(e, Event::VerifySkipped { .. })), 3);
    assert_eq!(count(&events, |e| matches!(e, Event::VerifyOk { .. })), 0);
}

#[test]
fn bootloader_header_is_patched() {
    let sim = SimulatedEsp32::new();
    let controller = SessionController::new(sim.transport());
    let bootloader = bootloader_image(0x2000);
    let mut config = session_config(vec![
        ImagePair {
            address: 0x1000,
            name: "bootloader.bin".into(),
            data: bootloader.clone(),
        },
        ImagePair {
            address: 0x20000,
            name: "copy.bin".into(),
            data: bootloader.clone(),
        },
    ]);
    config.flash = FlashSettings::new(Some(FlashMode::Qio), None, Some(FlashFrequency::_80Mhz));

    let mut events = Vec::new();
    controller
        .write(&config, &CancelToken::new(), &mut events)
        .unwrap();

    // QIO, detected 4 MB, 80 MHz
    assert_eq!(sim.flash(0x1000, 4), vec![0xe9, 0x03, 0x00, 0x2f]);
    assert_eq!(sim.flash(0x1004, 0x1ffc), bootloader[4..]);
    // Only the image at the bootloader address is touched
    assert_eq!(sim.flash(0x20000, 0x2000), bootloader);
    assert_eq!(count(&events, |e| matches!(e, Event::VerifyOk { .. })), 2);
}

#[test]
fn oversized_image_is_rejected_before_transmission() {
    let sim = SimulatedEsp32::new();
    let controller = SessionController::new(sim.transport());
    let config = session_config(vec![ImagePair {
        address: 0x10000,
        name: "huge.bin".into(),
        data: vec![0x5a; FLASH_SIZE],
    }]);

    let mut events = Vec::new();
    let err = controller
        .write(&config, &CancelToken::new(), &mut events)
        .unwrap_err();

    assert!(matches!(
        err,
        Error::FlashOverflow {
            offset: 0x10000,
            flash_size: 0x40_0000,
            ..
        }
    ));
    let commands = sim.commands();
    for op in [OP_FLASH_BEGIN, OP_FLASH_DEFL_BEGIN, OP_MEM_BEGIN] {
        assert!(!commands.contains(&op));
    }
    assert!(matches!(events.last(), Some(Event::Failed(_))));
    // Nothing was sent, the session is still good
    assert_eq!(controller.state(), SessionState::Synced(Personality::Rom));
}

#[test]
fn oversized_image_with_given_flash_size_never_touches_device() {
    let sim = SimulatedEsp32::new();
    let controller = SessionController::new(sim.transport());
    let mut config = session_config(vec![ImagePair {
        address: 0x10000,
        name: "huge.bin".into(),
        data: vec![0x5a; FLASH_SIZE],
    }]);
    config.flash = FlashSettings::new(None, Some(FlashSize::_4Mb), None);

    let mut events = Vec::new();
    let err = controller
        .write(&config, &CancelToken::new(), &mut events)
        .unwrap_err();

    assert!(matches!(
        err,
        Error::FlashOverflow {
            offset: 0x10000,
            flash_size: 0x40_0000,
            ..
        }
    ));
    assert!(sim.commands().is_empty());
    assert!(!sim.with(|device| device.download_mode));
    assert!(matches!(&events[..], [Event::Failed(_)]));
    assert_eq!(controller.state(), SessionState::Unsynced);
}

#[test]
fn image_filling_the_flash_is_accepted() {
    let sim = SimulatedEsp32::new();
    let controller = SessionController::new(sim.transport());
    let config = session_config(vec![ImagePair {
        address: 0,
        name: "full.bin".into(),
        data: vec![0x5a; FLASH_SIZE],
    }]);

    let outcome = controller
        .write(&config, &CancelToken::new(), &mut ())
        .unwrap();

    assert_eq!(outcome, WriteOutcome::Completed { written: 1 });
    assert!(sim.with(|device| device.flash.iter().all(|&b| b == 0x5a)));
}

/// Cancels the write once the second block of the image at `address` is
/// under way
struct CancelAt {
    address: u32,
    cancel: CancelToken,
    events: Vec<Event>,
}

impl EventSink for CancelAt {
    fn emit(&mut self, event: Event) {
        if let Event::WritingBlock {
            address, block: 1, ..
        } = event
        {
            if address == self.address {
                self.cancel.cancel();
            }
        }
        self.events.push(event);
    }
}

#[test]
fn cancel_during_second_image() {
    let sim = SimulatedEsp32::new();
    let controller = SessionController::new(sim.transport());
    let images = vec![
        ImagePair {
            address: 0x1000,
            name: "bootloader.bin".into(),
            data: bootloader_image(0x4c00),
        },
        ImagePair {
            address: 0x10000,
            name: "app.bin".into(),
            data: pseudo_random(0x2_3000, 3),
        },
        ImagePair {
            address: 0x40000,
            name: "storage.bin".into(),
            data: pseudo_random(0x1000, 8),
        },
    ];
    let config = session_config(images.clone());

    let cancel = CancelToken::new();
    let mut sink = CancelAt {
        address: 0x10000,
        cancel: cancel.clone(),
        events: Vec::new(),
    };
    let outcome = controller.write(&config, &cancel, &mut sink).unwrap();

    assert_eq!(
        outcome,
        WriteOutcome::Cancelled {
            completed: 1,
            total: 3
        }
    );
    assert_eq!(
        sink.events.last(),
        Some(&Event::Cancelled {
            completed: 1,
            total: 3
        })
    );

    // The block in flight was finished, nothing after it was sent
    let second_image_blocks = count(&sink.events, |e| {
        matches!(e, Event::WritingBlock { address: 0x10000, .. })
    });
    assert_eq!(second_image_blocks, 2);
    assert_eq!(sim.flash(0x1000, images[0].data.len()), images[0].data);
    assert_eq!(sim.flash(0x40000, 16), vec![0xff; 16]);

    // The session is left ready for the next write
    assert_eq!(controller.state(), SessionState::Synced(Personality::Stub));
    assert_eq!(sim.commands().last(), Some(&OP_FLASH_DEFL_END));

    let rest = session_config(images[1..].to_vec());
    let outcome = controller
        .write(&rest, &CancelToken::new(), &mut ())
        .unwrap();
    assert_eq!(outcome, WriteOutcome::Completed { written: 2 });
    assert_eq!(sim.flash(0x10000, images[1].data.len()), images[1].data);
}

#[test]
fn write_on_worker_thread() {
    let sim = SimulatedEsp32::new();
    let controller = SessionController::new(sim.transport());
    let images = three_images();

    let handle = controller
        .spawn_write(session_config(images.clone()))
        .unwrap();
    assert!(controller.is_writing());
    assert!(matches!(
        controller.write(&session_config(images.clone()), &CancelToken::new(), &mut ()),
        Err(Error::Protocol(_))
    ));

    let events: Vec<Event> = handle.events().iter().collect();
    let outcome = handle.wait().unwrap();

    assert_eq!(outcome, WriteOutcome::Completed { written: 3 });
    assert_eq!(events.last(), Some(&Event::Done));
    assert!(!controller.is_writing());
    for image in &images {
        assert_eq!(sim.flash(image.address, image.data.len()), image.data);
    }
}

#[test]
fn erase_whole_flash() {
    let sim = SimulatedEsp32::new();
    sim.with(|device| device.flash[..0x1000].fill(0));
    let controller = SessionController::new(sim.transport());

    let mut events = Vec::new();
    controller.erase_flash(Some(&stub()), &mut events).unwrap();

    assert!(sim.with(|device| device.flash.iter().all(|&b| b == 0xff)));
    assert!(events.contains(&Event::Erasing));
    assert_eq!(events.last(), Some(&Event::Done));
}

#[test]
fn erase_without_stub_is_refused() {
    let sim = SimulatedEsp32::new();
    let controller = SessionController::new(sim.transport());

    assert!(matches!(
        controller.erase_flash(None, &mut ()),
        Err(Error::StubRequired)
    ));
    assert!(!sim.commands().contains(&OP_ERASE_FLASH));
}

#[test]
fn liveness_detects_unplugged_device() {
    let sim = SimulatedEsp32::new();
    let controller = SessionController::new(sim.transport());
    controller.connect(&mut ()).unwrap();
    let monitor = LivenessMonitor::new(controller.clone());

    let mut events = Vec::new();
    assert_eq!(monitor.tick(&mut events), LinkStatus::Connected);
    assert!(events.is_empty());

    sim.with(|device| device.responsive = false);
    assert_eq!(monitor.tick(&mut events), LinkStatus::Disconnected);
    assert_eq!(events, vec![Event::Disconnected]);
    assert_eq!(controller.state(), SessionState::Failed);
    assert_eq!(controller.identity(), None);

    // Nothing more is sent to a failed session
    let sent = sim.commands().len();
    assert_eq!(monitor.tick(&mut events), LinkStatus::Disconnected);
    assert_eq!(sim.commands().len(), sent);
}

#[test]
fn hard_reset_leaves_bootloader() {
    let sim = SimulatedEsp32::new();
    let controller = SessionController::new(sim.transport());
    controller.connect(&mut ()).unwrap();

    controller.hard_reset().unwrap();

    assert!(!sim.with(|device| device.download_mode));
    assert_eq!(controller.state(), SessionState::Unsynced);
    assert_eq!(controller.identity(), None);
}

//! DMA engine behavior against the software device.

use std::sync::Arc;
use std::time::Duration;

use veos::dma::{DmaEndpoint, DmaEngine, DmaStatus, MAX_LENGTH};
use veos::error::VeosError;
use veos::testing::{IdentityTranslator, MockDmaHw};

fn engine_pair() -> (Arc<DmaEngine>, Arc<MockDmaHw>) {
    let hw = MockDmaHw::new(4 * 1024 * 1024);
    let engine = DmaEngine::open(hw.clone()).expect("engine open");
    (engine, hw)
}

#[test]
fn test_xfer_ve_to_ve_copies_bytes() {
    let (engine, hw) = engine_pair();
    hw.ve_write(0x1000, b"ABCDEFGH");
    let status = engine
        .xfer(
            &IdentityTranslator,
            DmaEndpoint::ve_phys(0x1000),
            DmaEndpoint::ve_phys(0x2000),
            8,
        )
        .unwrap();
    assert_eq!(status, DmaStatus::Ok);
    assert_eq!(hw.ve_read(0x2000, 8), b"ABCDEFGH");
    engine.close().unwrap();
}

#[test]
fn test_post_rejects_unaligned_address() {
    let (engine, _hw) = engine_pair();
    let err = engine
        .post(
            &IdentityTranslator,
            DmaEndpoint::ve_phys(0x1004),
            DmaEndpoint::ve_phys(0x2000),
            16,
        )
        .unwrap_err();
    assert!(matches!(err, VeosError::InvalidAddress { addr: 0x1004 }));
    engine.close().unwrap();
}

#[test]
fn test_post_rejects_unaligned_and_oversized_length() {
    let (engine, _hw) = engine_pair();
    for len in [12u64, MAX_LENGTH + 8] {
        let err = engine
            .post(
                &IdentityTranslator,
                DmaEndpoint::ve_phys(0x1000),
                DmaEndpoint::ve_phys(0x2000),
                len,
            )
            .unwrap_err();
        assert!(matches!(err, VeosError::InvalidArgument { .. }), "len {len}");
    }
    engine.close().unwrap();
}

#[test]
fn test_post_accepts_maximum_length() {
    let (engine, hw) = engine_pair();
    hw.set_manual(true);
    // 2^63 - 8 must be accepted; with manual completion nothing executes.
    let req = engine
        .post(
            &IdentityTranslator,
            DmaEndpoint::ve_phys(0),
            DmaEndpoint::ve_phys(0x10_0000),
            MAX_LENGTH,
        )
        .expect("maximum length accepted");
    assert_eq!(req.test(), DmaStatus::NotFinished);
    engine.terminate_all();
    assert_eq!(req.wait(), DmaStatus::Canceled);
}

#[test]
fn test_timedwait_reports_timeout_without_consuming() {
    let (engine, hw) = engine_pair();
    hw.set_manual(true);
    let req = engine
        .post(
            &IdentityTranslator,
            DmaEndpoint::ve_phys(0x1000),
            DmaEndpoint::ve_phys(0x2000),
            64,
        )
        .unwrap();
    assert_eq!(req.timedwait(Duration::from_millis(20)), DmaStatus::Timedout);

    hw.complete_posted(8);
    assert_eq!(req.wait(), DmaStatus::Ok);

    // Ring converges back to empty once the helper harvested the slots.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        let snap = engine.ring_snapshot();
        if snap.used == 0 && snap.occupied == 0 {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "ring did not drain");
        std::thread::sleep(Duration::from_millis(5));
    }
    engine.close().unwrap();
}

#[test]
fn test_cancel_midflight_then_engine_recovers() {
    let (engine, hw) = engine_pair();
    hw.set_manual(true);

    // A large transfer held in flight.
    let big = vec![0u8; 64 * 1024 * 1024];
    let req = engine
        .post(
            &IdentityTranslator,
            DmaEndpoint::ve_phys(0),
            DmaEndpoint::host_phys(big.as_ptr() as u64),
            big.len() as u64,
        )
        .unwrap();
    assert_eq!(req.test(), DmaStatus::NotFinished);

    req.terminate();
    assert_eq!(req.wait(), DmaStatus::Canceled);

    // The next post succeeds and completes.
    hw.set_manual(false);
    hw.ve_write(0x3000, b"0123456701234567");
    let status = engine
        .xfer(
            &IdentityTranslator,
            DmaEndpoint::ve_phys(0x3000),
            DmaEndpoint::ve_phys(0x4000),
            16,
        )
        .unwrap();
    assert_eq!(status, DmaStatus::Ok);
    assert_eq!(hw.ve_read(0x4000, 16), b"0123456701234567");

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        let snap = engine.ring_snapshot();
        if snap.used == 0 {
            assert_eq!(snap.occupied, 0);
            break;
        }
        assert!(std::time::Instant::now() < deadline, "ring did not drain");
        std::thread::sleep(Duration::from_millis(5));
    }
    engine.close().unwrap();
}

#[test]
fn test_ring_invariant_used_matches_occupied() {
    let (engine, hw) = engine_pair();
    hw.set_manual(true);
    let mut reqs = Vec::new();
    for i in 0..5u64 {
        reqs.push(
            engine
                .post(
                    &IdentityTranslator,
                    DmaEndpoint::ve_phys(0x1000 + i * 0x100),
                    DmaEndpoint::ve_phys(0x8000 + i * 0x100),
                    32,
                )
                .unwrap(),
        );
    }
    let snap = engine.ring_snapshot();
    assert_eq!(snap.used, snap.occupied);
    assert_eq!(snap.used, 5);

    engine.terminate_all();
    for req in &reqs {
        assert_eq!(req.wait(), DmaStatus::Canceled);
    }
    let snap = engine.ring_snapshot();
    assert_eq!(snap.used, 0);
    assert_eq!(snap.occupied, 0);
    engine.close().unwrap();
}

#[test]
fn test_close_busy_while_descriptors_used() {
    let (engine, hw) = engine_pair();
    hw.set_manual(true);
    let req = engine
        .post(
            &IdentityTranslator,
            DmaEndpoint::ve_phys(0x1000),
            DmaEndpoint::ve_phys(0x2000),
            8,
        )
        .unwrap();
    assert!(matches!(
        engine.close(),
        Err(VeosError::Busy { .. })
    ));
    engine.terminate_all();
    assert_eq!(req.wait(), DmaStatus::Canceled);
    engine.close().unwrap();
}

#[test]
fn test_translation_fault_surfaces_as_error_status() {
    let (engine, hw) = engine_pair();
    hw.poison_range(0x5000, 0x1000);
    let status = engine
        .xfer(
            &IdentityTranslator,
            DmaEndpoint::ve_phys(0x5000),
            DmaEndpoint::ve_phys(0x9000),
            64,
        )
        .unwrap();
    assert_eq!(status, DmaStatus::Error);
    engine.close().unwrap();
}

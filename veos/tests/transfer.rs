//! Memory-transfer facade scenarios on the mock node.

use veos::mm::transfer::StringError;
use veos::mm::VE_PAGE_SIZE;
use veos::testing::TestRig;

#[test]
fn test_aligned_send_recv_round_trip() {
    let rig = TestRig::new();
    let task = rig.spawn_process(100);

    rig.node
        .transfer()
        .send_data(task.pid, 0x1000, b"ABCDEFGHIJKLMNOP")
        .unwrap();
    let back = rig.node.transfer().recv_data(task.pid, 0x1000, 16).unwrap();
    assert_eq!(back, b"ABCDEFGHIJKLMNOP");
}

#[test]
fn test_unaligned_send_preserves_edges() {
    let rig = TestRig::new();
    let task = rig.spawn_process(101);

    // Preload [0x1000, 0x1020) with 0xFF.
    rig.node
        .transfer()
        .send_data(task.pid, 0x1000, &[0xFF; 32])
        .unwrap();
    rig.node
        .transfer()
        .send_data(task.pid, 0x1003, b"hello")
        .unwrap();

    let bytes = rig.hw.ve_read(0x1000, 32);
    assert_eq!(&bytes[..3], &[0xFF; 3]);
    assert_eq!(&bytes[3..8], b"hello");
    assert_eq!(&bytes[8..], &[0xFF; 24]);
}

#[test]
fn test_round_trip_law_on_unaligned_ranges() {
    let rig = TestRig::new();
    let task = rig.spawn_process(102);

    for (addr, len) in [(0x2001u64, 1usize), (0x2007, 9), (0x2ffc, 16), (0x3000, 8)] {
        let data: Vec<u8> = (0..len as u8).map(|b| b.wrapping_add(addr as u8)).collect();
        rig.node.transfer().send_data(task.pid, addr, &data).unwrap();
        let back = rig.node.transfer().recv_data(task.pid, addr, len).unwrap();
        assert_eq!(back, data, "addr {addr:#x} len {len}");
    }
}

#[test]
fn test_aligned_rung_rejects_bad_length() {
    let rig = TestRig::new();
    let task = rig.spawn_process(103);
    let err = rig
        .node
        .transfer()
        .send_aligned(task.pid, 0x1000, &[0u8; 5])
        .unwrap_err();
    assert_eq!(err.errno(), -(libc::EINVAL as i64));
}

#[test]
fn test_recv_string_finds_terminator() {
    let rig = TestRig::new();
    let task = rig.spawn_process(104);

    rig.hw.ve_write(0x2000, b"hello world\0junk");
    let s = rig.node.transfer().recv_string(task.pid, 0x2000, 64).unwrap();
    assert_eq!(s, b"hello world");
}

#[test]
fn test_recv_string_unaligned_start() {
    let rig = TestRig::new();
    let task = rig.spawn_process(105);

    rig.hw.ve_write(0x2003, b"abc\0");
    let s = rig.node.transfer().recv_string(task.pid, 0x2003, 16).unwrap();
    assert_eq!(s, b"abc");
}

#[test]
fn test_recv_string_without_nul_across_two_pages() {
    let rig = TestRig::new();
    let task = rig.spawn_process(106);

    // An 8193-byte run without NUL starting 4 KiB before a 2 MiB boundary,
    // so the scan touches exactly two VE pages.
    let from = VE_PAGE_SIZE - 4096;
    rig.hw.ve_write(from, &vec![0xAA; 8193]);
    let err = rig
        .node
        .transfer()
        .recv_string(task.pid, from, 8193)
        .unwrap_err();
    assert_eq!(err, StringError::NullNotFound);
    assert_eq!(err.code(), -2);
}

#[test]
fn test_recv_string_transfer_failure() {
    let rig = TestRig::new();
    let task = rig.spawn_process(107);

    // Beyond the mapped address space.
    let from = 9 * 1024 * 1024;
    let err = rig
        .node
        .transfer()
        .recv_string(task.pid, from, 16)
        .unwrap_err();
    assert_eq!(err, StringError::TransferFailed);
}

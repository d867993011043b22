use chat_archiver::db::snapshot::compact_image_hash;
use chat_archiver::db::Timing;

// --- Stored timestamp encoding ---

#[test]
fn test_timing_roundtrip() {
    let timing = Timing {
        millis: 1_700_000_000_123,
        realtime: true,
    };
    assert_eq!(Timing::decode(timing.encode()), timing);

    let backfill = Timing {
        millis: 1_700_000_000_123,
        realtime: false,
    };
    assert_eq!(Timing::decode(backfill.encode()), backfill);
}

#[test]
fn test_realtime_flag_is_low_bit() {
    let millis = 42;
    let realtime = Timing { millis, realtime: true };
    let backfill = Timing { millis, realtime: false };
    assert_eq!(realtime.encode() & 1, 1);
    assert_eq!(backfill.encode() & 1, 0);
    assert_eq!(realtime.encode() >> 1, millis);
    // Same instant: the realtime observation orders after the backfill one.
    assert!(realtime.encode() > backfill.encode());
}

#[test]
fn test_epoch_sentinel_encodes_zero() {
    assert_eq!(Timing::EPOCH.encode(), 0);
}

// --- Image hash compaction ---

#[test]
fn test_plain_hash_compacts_to_17_bytes() {
    let compact = compact_image_hash("0123456789abcdef0123456789abcdef").unwrap();
    assert_eq!(compact.len(), 17);
    assert_eq!(compact[0], 0);
    assert_eq!(&compact[1..3], &[0x01, 0x23]);
}

#[test]
fn test_animated_hash_sets_flag_byte() {
    let compact = compact_image_hash("a_0123456789abcdef0123456789abcdef").unwrap();
    assert_eq!(compact.len(), 17);
    assert_eq!(compact[0], 1);
}

#[test]
fn test_non_matching_hash_stays_text() {
    assert!(compact_image_hash("not-a-hash").is_none());
    assert!(compact_image_hash("0123456789abcdef").is_none());
    assert!(compact_image_hash("zz23456789abcdef0123456789abcdef").is_none());
}

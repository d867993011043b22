use chat_archiver::codec::{decode_payload, encode_payload, Inflater, ZLIB_SUFFIX};
use chat_archiver::model::GatewayPayload;
use flate2::{Compress, Compression, FlushCompress};

#[test]
fn test_payload_roundtrip() {
    let payload = GatewayPayload {
        op: 0,
        d: serde_json::json!({"content": "hello"}),
        s: Some(42),
        t: Some("MESSAGE_CREATE".to_string()),
    };
    let text = encode_payload(&payload).unwrap();
    let decoded = decode_payload(text.as_bytes()).unwrap();
    assert_eq!(decoded.op, 0);
    assert_eq!(decoded.s, Some(42));
    assert_eq!(decoded.t.as_deref(), Some("MESSAGE_CREATE"));
    assert_eq!(decoded.d["content"], "hello");
}

#[test]
fn test_decode_rejects_garbage() {
    assert!(decode_payload(b"not json").is_err());
}

/// Compress `input` as one sync-flushed zlib unit, the way the platform
/// frames its compressed transport.
fn sync_flushed(compress: &mut Compress, input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() + 64);
    compress
        .compress_vec(input, &mut out, FlushCompress::Sync)
        .unwrap();
    assert!(out.ends_with(&ZLIB_SUFFIX));
    out
}

#[test]
fn test_inflater_reassembles_fragments() {
    let mut compress = Compress::new(Compression::default(), true);
    let message = br#"{"op":10,"d":{"heartbeat_interval":41250}}"#;
    let unit = sync_flushed(&mut compress, message);

    let mut inflater = Inflater::new();
    let (first, second) = unit.split_at(unit.len() / 2);

    // First fragment lacks the flush suffix: nothing comes out yet.
    assert!(inflater.push(first).unwrap().is_none());
    let out = inflater.push(second).unwrap().expect("complete unit");
    assert_eq!(out, message);
}

#[test]
fn test_inflater_keeps_dictionary_across_units() {
    let mut compress = Compress::new(Compression::default(), true);
    let first = br#"{"op":0,"t":"MESSAGE_CREATE","d":{"content":"first"}}"#;
    let second = br#"{"op":0,"t":"MESSAGE_CREATE","d":{"content":"second"}}"#;
    let unit_a = sync_flushed(&mut compress, first);
    let unit_b = sync_flushed(&mut compress, second);

    // The second unit references the shared window; a fresh inflater per
    // unit would fail, one persistent inflater must not.
    let mut inflater = Inflater::new();
    assert_eq!(inflater.push(&unit_a).unwrap().unwrap(), first);
    assert_eq!(inflater.push(&unit_b).unwrap().unwrap(), second);
}

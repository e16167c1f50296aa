#![no_main]

use bytes::BytesMut;
use isoswitch_iso8583::{FieldCodec, FrameCodec, Iso8583Codec, LengthHeader, LengthPrefixFramer};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let codec = Iso8583Codec::default();

    // Raw payloads straight into the field decoder
    if let Ok(fields) = codec.decode(data) {
        // Anything we accept must re-encode
        let encoded = codec.encode(&fields).expect("decoded message must re-encode");
        assert_eq!(codec.decode(&encoded).as_ref(), Ok(&fields));
    }

    // Byte stream through both framers, split at an input-chosen point
    let split = data.first().map_or(0, |b| usize::from(*b)).min(data.len());
    for header in [LengthHeader::Binary2, LengthHeader::Ascii4] {
        let framer = LengthPrefixFramer::new(header, 4096);
        let mut buf = BytesMut::from(&data[..split]);
        let mut rest = &data[split..];
        loop {
            match framer.decode(&mut buf) {
                Ok(Some(payload)) => {
                    assert!(payload.len() <= framer.max_frame_size());
                    let _ = codec.decode(&payload);
                }
                Ok(None) if !rest.is_empty() => {
                    buf.extend_from_slice(rest);
                    rest = &[];
                }
                Ok(None) | Err(_) => break,
            }
        }
    }
});

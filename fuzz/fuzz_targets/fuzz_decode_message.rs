#![no_main]

use bytes::BytesMut;
use fraiseql_connector::protocol::decode_message;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut buf = BytesMut::from(data);

    // Several messages may arrive in one segment
    while let Ok(Some((_, consumed))) = decode_message(&buf) {
        let _ = buf.split_to(consumed);
    }
});

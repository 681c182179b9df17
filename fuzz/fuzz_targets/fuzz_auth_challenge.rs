#![no_main]

use fraiseql_connector::auth::derive_proof;
use fraiseql_connector::protocol::constants::tags;
use fraiseql_connector::protocol::{decode_body, AuthenticationMessage, BackendMessage};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(BackendMessage::Authentication(AuthenticationMessage::Sha256Password(mut challenge))) =
        decode_body(tags::AUTHENTICATION, data)
    else {
        return;
    };
    // Keep key derivation cheap
    challenge.iterations = challenge.iterations.min(16);
    let _ = derive_proof("password", &challenge);
});

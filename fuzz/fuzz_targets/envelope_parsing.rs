#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let s = String::from_utf8_lossy(data);

    let _ = parley_schema::decode_line(&s);
    let _ = parley_schema::decode_sse_events(&s);
    let _ = serde_json::from_str::<parley_schema::JsonRpcMessage>(&s);
});

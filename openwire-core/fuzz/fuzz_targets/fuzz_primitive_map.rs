#![no_main]

use libfuzzer_sys::fuzz_target;

use openwire_core::serialization::{map_from_bytes, map_to_bytes};

fuzz_target!(|data: &[u8]| {
    if let Ok(map) = map_from_bytes(data) {
        let _ = map.len();
        if let Ok(bytes) = map_to_bytes(&map) {
            let again = map_from_bytes(&bytes).expect("re-decode an encoded map");
            assert_eq!(again.len(), map.len());
        }
    }
});

#![no_main]

use libfuzzer_sys::fuzz_target;

use openwire_core::serialization::{BooleanStream, ByteInput, ByteOutput};

fuzz_target!(|data: &[u8]| {
    let mut input = ByteInput::new(data);
    if let Ok(mut bs) = BooleanStream::unmarshal(&mut input) {
        let mut bits = Vec::new();
        while let Ok(bit) = bs.read_boolean() {
            bits.push(bit);
        }

        let mut rebuilt = BooleanStream::new();
        for bit in &bits {
            rebuilt.write_boolean(*bit);
        }
        let mut out = ByteOutput::new();
        rebuilt.marshal(&mut out).expect("marshal rebuilt stream");
        let mut reread =
            BooleanStream::unmarshal(&mut ByteInput::new(out.as_bytes())).expect("reread");
        for bit in bits {
            assert_eq!(reread.read_boolean().expect("bit"), bit);
        }
    }
});

#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;

use openwire_core::{OpenWireCodec, OpenWireFormat, WireFormatSettings};
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    for tight in [true, false] {
        let settings = WireFormatSettings::builder()
            .tight_encoding_enabled(tight)
            .cache_enabled(true)
            .max_frame_size(1024 * 1024)
            .build()
            .expect("valid settings");
        let mut codec = OpenWireCodec::new(OpenWireFormat::new(settings));
        let mut buf = BytesMut::from(data);

        loop {
            match codec.decode(&mut buf) {
                Ok(Some(command)) => {
                    let _ = command.type_name();
                    let _ = command.command_id();
                    let _ = command.correlation_id();
                    let _ = command.is_response_required();
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }
    }
});

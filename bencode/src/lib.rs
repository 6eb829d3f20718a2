#![allow(unused)]

// Convention from https://serde.rs/conventions.html
mod encode;
mod decode;
mod error;
mod token;
pub mod raw;

pub use decode::{decode_bytes, decode_str, DecodedType};
pub use encode::{encode_to_raw, encode_to_str, encode_to_string};
pub use error::{Error, Result};
pub use raw::{find_dict_value_range, parse, parse_value, skip_value, Value};

use std::collections::HashMap;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_round_trip_on_a_minimal_torrent_dict() {
        let buf = b"d8:announce9:udp://x/a4:infod6:lengthi10e4:name1:f12:piece lengthi16384e6:pieces0:ee";
        let range = find_dict_value_range(buf, b"info").unwrap();
        let info_bytes = &buf[range];
        let reparsed = parse(info_bytes).unwrap();
        assert_eq!(reparsed.get(b"length").unwrap().as_int(), Some(10));
    }
}

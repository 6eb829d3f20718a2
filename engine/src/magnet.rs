// Magnet URI parsing (SPEC_FULL.md 6). The teacher has no magnet support at
// all; this is new, built on `url`'s percent-decoding (already a teacher
// dependency) plus `data-encoding` for the Base32 info-hash form.

use data_encoding::BASE32;

#[derive(thiserror::Error, Debug)]
pub enum MagnetError {
    #[error("not a magnet uri")]
    NotAMagnetUri,

    #[error("missing xt=urn:btih: parameter")]
    MissingInfoHash,

    #[error("info-hash is not valid hex or base32: {0}")]
    InvalidInfoHash(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetLink {
    pub info_hash: [u8; 20],
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
    pub exact_length: Option<u64>,
}

impl MagnetLink {
    pub fn parse(uri: &str) -> Result<Self, MagnetError> {
        let rest = uri.strip_prefix("magnet:?").ok_or(MagnetError::NotAMagnetUri)?;

        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers = Vec::new();
        let mut exact_length = None;

        for (key, value) in url::form_urlencoded::parse(rest.as_bytes()) {
            match key.as_ref() {
                "xt" => {
                    if let Some(btih) = value.strip_prefix("urn:btih:") {
                        info_hash = Some(decode_info_hash(btih)?);
                    }
                }
                "dn" => display_name = Some(value.into_owned()),
                "tr" => trackers.push(value.into_owned()),
                "xl" => exact_length = value.parse().ok(),
                // `ws` (web seeds) and any other key are accepted but
                // ignored - out of scope per spec.
                _ => {}
            }
        }

        Ok(Self {
            info_hash: info_hash.ok_or(MagnetError::MissingInfoHash)?,
            display_name,
            trackers,
            exact_length,
        })
    }
}

fn decode_info_hash(btih: &str) -> Result<[u8; 20], MagnetError> {
    if btih.len() == 40 {
        let bytes = hex::decode(btih).map_err(|_| MagnetError::InvalidInfoHash(btih.to_string()))?;
        let mut out = [0u8; 20];
        out.copy_from_slice(&bytes);
        Ok(out)
    } else if btih.len() == 32 {
        let bytes = BASE32
            .decode(btih.to_ascii_uppercase().as_bytes())
            .map_err(|_| MagnetError::InvalidInfoHash(btih.to_string()))?;
        if bytes.len() != 20 {
            return Err(MagnetError::InvalidInfoHash(btih.to_string()));
        }
        let mut out = [0u8; 20];
        out.copy_from_slice(&bytes);
        Ok(out)
    } else {
        Err(MagnetError::InvalidInfoHash(btih.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_info_hash_and_repeated_trackers() {
        let uri = "magnet:?xt=urn:btih:f1a8db22ffe20c7014c6267b5f68b97fdc438b1a&dn=t1.bin&tr=http%3A%2F%2Ftracker1%2Fann&tr=udp%3A%2F%2Ftracker2%3A80";
        let m = MagnetLink::parse(uri).unwrap();
        assert_eq!(hex::encode(m.info_hash), "f1a8db22ffe20c7014c6267b5f68b97fdc438b1a");
        assert_eq!(m.display_name.as_deref(), Some("t1.bin"));
        assert_eq!(m.trackers, vec!["http://tracker1/ann", "udp://tracker2:80"]);
    }

    #[test]
    fn parses_base32_info_hash() {
        // Base32 encoding of the same 20 bytes as the hex test above.
        let hex_hash = "f1a8db22ffe20c7014c6267b5f68b97fdc438b1a";
        let bytes = hex::decode(hex_hash).unwrap();
        let b32 = BASE32.encode(&bytes);
        let uri = format!("magnet:?xt=urn:btih:{b32}");
        let m = MagnetLink::parse(&uri).unwrap();
        assert_eq!(hex::encode(m.info_hash), hex_hash);
    }

    #[test]
    fn missing_xt_is_an_error() {
        assert!(matches!(MagnetLink::parse("magnet:?dn=foo"), Err(MagnetError::MissingInfoHash)));
    }

    #[test]
    fn non_magnet_uri_is_rejected() {
        assert!(matches!(MagnetLink::parse("http://example.com"), Err(MagnetError::NotAMagnetUri)));
    }
}

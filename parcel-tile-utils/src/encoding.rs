use std::borrow::Cow;
use std::io::Read as _;

use flate2::read::{GzDecoder, ZlibDecoder};

/// Transport compression of a tile payload, detected from its leading magic bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    Uncompressed,
    Gzip,
    Zlib,
    Zstd,
}

impl Encoding {
    #[must_use]
    pub fn detect(data: &[u8]) -> Self {
        if data.starts_with(b"\x1f\x8b") {
            Self::Gzip
        } else if data.starts_with(b"\x78\x9c")
            || data.starts_with(b"\x78\x01")
            || data.starts_with(b"\x78\xda")
        {
            Self::Zlib
        } else if data.starts_with(b"\x28\xb5\x2f\xfd") {
            Self::Zstd
        } else {
            Self::Uncompressed
        }
    }
}

/// Inflates a tile payload if it carries a known compression header.
///
/// Uncompressed payloads are borrowed as-is.
pub fn decode_payload(data: &[u8]) -> Result<Cow<'_, [u8]>, std::io::Error> {
    Ok(match Encoding::detect(data) {
        Encoding::Uncompressed => Cow::Borrowed(data),
        Encoding::Gzip => {
            let mut decompressed = Vec::new();
            GzDecoder::new(data).read_to_end(&mut decompressed)?;
            Cow::Owned(decompressed)
        }
        Encoding::Zlib => {
            let mut decompressed = Vec::new();
            ZlibDecoder::new(data).read_to_end(&mut decompressed)?;
            Cow::Owned(decompressed)
        }
        Encoding::Zstd => Cow::Owned(zstd::decode_all(data)?),
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use flate2::Compression;
    use flate2::write::{GzEncoder, ZlibEncoder};

    use super::*;

    const PAYLOAD: &[u8] = b"\x1a\x0c\x0a\x07parcels\x28\x80\x20\x78\x02";

    #[test]
    fn uncompressed_is_borrowed() {
        let decoded = decode_payload(PAYLOAD).unwrap();
        assert!(matches!(decoded, Cow::Borrowed(_)));
        assert_eq!(Encoding::detect(PAYLOAD), Encoding::Uncompressed);
        assert_eq!(Encoding::detect(b""), Encoding::Uncompressed);
    }

    #[test]
    fn gzip_roundtrip() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(PAYLOAD).unwrap();
        let data = encoder.finish().unwrap();
        assert_eq!(Encoding::detect(&data), Encoding::Gzip);
        assert_eq!(decode_payload(&data).unwrap().as_ref(), PAYLOAD);
    }

    #[test]
    fn zlib_roundtrip() {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(PAYLOAD).unwrap();
        let data = encoder.finish().unwrap();
        assert_eq!(Encoding::detect(&data), Encoding::Zlib);
        assert_eq!(decode_payload(&data).unwrap().as_ref(), PAYLOAD);
    }

    #[test]
    fn zstd_roundtrip() {
        let data = zstd::encode_all(PAYLOAD, 3).unwrap();
        assert_eq!(Encoding::detect(&data), Encoding::Zstd);
        assert_eq!(decode_payload(&data).unwrap().as_ref(), PAYLOAD);
    }
}

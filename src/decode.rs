//! Content-Encoding decoding

use crate::errors::{Error, Result};
use bytes::Bytes;
use flate2::read::{DeflateDecoder, MultiGzDecoder, ZlibDecoder};
use std::io::Read;

/// Decode `data` according to a `Content-Encoding` value.
///
/// Supports `identity`, `gzip`, `deflate`, `br` and `zstd`. An unknown
/// encoding or corrupt input is an error; the raw bytes are never returned
/// in place of a failed decode.
pub fn decode(data: &[u8], encoding: &str) -> Result<Bytes> {
  let encoding = encoding.trim().to_ascii_lowercase();
  match encoding.as_str() {
    "" | "identity" | "none" => Ok(Bytes::copy_from_slice(data)),
    "gzip" | "x-gzip" => read_all(MultiGzDecoder::new(data), &encoding),
    // servers disagree on whether deflate means zlib wrapped or raw deflate
    "deflate" => read_all(ZlibDecoder::new(data), &encoding)
      .or_else(|_| read_all(DeflateDecoder::new(data), &encoding)),
    "br" => read_all(brotli::Decompressor::new(data, 4096), &encoding),
    "zstd" => zstd::stream::decode_all(data)
      .map(Bytes::from)
      .map_err(|e| Error::decode(&encoding, e)),
    other => Err(Error::decode(other, "unsupported content encoding")),
  }
}

fn read_all<R: Read>(mut reader: R, encoding: &str) -> Result<Bytes> {
  let mut out = Vec::new();
  reader
    .read_to_end(&mut out)
    .map_err(|e| Error::decode(encoding, e))?;
  Ok(Bytes::from(out))
}

#[cfg(test)]
mod tests {
  use super::*;
  use flate2::write::{GzEncoder, ZlibEncoder};
  use flate2::Compression;
  use std::io::Write;

  const BODY: &[u8] = b"<html><body>hello world</body></html>";

  #[test]
  fn test_gzip_and_deflate() {
    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(BODY).unwrap();
    let gz = gz.finish().unwrap();
    assert_eq!(decode(&gz, "gzip").unwrap(), BODY);

    let mut zlib = ZlibEncoder::new(Vec::new(), Compression::default());
    zlib.write_all(BODY).unwrap();
    let zlib = zlib.finish().unwrap();
    assert_eq!(decode(&zlib, " Deflate ").unwrap(), BODY);
  }

  #[test]
  fn test_brotli_and_zstd() {
    let mut br = Vec::new();
    {
      let mut writer = brotli::CompressorWriter::new(&mut br, 4096, 5, 22);
      writer.write_all(BODY).unwrap();
    }
    assert_eq!(decode(&br, "br").unwrap(), BODY);

    let zst = zstd::stream::encode_all(BODY, 3).unwrap();
    assert_eq!(decode(&zst, "zstd").unwrap(), BODY);
  }

  #[test]
  fn test_identity_passthrough() {
    assert_eq!(decode(BODY, "identity").unwrap(), BODY);
    assert_eq!(decode(BODY, "").unwrap(), BODY);
  }

  #[test]
  fn test_failures_are_loud() {
    assert!(matches!(
      decode(BODY, "gzip"),
      Err(Error::Decode { ref encoding, .. }) if encoding == "gzip"
    ));
    assert!(matches!(
      decode(BODY, "compress"),
      Err(Error::Decode { ref encoding, .. }) if encoding == "compress"
    ));
  }
}

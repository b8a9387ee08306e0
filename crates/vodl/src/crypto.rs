// AES-128-CBC segment decryption and key material resolution.
//
// Key bytes come from a caller override or the playlist's key URI; the IV
// comes from the override, the key directive, or the segment's media
// sequence number, in that order of precedence. When a key override is
// present the playlist's key URI is never fetched.

use std::collections::HashMap;
use std::path::Path;

use aes::Aes128;
use cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7};
use m3u8::{KeyMethod, MediaPlaylist};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::error::{CryptoError, EngineError, FileSystemError};
use crate::net::HttpClient;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Resolved key material for one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentKey {
    pub key: [u8; 16],
    pub iv: [u8; 16],
}

fn parse_hex_16(input: &str) -> Result<[u8; 16], String> {
    let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    let cleaned = cleaned
        .strip_prefix("0x")
        .or_else(|| cleaned.strip_prefix("0X"))
        .unwrap_or(&cleaned);
    if cleaned.len() != 32 {
        return Err(format!(
            "expected 32 hex characters (16 bytes), got {}",
            cleaned.len()
        ));
    }
    let mut out = [0u8; 16];
    hex::decode_to_slice(cleaned, &mut out).map_err(|e| e.to_string())?;
    Ok(out)
}

/// Normalize a hex key string: whitespace stripped, optional `0x` prefix,
/// exactly 16 bytes.
pub fn parse_key_hex(input: &str) -> Result<[u8; 16], CryptoError> {
    parse_hex_16(input).map_err(|reason| CryptoError::InvalidKey { reason })
}

pub fn parse_iv_hex(input: &str) -> Result<[u8; 16], CryptoError> {
    parse_hex_16(input).map_err(|reason| CryptoError::InvalidIv { reason })
}

/// Default IV per RFC 8216: the segment's media sequence number as a
/// big-endian value, zero-padded to 16 bytes.
pub fn iv_from_sequence(sequence: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[8..].copy_from_slice(&sequence.to_be_bytes());
    iv
}

/// Decrypt a whole buffer in place, stripping PKCS#7 padding.
pub fn decrypt_bytes(
    mut data: Vec<u8>,
    key: &[u8; 16],
    iv: &[u8; 16],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes128CbcDec::new_from_slices(key, iv).map_err(|e| CryptoError::InvalidKey {
        reason: format!("failed to initialize AES decryptor: {e}"),
    })?;
    let len = cipher
        .decrypt_padded_mut::<Pkcs7>(&mut data)
        .map_err(|e| CryptoError::DecryptionFailed {
            reason: e.to_string(),
        })?
        .len();
    data.truncate(len);
    Ok(data)
}

/// Decrypt `input` to `output`, offloading the block work to the blocking
/// thread pool.
pub async fn decrypt_file(
    input: &Path,
    output: &Path,
    key: SegmentKey,
) -> Result<(), EngineError> {
    let data = tokio::fs::read(input)
        .await
        .map_err(|e| FileSystemError::from_io(input, &e, false))?;
    let decrypted = tokio::task::spawn_blocking(move || decrypt_bytes(data, &key.key, &key.iv))
        .await
        .map_err(|e| CryptoError::DecryptionFailed {
            reason: format!("decryption task failed: {e}"),
        })??;
    tokio::fs::write(output, &decrypted)
        .await
        .map_err(|e| FileSystemError::from_io(output, &e, true))?;
    Ok(())
}

/// Resolve the effective key material for every segment of a playlist.
///
/// Returns one entry per segment, `None` for plaintext segments. Key URIs
/// are fetched at most once each; with a caller-supplied key override
/// they are not fetched at all.
pub async fn resolve_segment_keys(
    playlist: &MediaPlaylist,
    base_url: &Url,
    key_override: Option<&str>,
    iv_override: Option<&str>,
    client: &HttpClient,
    token: &CancellationToken,
) -> Result<Vec<Option<SegmentKey>>, EngineError> {
    let key_override = key_override.map(parse_key_hex).transpose()?;
    let iv_override = iv_override.map(parse_iv_hex).transpose()?;

    let mut fetched: HashMap<String, [u8; 16]> = HashMap::new();
    let mut keys = Vec::with_capacity(playlist.segments.len());

    for index in 0..playlist.segments.len() {
        let directive = playlist.effective_key(index);
        let encrypted = directive.is_some_and(|d| d.method == KeyMethod::Aes128);
        if !encrypted {
            keys.push(None);
            continue;
        }
        let directive = directive.expect("encrypted implies a key directive");

        let key = match key_override {
            Some(key) => key,
            None => {
                let uri = directive.uri.as_deref().ok_or_else(|| CryptoError::InvalidKey {
                    reason: "key URI missing and no key override supplied".to_owned(),
                })?;
                let key_url = base_url.join(uri).map_err(|e| CryptoError::InvalidKey {
                    reason: format!("cannot resolve key URI `{uri}`: {e}"),
                })?;
                match fetched.get(key_url.as_str()) {
                    Some(key) => *key,
                    None => {
                        debug!(url = %key_url, "Fetching decryption key");
                        let bytes = client.get_bytes(&key_url, None, token).await?;
                        if bytes.len() != 16 {
                            return Err(CryptoError::InvalidKey {
                                reason: format!(
                                    "key from {key_url} is {} bytes, expected 16",
                                    bytes.len()
                                ),
                            }
                            .into());
                        }
                        let mut key = [0u8; 16];
                        key.copy_from_slice(&bytes);
                        fetched.insert(key_url.to_string(), key);
                        key
                    }
                }
            }
        };

        let iv = match (iv_override, &directive.iv) {
            (Some(iv), _) => iv,
            (None, Some(iv_hex)) => parse_iv_hex(iv_hex)?,
            (None, None) => iv_from_sequence(playlist.sequence_of(index)),
        };

        keys.push(Some(SegmentKey { key, iv }));
    }

    Ok(keys)
}

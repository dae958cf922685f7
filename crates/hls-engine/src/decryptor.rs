//! Decryptor: AES-128-CBC + PKCS#7 unpad, with a one-slot key cache (§4.3).

use aes::Aes128;
use cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::downloader::{FetchOutcome, UriDownloader};
use crate::error::HlsError;
use crate::model::Fragment;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// At most one cached (key URI, key bytes) pair (§3 `KeyCacheSlot`).
#[derive(Default)]
struct KeyCacheSlot {
    uri: Option<String>,
    key: Option<[u8; 16]>,
}

/// Decrypts fragment payloads, fetching and caching the AES key as needed.
///
/// Key cache access is confined to the engine task (§5 shared-resource
/// policy), but the slot is still guarded by a mutex so the type remains
/// `Sync` for the `Arc`-shared ownership the engine uses elsewhere.
pub struct Decryptor {
    slot: Mutex<KeyCacheSlot>,
}

impl Decryptor {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(KeyCacheSlot::default()),
        }
    }

    /// Decrypt `payload` in place for `fragment`, fetching the key via
    /// `downloader` if it isn't already cached under the fragment's key URI.
    pub async fn decrypt(
        &self,
        fragment: &Fragment,
        mut payload: Vec<u8>,
        downloader: &dyn UriDownloader,
        allow_cache: bool,
        token: &CancellationToken,
    ) -> Result<Vec<u8>, HlsError> {
        let Some(key_uri) = fragment.key_uri.as_deref() else {
            return Ok(payload);
        };
        let Some(iv) = fragment.iv else {
            return Err(HlsError::decrypt(format!(
                "key `{key_uri}` declared without an IV; media-sequence-derived IVs are not supported"
            )));
        };

        let key = self.resolve_key(key_uri, downloader, allow_cache, token).await?;
        let plaintext = decrypt_in_place(&mut payload, &key, &iv)?;
        Ok(plaintext)
    }

    async fn resolve_key(
        &self,
        key_uri: &str,
        downloader: &dyn UriDownloader,
        allow_cache: bool,
        token: &CancellationToken,
    ) -> Result<[u8; 16], HlsError> {
        if let Some(key) = self.cached_key_for(key_uri) {
            return Ok(key);
        }

        match downloader.fetch(key_uri, false, allow_cache, token).await {
            FetchOutcome::Completed { bytes, .. } => {
                let key: [u8; 16] = bytes.as_slice().try_into().map_err(|_| {
                    HlsError::decrypt(format!(
                        "key at {key_uri} is {} bytes, expected 16",
                        bytes.len()
                    ))
                })?;
                let mut slot = self.slot.lock();
                slot.uri = Some(key_uri.to_string());
                slot.key = Some(key);
                Ok(key)
            }
            FetchOutcome::Failed(err) => Err(err),
            FetchOutcome::Cancelled => Err(HlsError::fetch_failed(key_uri, "key fetch cancelled")),
            FetchOutcome::Void => Err(HlsError::fetch_failed(key_uri, "no key fetch attempted")),
        }
    }

    fn cached_key_for(&self, key_uri: &str) -> Option<[u8; 16]> {
        let slot = self.slot.lock();
        if slot.uri.as_deref() == Some(key_uri) {
            slot.key
        } else {
            None
        }
    }
}

impl Default for Decryptor {
    fn default() -> Self {
        Self::new()
    }
}

fn decrypt_in_place(payload: &mut [u8], key: &[u8; 16], iv: &[u8; 16]) -> Result<Vec<u8>, HlsError> {
    if payload.len() % 16 != 0 {
        return Err(HlsError::decrypt(format!(
            "ciphertext length {} is not a multiple of 16",
            payload.len()
        )));
    }
    let cipher = Aes128CbcDec::new_from_slices(key, iv)
        .map_err(|e| HlsError::decrypt(format!("invalid key/iv: {e}")))?;
    let plaintext = cipher
        .decrypt_padded_mut::<Pkcs7>(payload)
        .map_err(|e| HlsError::decrypt(format!("invalid PKCS#7 padding: {e}")))?;
    Ok(plaintext.to_vec())
}

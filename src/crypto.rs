use crate::constants::DES_KEY_LEN;
use crate::error::KafsError;

use hmac::{Hmac, Mac};
use md5::Md5;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::{error, trace};

type HmacMd5 = Hmac<Md5>;

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum EncryptionType {
    DES_CBC_CRC = 1,
    DES_CBC_MD4 = 2,
    DES_CBC_MD5 = 3,
    DES3_CBC_MD5 = 5,
    DES3_CBC_SHA1 = 7,
    DES3_CBC_SHA1_KD = 16,
    AES128_CTS_HMAC_SHA1_96 = 17,
    AES256_CTS_HMAC_SHA1_96 = 18,
    AES128_CTS_HMAC_SHA256_128 = 19,
    AES256_CTS_HMAC_SHA384_192 = 20,
    RC4_HMAC = 23,
    RC4_HMAC_EXP = 24,
    CAMELLIA128_CTS_CMAC = 25,
    CAMELLIA256_CTS_CMAC = 26,
}

// DES weak and semi-weak keys, with parity already applied.
const DES_WEAK_KEYS: [[u8; DES_KEY_LEN]; 16] = [
    [0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01],
    [0xfe, 0xfe, 0xfe, 0xfe, 0xfe, 0xfe, 0xfe, 0xfe],
    [0xe0, 0xe0, 0xe0, 0xe0, 0xf1, 0xf1, 0xf1, 0xf1],
    [0x1f, 0x1f, 0x1f, 0x1f, 0x0e, 0x0e, 0x0e, 0x0e],
    [0x01, 0xfe, 0x01, 0xfe, 0x01, 0xfe, 0x01, 0xfe],
    [0xfe, 0x01, 0xfe, 0x01, 0xfe, 0x01, 0xfe, 0x01],
    [0x1f, 0xe0, 0x1f, 0xe0, 0x0e, 0xf1, 0x0e, 0xf1],
    [0xe0, 0x1f, 0xe0, 0x1f, 0xf1, 0x0e, 0xf1, 0x0e],
    [0x01, 0xe0, 0x01, 0xe0, 0x01, 0xf1, 0x01, 0xf1],
    [0xe0, 0x01, 0xe0, 0x01, 0xf1, 0x01, 0xf1, 0x01],
    [0x1f, 0xfe, 0x1f, 0xfe, 0x0e, 0xfe, 0x0e, 0xfe],
    [0xfe, 0x1f, 0xfe, 0x1f, 0xfe, 0x0e, 0xfe, 0x0e],
    [0x01, 0x1f, 0x01, 0x1f, 0x01, 0x0e, 0x01, 0x0e],
    [0x1f, 0x01, 0x1f, 0x01, 0x0e, 0x01, 0x0e, 0x01],
    [0xe0, 0xfe, 0xe0, 0xfe, 0xf1, 0xfe, 0xf1, 0xfe],
    [0xfe, 0xe0, 0xfe, 0xe0, 0xfe, 0xf1, 0xfe, 0xf1],
];

const RXKAD_KDF_LABEL: &[u8] = b"rxkad\0";
// L, the number of output bits requested, as a 32 bit big endian integer.
const RXKAD_KDF_OUTPUT_BITS: [u8; 4] = 64u32.to_be_bytes();

fn des_set_odd_parity(key: &mut [u8; DES_KEY_LEN]) {
    for b in key.iter_mut() {
        let v = *b & 0xfe;
        *b = if v.count_ones() % 2 == 0 { v | 0x01 } else { v };
    }
}

fn des_is_weak_key(key: &[u8; DES_KEY_LEN]) -> bool {
    DES_WEAK_KEYS.iter().any(|weak| weak == key)
}

/// Squeeze the parity bits out of a DES3 key. Each 8 byte block carries the low
/// bits of its first seven bytes in its last byte, and becomes 7 bytes of key.
fn des3_compress_parity(key: &[u8]) -> Result<Vec<u8>, KafsError> {
    if key.len() % DES_KEY_LEN != 0 {
        error!(key_len = key.len(), "DES3 session key is not a whole number of blocks");
        return Err(KafsError::InvalidEncryptionKey);
    }

    let mut out = Vec::with_capacity(key.len() / DES_KEY_LEN * 7);
    for block in key.chunks_exact(DES_KEY_LEN) {
        let mut bits = block[7] >> 1;
        for b in &block[..7] {
            out.push((b & 0xfe) | (bits & 0x01));
            bits >>= 1;
        }
    }
    Ok(out)
}

/// The rxkad-kdf from draft-kaduk-afs3-rxkad-k5-kdf: HMAC-MD5 keyed by the session
/// key over a one byte counter, the label and the output length. The counter is
/// bumped until the output is not a weak DES key.
fn rxkad_kdf(key: &[u8]) -> Result<[u8; DES_KEY_LEN], KafsError> {
    let base = HmacMd5::new_from_slice(key).map_err(|_| KafsError::InvalidEncryptionKey)?;

    for counter in 1..=u8::MAX {
        let mut mac = base.clone();
        mac.update(&[counter]);
        mac.update(RXKAD_KDF_LABEL);
        mac.update(&RXKAD_KDF_OUTPUT_BITS);
        let digest = mac.finalize().into_bytes();

        let mut out = [0u8; DES_KEY_LEN];
        out.copy_from_slice(&digest[..DES_KEY_LEN]);
        des_set_odd_parity(&mut out);

        if !des_is_weak_key(&out) {
            trace!(?counter, "rxkad kdf converged");
            return Ok(out);
        }
    }

    // 255 weak keys in a row from a keyed hash. Not going to happen, but don't
    // hand the kernel something it will reject.
    error!("rxkad kdf exhausted its counter");
    Err(KafsError::InvalidEncryptionKey)
}

/// Derive the 8 byte session key rxkad needs from a Kerberos 5 session key of any
/// supported enctype.
pub(crate) fn derive_des_key(enctype: i32, key: &[u8]) -> Result<[u8; DES_KEY_LEN], KafsError> {
    let Ok(etype) = EncryptionType::try_from(enctype) else {
        error!(?enctype, "unknown session key enctype");
        return Err(KafsError::UnsupportedEncryption);
    };

    match etype {
        EncryptionType::DES_CBC_CRC
        | EncryptionType::DES_CBC_MD4
        | EncryptionType::DES_CBC_MD5 => {
            let des_key: [u8; DES_KEY_LEN] = key
                .get(..DES_KEY_LEN)
                .and_then(|k| k.try_into().ok())
                .ok_or_else(|| {
                    error!(key_len = key.len(), "DES session key is too short");
                    KafsError::InvalidEncryptionKey
                })?;
            Ok(des_key)
        }
        EncryptionType::DES3_CBC_MD5
        | EncryptionType::DES3_CBC_SHA1
        | EncryptionType::DES3_CBC_SHA1_KD => rxkad_kdf(&des3_compress_parity(key)?),
        EncryptionType::AES128_CTS_HMAC_SHA1_96
        | EncryptionType::AES256_CTS_HMAC_SHA1_96
        | EncryptionType::AES128_CTS_HMAC_SHA256_128
        | EncryptionType::AES256_CTS_HMAC_SHA384_192
        | EncryptionType::RC4_HMAC
        | EncryptionType::RC4_HMAC_EXP
        | EncryptionType::CAMELLIA128_CTS_CMAC
        | EncryptionType::CAMELLIA256_CTS_CMAC => rxkad_kdf(key),
    }
}

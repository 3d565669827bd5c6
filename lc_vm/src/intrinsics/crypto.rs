//! DES plumbing behind the `javax/crypto` intrinsics.
//!
//! ZKM emits `DES/CBC/PKCS5Padding` (occasionally ECB); a padding failure
//! after decryption is the canonical wrong-key signal and must surface as
//! `BadPaddingException`, never as a sandbox bug.

use crate::{Result, VmError};
use cipher::block_padding::Pkcs7;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit};
use des::Des;

const ENCRYPT_MODE: i32 = 1;
const DECRYPT_MODE: i32 = 2;

pub(super) struct Transformation {
    cbc: bool,
}

pub(super) fn parse_transformation(spec: &str) -> Result<Transformation> {
    let mut parts = spec.split('/');
    let algorithm = parts.next().unwrap_or_default();
    let mode = parts.next().unwrap_or("ECB");
    if !algorithm.eq_ignore_ascii_case("DES") {
        return Err(VmError::thrown(
            "java/security/NoSuchAlgorithmException",
            Some(spec.to_string()),
        ));
    }
    let cbc = match mode.to_ascii_uppercase().as_str() {
        "CBC" => true,
        "ECB" => false,
        _ => {
            return Err(VmError::thrown(
                "java/security/NoSuchAlgorithmException",
                Some(spec.to_string()),
            ))
        }
    };
    Ok(Transformation { cbc })
}

pub(super) fn run(
    spec: &str,
    mode: i32,
    key: &[u8],
    iv: &[u8],
    data: &[u8],
) -> Result<Vec<u8>> {
    let transformation = parse_transformation(spec)?;
    let key: [u8; 8] = key
        .get(..8)
        .and_then(|k| k.try_into().ok())
        .ok_or_else(|| {
            VmError::thrown("java/security/InvalidKeyException", Some(format!(
                "DES key length {}",
                key.len()
            )))
        })?;
    let iv: [u8; 8] = if transformation.cbc {
        iv.get(..8).and_then(|v| v.try_into().ok()).unwrap_or([0; 8])
    } else {
        [0; 8]
    };

    match mode {
        ENCRYPT_MODE => Ok(if transformation.cbc {
            cbc::Encryptor::<Des>::new(&key.into(), &iv.into())
                .encrypt_padded_vec_mut::<Pkcs7>(data)
        } else {
            ecb::Encryptor::<Des>::new(&key.into()).encrypt_padded_vec_mut::<Pkcs7>(data)
        }),
        DECRYPT_MODE => {
            let decrypted = if transformation.cbc {
                cbc::Decryptor::<Des>::new(&key.into(), &iv.into())
                    .decrypt_padded_vec_mut::<Pkcs7>(data)
            } else {
                ecb::Decryptor::<Des>::new(&key.into()).decrypt_padded_vec_mut::<Pkcs7>(data)
            };
            decrypted.map_err(|_| {
                VmError::thrown(
                    "javax/crypto/BadPaddingException",
                    Some("Given final block not properly padded".to_string()),
                )
            })
        }
        other => Err(VmError::thrown(
            "java/lang/IllegalStateException",
            Some(format!("cipher mode {}", other)),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn des_cbc_round_trip() {
        let key = *b"\x11\x22\x33\x44\x55\x66\x77\x88";
        let iv = [0u8; 8];
        let plain = b"attack at dawn";
        let encrypted = run("DES/CBC/PKCS5Padding", 1, &key, &iv, plain).unwrap();
        assert_ne!(&encrypted[..], &plain[..]);
        let decrypted = run("DES/CBC/PKCS5Padding", 2, &key, &iv, &encrypted).unwrap();
        assert_eq!(decrypted, plain);
    }

    #[test]
    fn wrong_key_is_bad_padding() {
        let key = *b"\x11\x22\x33\x44\x55\x66\x77\x88";
        let wrong = *b"\x88\x77\x66\x55\x44\x33\x22\x11";
        let iv = [0u8; 8];
        let encrypted = run("DES/CBC/PKCS5Padding", 1, &key, &iv, b"payload text").unwrap();
        let err = run("DES/CBC/PKCS5Padding", 2, &wrong, &iv, &encrypted).unwrap_err();
        assert!(err.is_bad_padding());
    }

    #[test]
    fn rejects_unknown_algorithm() {
        assert!(run("AES/CBC/PKCS5Padding", 2, &[0; 8], &[0; 8], &[]).is_err());
    }
}

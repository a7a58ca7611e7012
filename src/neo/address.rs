// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Neo N3 verification script, script hash, address and WIF encoding.

use ripemd::Ripemd160;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

use super::SignerError;

/// N3 address version byte (addresses start with `N`).
pub const ADDRESS_VERSION: u8 = 0x35;

const WIF_VERSION: u8 = 0x80;
const WIF_COMPRESSED_FLAG: u8 = 0x01;
const WIF_PAYLOAD_LEN: usize = 34;
const CHECKSUM_LEN: usize = 4;

const PUSHDATA1: u8 = 0x0c;
const SYSCALL: u8 = 0x41;
/// Interop hash of `System.Crypto.CheckSig`.
const CHECKSIG_SYSCALL: [u8; 4] = [0x56, 0xe7, 0xb3, 0x27];

/// Single-signature verification script for a compressed public key.
pub fn verification_script(compressed_pubkey: &[u8; 33]) -> Vec<u8> {
    let mut script = Vec::with_capacity(40);
    script.push(PUSHDATA1);
    script.push(33);
    script.extend_from_slice(compressed_pubkey);
    script.push(SYSCALL);
    script.extend_from_slice(&CHECKSIG_SYSCALL);
    script
}

/// `RIPEMD160(SHA256(script))`.
pub fn script_hash(script: &[u8]) -> [u8; 20] {
    Ripemd160::digest(Sha256::digest(script)).into()
}

pub fn address_from_script_hash(hash: &[u8; 20]) -> String {
    let mut payload = Vec::with_capacity(21);
    payload.push(ADDRESS_VERSION);
    payload.extend_from_slice(hash);
    base58check_encode(&payload)
}

/// N3 address of a compressed public key.
pub fn address_from_public_key(compressed_pubkey: &[u8; 33]) -> String {
    address_from_script_hash(&script_hash(&verification_script(compressed_pubkey)))
}

/// Encode a private key as compressed-key WIF.
pub fn encode_wif(private_key: &[u8; 32]) -> Zeroizing<String> {
    let mut payload = Zeroizing::new(Vec::with_capacity(WIF_PAYLOAD_LEN));
    payload.push(WIF_VERSION);
    payload.extend_from_slice(private_key);
    payload.push(WIF_COMPRESSED_FLAG);
    Zeroizing::new(base58check_encode(&payload))
}

/// Decode a WIF string into the raw private key.
///
/// The intermediate decoded buffer is zeroed before returning.
pub fn decode_wif(wif: &str) -> Result<Zeroizing<[u8; 32]>, SignerError> {
    let decoded = Zeroizing::new(
        bs58::decode(wif.trim())
            .into_vec()
            .map_err(|_| SignerError::InvalidInput("WIF is not valid base58".to_string()))?,
    );

    if decoded.len() != WIF_PAYLOAD_LEN + CHECKSUM_LEN {
        return Err(SignerError::InvalidInput(format!(
            "WIF decodes to {} bytes, expected {}",
            decoded.len(),
            WIF_PAYLOAD_LEN + CHECKSUM_LEN
        )));
    }

    let (payload, checksum) = decoded.split_at(WIF_PAYLOAD_LEN);
    if checksum4(payload) != checksum {
        return Err(SignerError::InvalidInput("WIF checksum mismatch".to_string()));
    }
    if payload[0] != WIF_VERSION {
        return Err(SignerError::InvalidInput("WIF version byte is not 0x80".to_string()));
    }
    if payload[33] != WIF_COMPRESSED_FLAG {
        return Err(SignerError::InvalidInput(
            "WIF does not describe a compressed key".to_string(),
        ));
    }

    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&payload[1..33]);
    Ok(key)
}

fn checksum4(data: &[u8]) -> [u8; CHECKSUM_LEN] {
    let mut first = Sha256::digest(data);
    let second = Sha256::digest(first.as_slice());
    first.as_mut_slice().zeroize();
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&second[..CHECKSUM_LEN]);
    out
}

fn base58check_encode(payload: &[u8]) -> String {
    let mut data = Zeroizing::new(Vec::with_capacity(payload.len() + CHECKSUM_LEN));
    data.extend_from_slice(payload);
    data.extend_from_slice(&checksum4(payload));
    bs58::encode(data.as_slice()).into_string()
}

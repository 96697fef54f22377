//! RSA public keys, fingerprint computation and the MTProto RSA-PAD scheme.

use num_bigint::BigUint;

use crate::{aes, sha1, sha256};

/// An RSA public key `(n, e)`.
pub struct Key {
    n: BigUint,
    e: BigUint,
}

impl Key {
    /// Parse decimal `n` and `e` strings.
    pub fn new(n: &str, e: &str) -> Option<Self> {
        Some(Self {
            n: BigUint::parse_bytes(n.as_bytes(), 10)?,
            e: BigUint::parse_bytes(e.as_bytes(), 10)?,
        })
    }

    /// Telegram's key fingerprint: the low 64 bits of
    /// `SHA1(tl_bytes(n) ∥ tl_bytes(e))`.
    pub fn fingerprint(&self) -> i64 {
        let mut buf = Vec::new();
        tl_bytes(&mut buf, &self.n.to_bytes_be());
        tl_bytes(&mut buf, &self.e.to_bytes_be());
        let sha = sha1!(&buf);
        i64::from_le_bytes(sha[12..20].try_into().unwrap())
    }
}

/// TL `bytes` encoding: length prefix plus zero padding to a 4-byte boundary.
fn tl_bytes(out: &mut Vec<u8>, data: &[u8]) {
    let header_len = if data.len() <= 253 {
        out.push(data.len() as u8);
        1
    } else {
        out.push(0xfe);
        out.push((data.len() & 0xff) as u8);
        out.push(((data.len() >> 8) & 0xff) as u8);
        out.push(((data.len() >> 16) & 0xff) as u8);
        4
    };
    out.extend_from_slice(data);
    let padding = (4 - ((header_len + data.len()) % 4)) % 4;
    out.extend(std::iter::repeat(0u8).take(padding));
}

// ─── Key register ────────────────────────────────────────────────────────────

/// The set of server public keys a client trusts.
///
/// Read-only after construction. The handshake picks the first server-offered
/// fingerprint that matches a registered key.
pub struct RsaKeyRegister {
    keys: Vec<(i64, Key)>,
}

impl RsaKeyRegister {
    /// An empty register. Useful for tests and custom deployments.
    pub fn empty() -> Self {
        Self { keys: Vec::new() }
    }

    /// Register a key; its fingerprint is computed on insertion.
    pub fn add(&mut self, key: Key) {
        self.keys.push((key.fingerprint(), key));
    }

    /// Find the first of `fingerprints` that matches a registered key.
    pub fn find(&self, fingerprints: &[i64]) -> Option<(i64, &Key)> {
        fingerprints.iter().find_map(|fp| {
            self.keys
                .iter()
                .find(|(known, _)| known == fp)
                .map(|(known, key)| (*known, key))
        })
    }
}

impl Default for RsaKeyRegister {
    /// The production and test DC keys currently published by Telegram.
    fn default() -> Self {
        let mut register = Self::empty();
        register.add(Key::new(
            "29379598170669337022986177149456128565388431120058863768162556424047512191330847455146576344487764408661701890505066208632169112269581063774293102577308490531282748465986139880977280302242772832972539403531316010870401287642763009136156734339538042419388722777357134487746169093539093850251243897188928735903389451772730245253062963384108812842079887538976360465290946139638691491496062099570836476454855996319192747663615955633778034897140982517446405334423701359108810182097749467210509584293428076654573384828809574217079944388301239431309115013843331317877374435868468779972014486325557807783825502498215169806323",
            "65537",
        ).expect("builtin production key"));
        register.add(Key::new(
            "25342889448840415564971689590713473206898847759084779052582026594546022463853940585885215951168491965708222649399180603818074200620463776135424884632162512403163793083921641631564740959529419359595852941166848940585952337613333022396096584117954892216031229237302943701877588456738335398602461675225081791820393153757504952636234951323237820036543581047826906120927972487366805292115792231423684261262330394324750785450942589751755390156647751460719351439969059949569615302809050721500330239005077889855323917509948255722081644689442127297605422579707142646660768825302832201908302295573257427896031830742328565032949",
            "65537",
        ).expect("builtin test key"));
        register
    }
}

// ─── RSA-PAD encryption ──────────────────────────────────────────────────────

/// RSA-encrypt `data` with the MTProto RSA-PAD construction.
///
/// `random_bytes` supplies the padding (first 192 bytes) and the initial
/// inner AES key (last 32); `data` must be at most 144 bytes. Layout of the
/// 256-byte block that goes through the modulus, per attempt:
///
/// ```text
/// (aes_key ⊕ SHA256(ige)) ∥ ige
///   where ige = AES-IGE( reverse(padded) ∥ SHA256(aes_key ∥ padded), aes_key, 0 )
/// ```
pub fn encrypt_hashed(data: &[u8], key: &Key, random_bytes: &[u8; 224]) -> Vec<u8> {
    assert!(data.len() <= 144, "RSA-PAD payload limit is 144 bytes");

    let mut padded = [0u8; 192];
    padded[..data.len()].copy_from_slice(data);
    padded[data.len()..].copy_from_slice(&random_bytes[..192 - data.len()]);

    let mut aes_key: [u8; 32] = random_bytes[192..].try_into().unwrap();

    // Retry with an incremented key until the block is numerically below
    // the modulus.
    let block = loop {
        let mut inner = [0u8; 224];
        for (dst, src) in inner[..192].iter_mut().zip(padded.iter().rev()) {
            *dst = *src;
        }
        inner[192..].copy_from_slice(&sha256!(&aes_key, &padded));
        aes::ige_encrypt(&mut inner, &aes_key, &[0u8; 32]);

        let digest = sha256!(&inner);
        let mut block = [0u8; 256];
        for (dst, (k, d)) in block[..32].iter_mut().zip(aes_key.iter().zip(&digest)) {
            *dst = k ^ d;
        }
        block[32..].copy_from_slice(&inner);

        if BigUint::from_bytes_be(&block) < key.n {
            break block;
        }
        bump_key(&mut aes_key);
    };

    let encrypted = BigUint::from_bytes_be(&block).modpow(&key.e, &key.n);
    let bytes = encrypted.to_bytes_be();
    let mut out = vec![0u8; 256 - bytes.len()];
    out.extend_from_slice(&bytes);
    out
}

/// Treat the key as a 256-bit big-endian counter and add one.
fn bump_key(key: &mut [u8; 32]) {
    for byte in key.iter_mut().rev() {
        let (sum, carry) = byte.overflowing_add(1);
        *byte = sum;
        if !carry {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_fingerprints_match_published_values() {
        let register = RsaKeyRegister::default();
        assert!(register.find(&[-3414540481677951611]).is_some(), "production key");
        assert!(register.find(&[-5595554452916591101]).is_some(), "test key");
        assert!(register.find(&[1]).is_none());
    }

    #[test]
    fn find_respects_server_preference_order() {
        let register = RsaKeyRegister::default();
        let (fp, _) = register
            .find(&[42, -5595554452916591101, -3414540481677951611])
            .unwrap();
        assert_eq!(fp, -5595554452916591101);
    }

    #[test]
    fn encrypted_block_is_exactly_256_bytes() {
        let register = RsaKeyRegister::default();
        let (_, key) = register.find(&[-3414540481677951611]).unwrap();
        let block = encrypt_hashed(&[1u8; 100], key, &[7u8; 224]);
        assert_eq!(block.len(), 256);
    }

    #[test]
    fn bump_key_carries_through_trailing_ff() {
        let mut key = [0u8; 32];
        key[30] = 1;
        key[31] = 0xff;
        bump_key(&mut key);
        assert_eq!(key[30], 2);
        assert_eq!(key[31], 0);

        let mut all_ff = [0xffu8; 32];
        bump_key(&mut all_ff);
        assert_eq!(all_ff, [0u8; 32]);
    }
}

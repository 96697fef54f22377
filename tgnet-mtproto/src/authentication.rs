//! Sans-IO auth-key generation.
//!
//! Each step consumes the previous opaque state plus the server's response
//! and yields the next request. The caller owns the transport and the retry
//! policy.
//!
//! ```text
//! let (req, s1) = authentication::step1();
//! // send req, receive resp
//! let (req, s2) = authentication::step2(&keys, s1, resp, dc_id)?;
//! // send req, receive resp
//! let (req, s3) = authentication::step3(&checker, s2, resp)?;
//! // send req, receive resp
//! let done = authentication::finish(s3, resp)?;
//! // done.auth_key is ready
//! ```

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use num_bigint::BigUint;
use tgnet_crypto::rsa::{self, RsaKeyRegister};
use tgnet_crypto::{aes, factorize, generate_key_data_from_nonce, sha1, AuthKey};
use tgnet_tl::mtproto::{
    ClientDhInnerData, DhGen, PQInnerDataDc, ReqDhParams, ReqPqMulti, ServerDhInnerData,
    ServerDhParams, SetClientDhParams,
};
use tgnet_tl::{Cursor, Deserializable, Serializable};

use crate::dh::DhPrimeChecker;

// ─── Error ───────────────────────────────────────────────────────────────────

/// Errors that can occur during auth-key generation.
///
/// Nonce mismatches abort the whole handshake; [`Error::DhGenRetry`] restarts
/// from [`step2`]'s response under the caller's retry budget.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    InvalidNonce { got: [u8; 16], expected: [u8; 16] },
    InvalidServerNonce { got: [u8; 16], expected: [u8; 16] },
    InvalidPqSize { size: usize },
    FactorizationFailed { pq: u64 },
    NoMatchingRsaKey { fingerprints: Vec<i64> },
    DhParamsFail,
    EncryptedResponseNotPadded { len: usize },
    InvalidDhInnerData { error: tgnet_tl::deserialize::Error },
    BadDhPrime,
    GParameterOutOfRange { low: BigUint, high: BigUint },
    DhGenRetry,
    DhGenFail,
    InvalidAnswerHash,
    InvalidNewNonceHash,
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidNonce { got, expected } => {
                write!(f, "nonce mismatch: got {got:?}, expected {expected:?}")
            }
            Self::InvalidServerNonce { got, expected } => {
                write!(f, "server_nonce mismatch: got {got:?}, expected {expected:?}")
            }
            Self::InvalidPqSize { size } => write!(f, "pq size {size} invalid (expected 8)"),
            Self::FactorizationFailed { pq } => write!(f, "could not factorize pq {pq}"),
            Self::NoMatchingRsaKey { fingerprints } => {
                write!(f, "no known RSA fingerprint in {fingerprints:?}")
            }
            Self::DhParamsFail => write!(f, "server rejected DH parameters"),
            Self::EncryptedResponseNotPadded { len } => {
                write!(f, "encrypted answer len {len} is not 16-byte aligned")
            }
            Self::InvalidDhInnerData { error } => {
                write!(f, "DH inner data deserialization error: {error}")
            }
            Self::BadDhPrime => write!(f, "server DH prime failed validation"),
            Self::GParameterOutOfRange { low, high } => {
                write!(f, "DH parameter out of range ({low}, {high})")
            }
            Self::DhGenRetry => write!(f, "DH gen retry requested"),
            Self::DhGenFail => write!(f, "DH gen failed"),
            Self::InvalidAnswerHash => write!(f, "DH answer hash mismatch"),
            Self::InvalidNewNonceHash => write!(f, "new nonce hash mismatch"),
        }
    }
}

// ─── Step state ──────────────────────────────────────────────────────────────

/// State after step 1.
pub struct Step1 {
    nonce: [u8; 16],
}

/// State after step 2.
pub struct Step2 {
    nonce: [u8; 16],
    server_nonce: [u8; 16],
    new_nonce: [u8; 32],
}

/// State after step 3.
pub struct Step3 {
    nonce: [u8; 16],
    server_nonce: [u8; 16],
    new_nonce: [u8; 32],
    gab: BigUint,
    time_offset: i32,
}

/// The output of a successful handshake.
#[derive(Clone, Debug, PartialEq)]
pub struct Finished {
    /// The 256-byte authorization key.
    pub auth_key: [u8; 256],
    /// Clock skew in seconds relative to the server.
    pub time_offset: i32,
    /// The bootstrap server salt derived from the nonces.
    pub first_salt: i64,
}

// ─── Step 1: req_pq_multi ────────────────────────────────────────────────────

/// Generate the opening `req_pq_multi` request.
pub fn step1() -> (ReqPqMulti, Step1) {
    let mut nonce = [0u8; 16];
    getrandom::getrandom(&mut nonce).expect("getrandom");
    do_step1(&nonce)
}

fn do_step1(random: &[u8; 16]) -> (ReqPqMulti, Step1) {
    let nonce = *random;
    (ReqPqMulti { nonce }, Step1 { nonce })
}

// ─── Step 2: req_DH_params ───────────────────────────────────────────────────

/// Process `resPQ` and generate `req_DH_params`.
///
/// `dc_id` goes into the RSA-encrypted inner payload; pass the negative id
/// for test datacenters.
pub fn step2(
    keys: &RsaKeyRegister,
    data: Step1,
    response: tgnet_tl::mtproto::ResPq,
    dc_id: i32,
) -> Result<(ReqDhParams, Step2), Error> {
    let mut rnd = [0u8; 256];
    getrandom::getrandom(&mut rnd).expect("getrandom");
    do_step2(keys, data, response, dc_id, &rnd)
}

fn do_step2(
    keys: &RsaKeyRegister,
    data: Step1,
    response: tgnet_tl::mtproto::ResPq,
    dc_id: i32,
    random: &[u8; 256],
) -> Result<(ReqDhParams, Step2), Error> {
    let Step1 { nonce } = data;
    check_nonce(&response.nonce, &nonce)?;

    if response.pq.len() != 8 {
        return Err(Error::InvalidPqSize { size: response.pq.len() });
    }
    let pq = u64::from_be_bytes(response.pq.as_slice().try_into().unwrap());
    let (p, q) = factorize(pq).ok_or(Error::FactorizationFailed { pq })?;

    let mut new_nonce = [0u8; 32];
    new_nonce.copy_from_slice(&random[..32]);

    // random[32..] is the 224 bytes of RSA-PAD randomness
    let rnd224: &[u8; 224] = random[32..].try_into().unwrap();

    fn trim_be(v: u64) -> Vec<u8> {
        let b = v.to_be_bytes();
        let skip = b.iter().position(|&x| x != 0).unwrap_or(7);
        b[skip..].to_vec()
    }
    let p_bytes = trim_be(p);
    let q_bytes = trim_be(q);

    let inner = PQInnerDataDc {
        pq: pq.to_be_bytes().to_vec(),
        p: p_bytes.clone(),
        q: q_bytes.clone(),
        nonce,
        server_nonce: response.server_nonce,
        new_nonce,
        dc: dc_id,
    }
    .to_bytes();

    let (fingerprint, key) = keys
        .find(&response.server_public_key_fingerprints)
        .ok_or_else(|| Error::NoMatchingRsaKey {
            fingerprints: response.server_public_key_fingerprints.clone(),
        })?;

    let ciphertext = rsa::encrypt_hashed(&inner, key, rnd224);

    Ok((
        ReqDhParams {
            nonce,
            server_nonce: response.server_nonce,
            p: p_bytes,
            q: q_bytes,
            public_key_fingerprint: fingerprint,
            encrypted_data: ciphertext,
        },
        Step2 { nonce, server_nonce: response.server_nonce, new_nonce },
    ))
}

// ─── Step 3: set_client_DH_params ────────────────────────────────────────────

/// Process `Server_DH_Params` and generate `set_client_DH_params`.
pub fn step3(
    checker: &dyn DhPrimeChecker,
    data: Step2,
    response: ServerDhParams,
) -> Result<(SetClientDhParams, Step3), Error> {
    let mut rnd = [0u8; 272]; // 256 for b, 16 for padding
    getrandom::getrandom(&mut rnd).expect("getrandom");
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i32;
    do_step3(checker, data, response, &rnd, now)
}

fn do_step3(
    checker: &dyn DhPrimeChecker,
    data: Step2,
    response: ServerDhParams,
    random: &[u8; 272],
    now: i32,
) -> Result<(SetClientDhParams, Step3), Error> {
    let Step2 { nonce, server_nonce, new_nonce } = data;

    let mut ok = match response {
        ServerDhParams::Fail(fail) => {
            check_nonce(&fail.nonce, &nonce)?;
            check_server_nonce(&fail.server_nonce, &server_nonce)?;
            let digest = sha1!(new_nonce);
            if fail.new_nonce_hash != digest[4..] {
                return Err(Error::InvalidNewNonceHash);
            }
            return Err(Error::DhParamsFail);
        }
        ServerDhParams::Ok(ok) => ok,
    };

    check_nonce(&ok.nonce, &nonce)?;
    check_server_nonce(&ok.server_nonce, &server_nonce)?;

    if ok.encrypted_answer.len() % 16 != 0 {
        return Err(Error::EncryptedResponseNotPadded { len: ok.encrypted_answer.len() });
    }

    let (key, iv) = generate_key_data_from_nonce(&server_nonce, &new_nonce);
    aes::ige_decrypt(&mut ok.encrypted_answer, &key, &iv);
    let plain = ok.encrypted_answer;

    if plain.len() < 20 {
        return Err(Error::InvalidAnswerHash);
    }
    let got_hash: [u8; 20] = plain[..20].try_into().unwrap();
    let mut cursor = Cursor::from_slice(&plain[20..]);
    let inner = ServerDhInnerData::deserialize(&mut cursor)
        .map_err(|error| Error::InvalidDhInnerData { error })?;
    if got_hash != sha1!(&plain[20..20 + cursor.pos()]) {
        return Err(Error::InvalidAnswerHash);
    }

    check_nonce(&inner.nonce, &nonce)?;
    check_server_nonce(&inner.server_nonce, &server_nonce)?;

    let dh_prime = BigUint::from_bytes_be(&inner.dh_prime);
    if !checker.is_good_prime(&dh_prime, inner.g) {
        return Err(Error::BadDhPrime);
    }

    let g = BigUint::from(inner.g as u32);
    let g_a = BigUint::from_bytes_be(&inner.g_a);
    let time_offset = inner.server_time - now;

    let b = BigUint::from_bytes_be(&random[..256]);
    let g_b = g.modpow(&b, &dh_prime);
    let gab = g_a.modpow(&b, &dh_prime);

    // 1 < g, g_a, g_b < p − 1, with a 2^{2048−64} safety margin on the keys.
    let one = BigUint::from(1u32);
    check_in_range(&g, &one, &(&dh_prime - &one))?;
    check_in_range(&g_a, &one, &(&dh_prime - &one))?;
    check_in_range(&g_b, &one, &(&dh_prime - &one))?;
    let safety = one << (2048 - 64);
    check_in_range(&g_a, &safety, &(&dh_prime - &safety))?;
    check_in_range(&g_b, &safety, &(&dh_prime - &safety))?;

    let client_inner = ClientDhInnerData {
        nonce,
        server_nonce,
        retry_id: 0,
        g_b: g_b.to_bytes_be(),
    }
    .to_bytes();

    let digest = sha1!(&client_inner);
    let pad_len = (16 - ((20 + client_inner.len()) % 16)) % 16;

    let mut payload = Vec::with_capacity(20 + client_inner.len() + pad_len);
    payload.extend_from_slice(&digest);
    payload.extend_from_slice(&client_inner);
    payload.extend_from_slice(&random[256..256 + pad_len]);

    aes::ige_encrypt(&mut payload, &key, &iv);

    Ok((
        SetClientDhParams { nonce, server_nonce, encrypted_data: payload },
        Step3 { nonce, server_nonce, new_nonce, gab, time_offset },
    ))
}

// ─── Finish ──────────────────────────────────────────────────────────────────

/// Verify the server's answer and produce the key.
pub fn finish(data: Step3, response: DhGen) -> Result<Finished, Error> {
    let Step3 { nonce, server_nonce, new_nonce, gab, time_offset } = data;

    struct Answer {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        hash: [u8; 16],
        number: u8,
    }

    let answer = match response {
        DhGen::Ok(x) => Answer {
            nonce: x.nonce,
            server_nonce: x.server_nonce,
            hash: x.new_nonce_hash1,
            number: 1,
        },
        DhGen::Retry(x) => Answer {
            nonce: x.nonce,
            server_nonce: x.server_nonce,
            hash: x.new_nonce_hash2,
            number: 2,
        },
        DhGen::Fail(x) => Answer {
            nonce: x.nonce,
            server_nonce: x.server_nonce,
            hash: x.new_nonce_hash3,
            number: 3,
        },
    };

    check_nonce(&answer.nonce, &nonce)?;
    check_server_nonce(&answer.server_nonce, &server_nonce)?;

    let mut key_bytes = [0u8; 256];
    let gab_bytes = gab.to_bytes_be();
    key_bytes[256 - gab_bytes.len()..].copy_from_slice(&gab_bytes);

    let auth_key = AuthKey::from_bytes(key_bytes);
    if answer.hash != auth_key.calc_new_nonce_hash(&new_nonce, answer.number) {
        return Err(Error::InvalidNewNonceHash);
    }

    let first_salt = {
        let mut buf = [0u8; 8];
        for ((dst, a), b) in buf.iter_mut().zip(&new_nonce[..8]).zip(&server_nonce[..8]) {
            *dst = a ^ b;
        }
        i64::from_le_bytes(buf)
    };

    match answer.number {
        1 => Ok(Finished { auth_key: auth_key.to_bytes(), time_offset, first_salt }),
        2 => Err(Error::DhGenRetry),
        _ => Err(Error::DhGenFail),
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn check_nonce(got: &[u8; 16], expected: &[u8; 16]) -> Result<(), Error> {
    if got == expected {
        Ok(())
    } else {
        Err(Error::InvalidNonce { got: *got, expected: *expected })
    }
}

fn check_server_nonce(got: &[u8; 16], expected: &[u8; 16]) -> Result<(), Error> {
    if got == expected {
        Ok(())
    } else {
        Err(Error::InvalidServerNonce { got: *got, expected: *expected })
    }
}

fn check_in_range(value: &BigUint, low: &BigUint, high: &BigUint) -> Result<(), Error> {
    if low < value && value < high {
        Ok(())
    } else {
        Err(Error::GParameterOutOfRange { low: low.clone(), high: high.clone() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dh::CachingPrimeChecker;
    use tgnet_tl::mtproto::{DhGenOk, ResPq, ServerDhParamsOk};

    const DH_PRIME_HEX: &str = "\
C71CAEB9C6B1C9048E6C522F70F13F73980D40238E3E21C14934D037563D930F\
48198A0AA7C14058229493D22530F4DBFA336F6E0AC925139543AED44CCE7C37\
20FD51F69458705AC68CD4FE6B6B13ABDC9746512969328454F18FAF8C595F64\
2477FE96BB2A941D5BCD1D4AC8CC49880708FA9B378E3C4F3A9060BEE67CF9A4\
A4A695811051907E162753B56B0F6B410DBA74D8A84B2A14B3144E0EF1284754\
FD17ED950D5965B4B9DD46582DB1178D169C6BC465B0D6FF9CA3928FEF5B9AE4\
E418FC15E83EBEA0F87FA9FF5EED70050DED2849F47BF959D956850CE929851F\
0D8115F635B105EE2E4E15D04B2454BF6F4FADF034B10403119CD8E3B92FCC5B";

    fn prime() -> BigUint {
        BigUint::parse_bytes(DH_PRIME_HEX.as_bytes(), 16).unwrap()
    }

    #[test]
    fn step2_factorizes_and_picks_a_registered_key() {
        let keys = RsaKeyRegister::default();
        let (_, s1) = do_step1(&[1; 16]);
        let res_pq = ResPq {
            nonce: [1; 16],
            server_nonce: [2; 16],
            pq: 1470626929934143021u64.to_be_bytes().to_vec(),
            server_public_key_fingerprints: vec![99, -3414540481677951611],
        };
        let (req, _) = do_step2(&keys, s1, res_pq, 2, &[7; 256]).unwrap();
        assert_eq!(req.p, 1206429347u64.to_be_bytes()[4..].to_vec());
        assert_eq!(req.q, 1218991343u64.to_be_bytes()[4..].to_vec());
        assert_eq!(req.public_key_fingerprint, -3414540481677951611);
        assert_eq!(req.encrypted_data.len(), 256);
    }

    #[test]
    fn step2_rejects_unknown_fingerprints() {
        let keys = RsaKeyRegister::default();
        let (_, s1) = do_step1(&[1; 16]);
        let res_pq = ResPq {
            nonce: [1; 16],
            server_nonce: [2; 16],
            pq: 1470626929934143021u64.to_be_bytes().to_vec(),
            server_public_key_fingerprints: vec![99],
        };
        assert!(matches!(
            do_step2(&keys, s1, res_pq, 2, &[7; 256]),
            Err(Error::NoMatchingRsaKey { .. })
        ));
    }

    #[test]
    fn step2_rejects_a_foreign_nonce() {
        let keys = RsaKeyRegister::default();
        let (_, s1) = do_step1(&[1; 16]);
        let res_pq = ResPq {
            nonce: [9; 16],
            server_nonce: [2; 16],
            pq: vec![0; 8],
            server_public_key_fingerprints: vec![],
        };
        assert!(matches!(
            do_step2(&keys, s1, res_pq, 2, &[7; 256]),
            Err(Error::InvalidNonce { .. })
        ));
    }

    /// Play both ends of steps 3–4: the test acts as the server (it knows
    /// `new_nonce` because the step randomness is fixed) and checks that both
    /// sides derive the same 256-byte key.
    #[test]
    fn dh_exchange_derives_a_shared_key() {
        let nonce = [1u8; 16];
        let server_nonce = [2u8; 16];
        let mut step2_rnd = [3u8; 256];
        step2_rnd[..32].copy_from_slice(&[4u8; 32]);
        let new_nonce = [4u8; 32];

        let s2 = Step2 { nonce, server_nonce, new_nonce };

        // Server side: choose `a`, publish g_a.
        let p = prime();
        let g = BigUint::from(3u32);
        let a = BigUint::from_bytes_be(&[0x5a; 256]) % &p;
        let g_a = g.modpow(&a, &p);

        let now = 1_700_000_000;
        let inner = ServerDhInnerData {
            nonce,
            server_nonce,
            g: 3,
            dh_prime: p.to_bytes_be(),
            g_a: g_a.to_bytes_be(),
            server_time: now + 25,
        }
        .to_bytes();

        let (key, iv) = generate_key_data_from_nonce(&server_nonce, &new_nonce);
        let mut answer = Vec::new();
        answer.extend_from_slice(&sha1!(&inner));
        answer.extend_from_slice(&inner);
        answer.resize((answer.len() + 15) / 16 * 16, 0);
        aes::ige_encrypt(&mut answer, &key, &iv);

        let response = ServerDhParams::Ok(ServerDhParamsOk {
            nonce,
            server_nonce,
            encrypted_answer: answer,
        });

        let checker = CachingPrimeChecker::new();
        let (req, s3) = do_step3(&checker, s2, response, &[0x77; 272], now).unwrap();
        assert_eq!(s3.time_offset, 25);

        // Server side: decrypt g_b and derive the key.
        let mut client_payload = req.encrypted_data.clone();
        aes::ige_decrypt(&mut client_payload, &key, &iv);
        let mut cursor = Cursor::from_slice(&client_payload[20..]);
        let client_inner = ClientDhInnerData::deserialize(&mut cursor).unwrap();
        assert_eq!(client_inner.retry_id, 0);
        let g_b = BigUint::from_bytes_be(&client_inner.g_b);
        let server_gab = g_b.modpow(&a, &p);

        let mut server_key = [0u8; 256];
        let gab_bytes = server_gab.to_bytes_be();
        server_key[256 - gab_bytes.len()..].copy_from_slice(&gab_bytes);
        let server_auth_key = AuthKey::from_bytes(server_key);

        let done = finish(
            s3,
            DhGen::Ok(DhGenOk {
                nonce,
                server_nonce,
                new_nonce_hash1: server_auth_key.calc_new_nonce_hash(&new_nonce, 1),
            }),
        )
        .unwrap();

        assert_eq!(done.auth_key, server_key);
        assert_eq!(done.time_offset, 25);
        let mut salt = [0u8; 8];
        for ((dst, a), b) in salt.iter_mut().zip(&new_nonce[..8]).zip(&server_nonce[..8]) {
            *dst = a ^ b;
        }
        assert_eq!(done.first_salt, i64::from_le_bytes(salt));
    }

    #[test]
    fn finish_surfaces_retry_and_fail() {
        let make_step3 = || Step3 {
            nonce: [1; 16],
            server_nonce: [2; 16],
            new_nonce: [3; 32],
            gab: BigUint::from(5u32),
            time_offset: 0,
        };
        let key_bytes = {
            let mut k = [0u8; 256];
            k[255] = 5;
            AuthKey::from_bytes(k)
        };
        let retry = DhGen::Retry(tgnet_tl::mtproto::DhGenRetry {
            nonce: [1; 16],
            server_nonce: [2; 16],
            new_nonce_hash2: key_bytes.calc_new_nonce_hash(&[3; 32], 2),
        });
        assert_eq!(finish(make_step3(), retry), Err(Error::DhGenRetry));

        let fail = DhGen::Fail(tgnet_tl::mtproto::DhGenFail {
            nonce: [1; 16],
            server_nonce: [2; 16],
            new_nonce_hash3: key_bytes.calc_new_nonce_hash(&[3; 32], 3),
        });
        assert_eq!(finish(make_step3(), fail), Err(Error::DhGenFail));
    }
}

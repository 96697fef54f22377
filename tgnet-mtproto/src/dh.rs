//! Validation of server-chosen Diffie-Hellman parameters.
//!
//! A malicious or broken server could hand out a smooth or undersized prime;
//! every `server_DH_inner_data` is checked before the client commits to it.

use std::collections::HashSet;
use std::sync::Mutex;

use num_bigint::BigUint;
use tgnet_crypto::sha1;

/// The 2048-bit prime Telegram production servers have used for years.
/// Matching it lets the checker skip the primality tests entirely.
const KNOWN_GOOD_PRIME: &str = "\
C71CAEB9C6B1C9048E6C522F70F13F73980D40238E3E21C14934D037563D930F\
48198A0AA7C14058229493D22530F4DBFA336F6E0AC925139543AED44CCE7C37\
20FD51F69458705AC68CD4FE6B6B13ABDC9746512969328454F18FAF8C595F64\
2477FE96BB2A941D5BCD1D4AC8CC49880708FA9B378E3C4F3A9060BEE67CF9A4\
A4A695811051907E162753B56B0F6B410DBA74D8A84B2A14B3144E0EF1284754\
FD17ED950D5965B4B9DD46582DB1178D169C6BC465B0D6FF9CA3928FEF5B9AE4\
E418FC15E83EBEA0F87FA9FF5EED70050DED2849F47BF959D956850CE929851F\
0D8115F635B105EE2E4E15D04B2454BF6F4FADF034B10403119CD8E3B92FCC5B";

/// Decides whether a server-provided `(dh_prime, g)` pair is safe to use.
pub trait DhPrimeChecker: Send + Sync {
    fn is_good_prime(&self, prime: &BigUint, g: i32) -> bool;
}

/// The default checker: a fast path for the known-good prime, full
/// validation otherwise, and a cache of primes that already passed.
pub struct CachingPrimeChecker {
    known_good: BigUint,
    validated: Mutex<HashSet<[u8; 20]>>,
}

impl CachingPrimeChecker {
    pub fn new() -> Self {
        Self {
            known_good: BigUint::parse_bytes(KNOWN_GOOD_PRIME.as_bytes(), 16)
                .expect("builtin prime"),
            validated: Mutex::new(HashSet::new()),
        }
    }
}

impl Default for CachingPrimeChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl DhPrimeChecker for CachingPrimeChecker {
    fn is_good_prime(&self, prime: &BigUint, g: i32) -> bool {
        if !g_matches_prime(prime, g) {
            return false;
        }
        if *prime == self.known_good {
            return true;
        }
        if prime.bits() != 2048 {
            return false;
        }

        let digest = sha1!(&prime.to_bytes_be());
        if self.validated.lock().unwrap().contains(&digest) {
            return true;
        }

        let one = BigUint::from(1u32);
        let half = (prime - &one) >> 1;
        let ok = miller_rabin(prime, 30) && miller_rabin(&half, 30);
        if ok {
            self.validated.lock().unwrap().insert(digest);
        } else {
            log::warn!("rejected server DH prime (failed primality check)");
        }
        ok
    }
}

/// The residue conditions that make `g` a generator of a large subgroup.
fn g_matches_prime(prime: &BigUint, g: i32) -> bool {
    let rem = |m: u32| (prime % BigUint::from(m)).try_into().unwrap_or(u32::MAX);
    match g {
        2 => rem(8) == 7,
        3 => rem(3) == 2,
        4 => true,
        5 => matches!(rem(5), 1 | 4),
        6 => matches!(rem(24), 19 | 23),
        7 => matches!(rem(7), 3 | 5 | 6),
        _ => false,
    }
}

fn random_below(limit: &BigUint) -> BigUint {
    let mut bytes = vec![0u8; (limit.bits() as usize + 7) / 8 + 8];
    getrandom::getrandom(&mut bytes).expect("getrandom");
    BigUint::from_bytes_be(&bytes) % limit
}

/// Probabilistic primality test; `rounds` random bases.
fn miller_rabin(n: &BigUint, rounds: usize) -> bool {
    let one = BigUint::from(1u32);
    let two = BigUint::from(2u32);
    if *n < two {
        return false;
    }
    if !n.bit(0) {
        return *n == two;
    }
    if *n == two || *n == BigUint::from(3u32) {
        return true;
    }

    let n_minus_1 = n - &one;
    let s = n_minus_1.trailing_zeros().unwrap_or(0);
    let d = &n_minus_1 >> s;

    let span = n - BigUint::from(3u32); // witnesses drawn from [2, n-2]
    for _ in 0..rounds {
        let a = random_below(&span) + &two;
        let mut x = a.modpow(&d, n);
        if x == one || x == n_minus_1 {
            continue;
        }
        let mut witness = true;
        for _ in 1..s {
            x = (&x * &x) % n;
            if x == n_minus_1 {
                witness = false;
                break;
            }
        }
        if witness {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_prime_passes_with_valid_g() {
        let checker = CachingPrimeChecker::new();
        let prime = BigUint::parse_bytes(KNOWN_GOOD_PRIME.as_bytes(), 16).unwrap();
        assert!(checker.is_good_prime(&prime, 3));
    }

    #[test]
    fn unknown_g_is_rejected() {
        let checker = CachingPrimeChecker::new();
        let prime = BigUint::parse_bytes(KNOWN_GOOD_PRIME.as_bytes(), 16).unwrap();
        assert!(!checker.is_good_prime(&prime, 1));
        assert!(!checker.is_good_prime(&prime, 8));
    }

    #[test]
    fn undersized_primes_are_rejected() {
        let checker = CachingPrimeChecker::new();
        // 2^127 - 1 is prime but far too small.
        let small = (BigUint::from(1u32) << 127u32) - BigUint::from(1u32);
        assert!(!checker.is_good_prime(&small, 4));
    }

    #[test]
    fn composites_are_rejected() {
        assert!(!miller_rabin(&BigUint::from(561u32), 30)); // Carmichael number
        assert!(!miller_rabin(&BigUint::from(1000000u32), 30));
        assert!(miller_rabin(&BigUint::from(104729u32), 30));
    }
}

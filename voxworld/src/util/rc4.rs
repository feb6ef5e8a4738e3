//! RC4 stream cipher and the login challenge-response helpers.
//!
//! The password exchange encrypts the salted password with RC4 keyed by
//! `license_key XOR challenge`, padded to the longer of the two.

use rand::rngs::OsRng;
use rand::RngCore;

/// Number of random bytes in a login challenge.
pub const CHALLENGE_LEN: usize = 20;

/// The RC4 cipher state.
pub struct Rc4 {
    s: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {

    /// Initialize the cipher from a key. The key must not be empty and keys
    /// longer than 256 bytes only contribute their first 256 bytes.
    pub fn new(key: &[u8]) -> Self {

        debug_assert!(!key.is_empty());

        let mut s = [0u8; 256];
        for (i, v) in s.iter_mut().enumerate() {
            *v = i as u8;
        }

        let mut j = 0u8;
        for i in 0..256 {
            j = j.wrapping_add(s[i]).wrapping_add(key[i % key.len()]);
            s.swap(i, j as usize);
        }

        Self { s, i: 0, j: 0 }

    }

    /// XOR the keystream over the buffer in place. Encryption and decryption
    /// are the same operation.
    pub fn apply(&mut self, data: &mut [u8]) {
        for b in data {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.s[self.i as usize]);
            self.s.swap(self.i as usize, self.j as usize);
            let k = self.s[(self.s[self.i as usize].wrapping_add(self.s[self.j as usize])) as usize];
            *b ^= k;
        }
    }

}

/// XOR two byte vectors together. Where one is shorter than the other, the
/// longer one's bytes pass through unchanged.
pub fn xor_key(a: &[u8], b: &[u8]) -> Vec<u8> {
    let max = a.len().max(b.len());
    (0..max)
        .map(|i| match (a.get(i), b.get(i)) {
            (Some(&x), Some(&y)) => x ^ y,
            (Some(&x), None) => x,
            (None, Some(&y)) => y,
            (None, None) => unreachable!(),
        })
        .collect()
}

/// Generate a fresh login challenge from the OS CSPRNG.
pub fn new_challenge() -> Vec<u8> {
    let mut challenge = vec![0u8; CHALLENGE_LEN];
    OsRng.fill_bytes(&mut challenge);
    challenge
}

#[cfg(test)]
mod tests {

    use super::*;

    fn keystream_check(key: &[u8], plain: &[u8], expected_hex: &str) {
        let mut data = plain.to_vec();
        Rc4::new(key).apply(&mut data);
        let hex: String = data.iter().map(|b| format!("{b:02X}")).collect();
        assert_eq!(hex, expected_hex);
    }

    #[test]
    fn published_vectors() {
        keystream_check(b"Key", b"Plaintext", "BBF316E8D940AF0AD3");
        keystream_check(b"Wiki", b"pedia", "1021BF0420");
        keystream_check(b"Secret", b"Attack at dawn", "45A01F645FC35B383552544B9BF5");
    }

    #[test]
    fn apply_twice_round_trips() {
        let mut data = b"some password".to_vec();
        Rc4::new(b"k3y").apply(&mut data);
        Rc4::new(b"k3y").apply(&mut data);
        assert_eq!(data, b"some password");
    }

    #[test]
    fn xor_key_pads_with_the_longer_input() {
        assert_eq!(xor_key(&[1, 2, 3], &[1]), vec![0, 2, 3]);
        assert_eq!(xor_key(&[0xF0], &[0x0F, 0xAA]), vec![0xFF, 0xAA]);
    }

    #[test]
    fn challenge_has_the_documented_length() {
        let c1 = new_challenge();
        let c2 = new_challenge();
        assert_eq!(c1.len(), CHALLENGE_LEN);
        assert_ne!(c1, c2);
    }

}

use rand::Rng;

/// the largest prime below 2^64
pub const DEFAULT_P: u64 = 18446744073709551557;
pub const DEFAULT_G: u64 = 5;

fn mod_pow(base: u64, mut exp: u64, modulus: u64) -> u64 {
    let modulus = modulus as u128;
    let mut base = base as u128 % modulus;
    let mut result = 1u128;
    while exp > 0 {
        if exp & 1 == 1 {
            result = result * base % modulus;
        }
        base = base * base % modulus;
        exp >>= 1;
    }
    result as u64
}

/// One side of a Diffie-Hellman key exchange over (P, G)
pub struct KeyPair {
    p: u64,
    private_key: u64,
    public_key: u64,
}

impl KeyPair {
    pub fn generate(p: u64, g: u64) -> KeyPair {
        let private_key = rand::thread_rng().gen_range(2..p.max(4) - 1);
        KeyPair::with_private_key(p, g, private_key)
    }

    fn with_private_key(p: u64, g: u64, private_key: u64) -> KeyPair {
        KeyPair {
            p,
            private_key,
            public_key: mod_pow(g, private_key, p),
        }
    }

    pub fn public_key(&self) -> u64 {
        self.public_key
    }

    pub fn shared_key(&self, peer_public_key: u64) -> u64 {
        mod_pow(peer_public_key, self.private_key, self.p)
    }
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::small(5, 3, 23, 10)]
    #[case::zero_exp(7, 0, 13, 1)]
    #[case::large(DEFAULT_G, DEFAULT_P - 1, DEFAULT_P, 1)]
    fn test_mod_pow(#[case] base: u64, #[case] exp: u64, #[case] modulus: u64, #[case] expected: u64) {
        assert_eq!(mod_pow(base, exp, modulus), expected);
    }

    #[test]
    fn test_textbook_exchange() {
        let alice = KeyPair::with_private_key(23, 5, 6);
        let bob = KeyPair::with_private_key(23, 5, 15);
        assert_eq!(alice.public_key(), 8);
        assert_eq!(bob.public_key(), 19);
        assert_eq!(alice.shared_key(bob.public_key()), 2);
        assert_eq!(bob.shared_key(alice.public_key()), 2);
    }

    #[test]
    fn test_generated_keys_agree() {
        let server = KeyPair::generate(DEFAULT_P, DEFAULT_G);
        let client = KeyPair::generate(DEFAULT_P, DEFAULT_G);
        assert_eq!(server.shared_key(client.public_key()), client.shared_key(server.public_key()));
    }
}

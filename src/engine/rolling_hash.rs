const MOD_ADLER: u32 = 65521;

/// Adler-32 style weak hash over a sliding window.
///
/// Two 16-bit sums packed into a `u32`; sliding by one byte is O(1).
#[derive(Debug, Clone, Copy)]
pub struct RollingHash {
    a: u32,
    b: u32,
    window: u64,
}

impl RollingHash {
    /// Hash an initial window.
    pub fn over(window: &[u8]) -> Self {
        let modulus = MOD_ADLER as u64;
        let (a, b) = window.iter().fold((1u64, 0u64), |(a, b), &byte| {
            let a = (a + byte as u64) % modulus;
            (a, (b + a) % modulus)
        });
        Self {
            a: a as u32,
            b: b as u32,
            window: window.len() as u64,
        }
    }

    /// Drop `outgoing` from the front of the window and append `incoming`.
    pub fn roll(&mut self, outgoing: u8, incoming: u8) {
        let modulus = MOD_ADLER as u64;
        let outgoing = outgoing as u64;
        let incoming = incoming as u64;
        let a = (self.a as u64 + modulus - outgoing + incoming) % modulus;
        let dropped = (outgoing * (self.window % modulus)) % modulus;
        let b = (self.b as u64 + modulus - 1 + a + modulus - dropped) % modulus;
        self.a = a as u32;
        self.b = b as u32;
    }

    pub fn value(&self) -> u32 {
        (self.b << 16) | self.a
    }
}

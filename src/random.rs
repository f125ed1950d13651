//! Filler data for load tests and demos.
use uuid::Uuid;

/// Size of the payloads produced by [`RandomData::payloads`] when no size is requested.
pub const DEFAULT_PAYLOAD_SIZE: usize = 10_000;

/// A xorshift128 pseudo-random generator producing filler payloads.
///
/// Not suitable for anything security related. Each generator owns its state: two generators
/// built from the same seed produce the same bytes.
#[derive(Debug, Clone)]
pub struct RandomData {
    x: u32,
    y: u32,
    z: u32,
    w: u32,
}

impl RandomData {
    pub fn new(seed: u128) -> Self {
        let [x, y, z, w] = [0, 32, 64, 96].map(|shift| (seed >> shift) as u32);
        // xorshift is stuck on zero if the whole state is zero.
        if x | y | z | w == 0 {
            return Self::new(0x9E37_79B9_7F4A_7C15_F39C_C060_5CED_C834);
        }
        Self { x, y, z, w }
    }

    /// Seed the generator from a random v4 UUID.
    pub fn from_entropy() -> Self {
        Self::new(Uuid::new_v4().as_u128())
    }

    pub fn next_u32(&mut self) -> u32 {
        let t = self.x ^ (self.x << 11);
        self.x = self.y;
        self.y = self.z;
        self.z = self.w;
        self.w = self.w ^ (self.w >> 19) ^ (t ^ (t >> 8));
        self.w
    }

    pub fn fill(&mut self, buffer: &mut [u8]) {
        for chunk in buffer.chunks_mut(4) {
            let bytes = self.next_u32().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    /// A payload of `size` random bytes.
    pub fn payload(&mut self, size: usize) -> Vec<u8> {
        let mut payload = vec![0; size];
        self.fill(&mut payload);
        payload
    }

    /// `count` payloads of `size` bytes each ([`DEFAULT_PAYLOAD_SIZE`] if `None`).
    pub fn payloads(&mut self, count: usize, size: Option<usize>) -> Vec<Vec<u8>> {
        let size = size.unwrap_or(DEFAULT_PAYLOAD_SIZE);
        (0..count).map(|_| self.payload(size)).collect()
    }
}

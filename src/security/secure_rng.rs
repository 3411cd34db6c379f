use anyhow::{Context, Result};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use zeroize::{Zeroize, ZeroizeOnDrop};

const SEED_CONTEXT: &str = "wealthwise-security 2024 secure-rng seed";

/// ChaCha20 CSPRNG seeded from the operating system and reseeded after a
/// byte or time budget is spent. Every key, salt and nonce in the crate
/// comes from here.
#[derive(ZeroizeOnDrop)]
pub struct SecureRng {
    #[zeroize(skip)]
    rng: ChaCha20Rng,
    entropy_pool: [u8; 32],
    #[zeroize(skip)]
    bytes_since_reseed: u64,
    #[zeroize(skip)]
    last_reseed: Instant,
}

impl SecureRng {
    const RESEED_BYTES: u64 = 1 << 20;
    const RESEED_SECS: u64 = 3600;

    pub fn new() -> Result<Self> {
        let mut entropy_pool = [0u8; 32];
        Self::collect_entropy(&mut entropy_pool)?;
        let mut seed = Self::mix_seed(&entropy_pool, 0)?;
        let rng = ChaCha20Rng::from_seed(seed);
        seed.zeroize();

        Ok(SecureRng {
            rng,
            entropy_pool,
            bytes_since_reseed: 0,
            last_reseed: Instant::now(),
        })
    }

    pub fn fill_bytes(&mut self, dest: &mut [u8]) -> Result<()> {
        if self.should_reseed() {
            self.reseed()?;
        }
        self.rng.fill_bytes(dest);
        self.bytes_since_reseed += dest.len() as u64;
        Ok(())
    }

    pub fn next_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.fill_bytes(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Pull fresh OS entropy and fold it into the generator state.
    pub fn reseed(&mut self) -> Result<()> {
        let mut fresh = [0u8; 32];
        Self::collect_entropy(&mut fresh)?;
        for (pool, new) in self.entropy_pool.iter_mut().zip(fresh.iter()) {
            *pool ^= new;
        }
        fresh.zeroize();

        let mut seed = Self::mix_seed(&self.entropy_pool, self.bytes_since_reseed)?;
        self.rng = ChaCha20Rng::from_seed(seed);
        seed.zeroize();

        self.bytes_since_reseed = 0;
        self.last_reseed = Instant::now();
        Ok(())
    }

    fn should_reseed(&self) -> bool {
        self.bytes_since_reseed >= Self::RESEED_BYTES
            || self.last_reseed.elapsed().as_secs() >= Self::RESEED_SECS
    }

    fn collect_entropy(buffer: &mut [u8; 32]) -> Result<()> {
        getrandom::getrandom(buffer).context("Failed to get entropy from OS")?;
        Ok(())
    }

    /// OS entropy is the only source of unpredictability; process id, wall
    /// clock and a stack address only diversify forked or cloned processes.
    fn mix_seed(pool: &[u8; 32], counter: u64) -> Result<[u8; 32]> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?;
        let stack_marker = 0u8;

        let mut hasher = blake3::Hasher::new_derive_key(SEED_CONTEXT);
        hasher.update(pool);
        hasher.update(&counter.to_le_bytes());
        hasher.update(&now.as_nanos().to_le_bytes());
        hasher.update(&std::process::id().to_le_bytes());
        hasher.update(&(&stack_marker as *const u8 as usize).to_le_bytes());

        Ok(*hasher.finalize().as_bytes())
    }
}

/// Process-wide generator shared by the crate's key and nonce helpers.
pub struct GlobalSecureRng {
    rng: Arc<Mutex<SecureRng>>,
}

impl GlobalSecureRng {
    pub fn instance() -> Result<&'static GlobalSecureRng> {
        static INSTANCE: std::sync::OnceLock<GlobalSecureRng> = std::sync::OnceLock::new();
        if let Some(instance) = INSTANCE.get() {
            return Ok(instance);
        }
        let rng = SecureRng::new()?;
        Ok(INSTANCE.get_or_init(|| GlobalSecureRng {
            rng: Arc::new(Mutex::new(rng)),
        }))
    }

    pub fn fill_bytes(&self, dest: &mut [u8]) -> Result<()> {
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| anyhow::anyhow!("RNG mutex poisoned"))?;
        rng.fill_bytes(dest)
    }

    pub fn reseed(&self) -> Result<()> {
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| anyhow::anyhow!("RNG mutex poisoned"))?;
        rng.reseed()
    }
}

/// Convenience functions for common random operations
pub mod random {
    use super::*;

    pub fn fill(dest: &mut [u8]) -> Result<()> {
        GlobalSecureRng::instance()?.fill_bytes(dest)
    }

    pub fn bytes(len: usize) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; len];
        fill(&mut buffer)?;
        Ok(buffer)
    }

    pub fn array<const N: usize>() -> Result<[u8; N]> {
        let mut array = [0u8; N];
        fill(&mut array)?;
        Ok(array)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_random_bytes_generation() {
        let mut rng = SecureRng::new().expect("Should create RNG");
        let mut buffer = [0u8; 32];
        rng.fill_bytes(&mut buffer).expect("Should generate bytes");
        assert!(buffer.iter().any(|&b| b != 0));
    }

    #[test]
    fn test_random_uniqueness() {
        let mut rng = SecureRng::new().expect("Should create RNG");
        let values: HashSet<u64> = (0..1000)
            .map(|_| rng.next_u64().expect("Should generate u64"))
            .collect();
        assert_eq!(values.len(), 1000);
    }

    #[test]
    fn test_reseed_changes_stream() {
        let mut rng = SecureRng::new().expect("Should create RNG");
        let before = rng.next_u64().unwrap();
        rng.reseed().expect("Should reseed successfully");
        let after = rng.next_u64().unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_convenience_functions() {
        let bytes = random::bytes(32).expect("Should generate bytes");
        assert_eq!(bytes.len(), 32);

        let a = random::array::<16>().unwrap();
        let b = random::array::<16>().unwrap();
        assert_ne!(a, b);
    }
}

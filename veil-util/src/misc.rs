use rand::{thread_rng, Rng};

/// Utility functions for random generation
pub struct RngUtils;

impl RngUtils {
    /// Generate a random integer within an inclusive range
    pub fn random_int(min: i32, max: i32) -> i32 {
        thread_rng().gen_range(min..=max)
    }

    /// Generate a random u64
    pub fn random_u64() -> u64 {
        thread_rng().gen()
    }
}

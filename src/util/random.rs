use rand::Rng;
use std::ops::Range;


/// Source of randomness for fault injection, abstracted so tests can control the outcome
#[cfg_attr(test, mockall::automock)]
pub trait Random: Send + Sync + 'static {
    fn gen_i32_range(&self, range: Range<i32>) -> i32;
}

pub struct RngRandom {}
impl Random for RngRandom {
    fn gen_i32_range(&self, range: Range<i32>) -> i32 {
        rand::thread_rng().gen_range(range)
    }
}

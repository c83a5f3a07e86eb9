mod harness;

#[allow(unused_imports)]
pub use harness::{read_json, with_harness, TestHarness};

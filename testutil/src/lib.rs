/// Test data generators for the consensus crate
///
/// Plain random helpers for fixtures plus proptest strategies for
/// property tests.

pub mod generators;

pub use generators::*;

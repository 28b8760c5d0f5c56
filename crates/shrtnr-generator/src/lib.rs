//! Candidate short-code generators.
//!
//! Generators are pure: they never look at storage, so a generated code may
//! already be taken. Stores are responsible for detecting the collision and
//! asking for another candidate.

pub mod random;
pub mod seq;

pub use random::RandomGenerator;
pub use seq::SeqGenerator;

use shrtnr_core::ShortCode;

/// Trait for generating candidate short codes.
///
/// Implementations can vary from random alphanumeric generators to
/// deterministic counters used in tests.
pub trait Generator: Send + Sync + 'static {
    /// Produces the next candidate code.
    fn generate(&self) -> ShortCode;
}

impl<G: Generator + ?Sized> Generator for std::sync::Arc<G> {
    fn generate(&self) -> ShortCode {
        (**self).generate()
    }
}

impl<G: Generator + ?Sized> Generator for Box<G> {
    fn generate(&self) -> ShortCode {
        (**self).generate()
    }
}

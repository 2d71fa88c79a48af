//! Cooperative cancellation for in-flight derivations.

mod token;

pub use token::CancellationToken;

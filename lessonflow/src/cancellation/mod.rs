//! Cooperative cancellation of step attempts.
//!
//! A token is checked by the retry executor between attempts and raced
//! against backoff sleeps. An attempt that is already running is never
//! interrupted.

mod token;

pub use token::CancellationToken;

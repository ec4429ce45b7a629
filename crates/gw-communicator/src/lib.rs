//! gw-communicator: SSH communicator for VM guests
//!
//! The [`Communicator`] owns one SSH session per guest and runs every command
//! on its own channel. It waits for the guest to become reachable, verifies
//! the remote shell, replaces insecure bootstrap credentials with a generated
//! keypair exactly once, and copies files in both directions over scp.

mod communicator;
mod connection;
mod executor;
mod keys;
mod readiness;
mod retry;
mod transfer;
pub mod transport;

#[cfg(test)]
mod testing;

pub use communicator::Communicator;
pub use executor::CommandStream;
pub use keys::generated_key_path;
pub use readiness::MessageThrottle;
pub use retry::RetryPolicy;
pub use transport::RusshTransport;

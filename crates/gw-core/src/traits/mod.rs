//! Collaborator trait definitions

mod machine;
mod transport;

pub use machine::{
    GuestCapabilities, Machine, ProgressSink, TracingSink, INSERT_PUBLIC_KEY, REMOVE_PUBLIC_KEY,
};
pub use transport::{ChannelEvent, ExecChannel, Transport, TransportSession};

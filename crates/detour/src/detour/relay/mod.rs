//! Session-multiplexed TCP relay.
//!
//! A local process accepts client connections and carries each one as a
//! session over a single encrypted transport connection to a remote process,
//! which dials the real destination. See `DESIGN.md` for the wire format.

pub mod client;
pub mod codec;
pub mod local;
pub mod outbound;
pub mod pool;
pub mod protocol;
pub mod remote;
pub mod server;
pub mod socket;
pub mod socks5;
pub mod tracker;
pub mod transport;

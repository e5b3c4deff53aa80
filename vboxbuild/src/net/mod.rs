//! Host-side networking: port booking for NAT forwarding rules.

mod lock;
mod port;

pub use lock::PortLock;
pub use port::{PortAllocator, PortReservation};

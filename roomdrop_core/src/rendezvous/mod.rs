//! Rendezvous service
//!
//! Pairs two participants under a shared room identifier and relays the
//! opaque setup messages they need to open a direct channel.

pub mod handler;
pub mod messages;
pub mod registry;
pub mod server;

pub use handler::{MAX_CONNECTIONS, handle_socket};
pub use messages::{ClientMessage, ServerMessage};
pub use registry::{Admission, Departure, MemberHandle, MemberId, ROOM_CAPACITY, RoomRegistry};
pub use server::{RendezvousState, create_router, serve, start_server};

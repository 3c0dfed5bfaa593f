//! Types shared by the order coordinator and the inventory custodian: bus
//! wire types, the bus abstraction itself, and the generated gRPC surface.

pub mod bus;
pub mod events;

pub mod proto {
    tonic::include_proto!("inventory.v1");
}

pub use bus::{decode_envelope, topic_for, EventBus, Subscription};
pub use events::{Envelope, Event, VerifyOrder};

pub mod frame;
pub mod message;

pub use frame::{ClientFrame, ServerFrame};
pub use message::{
    DeliveryOutcome, DeviceDelivery, Envelope, MembershipChange, Message, OfflineMessage,
    Payload, RoutePath, RouteResult, Target,
};

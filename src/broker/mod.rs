pub mod channel;
pub mod engine;
pub mod message;
pub mod queue;
pub mod subscription;

pub use channel::{Channel, ChannelRegistry};
pub use engine::{Broker, ChannelInfo};
pub use message::{
    Message, MsgDelivery, StartPosition, SubscriptionInfo, SubscriptionRequest,
};
pub use subscription::{SubStatus, SubscriptionSnapshot};

#[cfg(test)]
mod tests;

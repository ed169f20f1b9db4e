pub mod ack;
pub mod pull;

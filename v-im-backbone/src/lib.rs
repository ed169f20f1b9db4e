//! 消息路由骨干：序列号、在线注册、消息总线、网关、路由与离线投递
//! Message routing backbone: sequencing, presence registry, message bus,
//! gateways, routing and offline delivery

pub mod api;
pub mod bus;
pub mod cluster;
pub mod config;
pub mod dedup;
pub mod domain;
pub mod error;
pub mod gateway;
pub mod registry;
pub mod router;
pub mod sequence;
pub mod server;
pub mod service;
pub mod storage;
pub mod tasks;
pub mod worker;
pub mod ws;

pub use config::BackboneConfig;
pub use error::{ImError, ImResult};
pub use server::Backbone;

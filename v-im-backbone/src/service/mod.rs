// 外部协作服务：鉴权、内容过滤、群成员 / Collaborating services: auth, content filter, membership
pub mod auth;
pub mod filter;
pub mod membership;

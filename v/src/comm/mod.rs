// 通用基础设施 / Common infrastructure
pub mod config;
pub mod tracing;

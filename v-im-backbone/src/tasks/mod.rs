// 后台任务 / Background tasks
pub mod heartbeat;
pub mod purge;

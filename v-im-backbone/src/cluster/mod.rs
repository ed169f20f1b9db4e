// 集群：节点目录与一致性哈希放置 / Cluster: node directory and rendezvous placement
pub mod directory;
pub mod placement;

pub use directory::{Directory, NodeInfo};

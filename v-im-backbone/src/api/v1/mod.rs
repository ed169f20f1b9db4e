pub mod group;
pub mod health;
pub mod internal;
pub mod offline;

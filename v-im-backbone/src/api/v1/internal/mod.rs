pub mod deliver;
pub mod lookup;
pub mod route;

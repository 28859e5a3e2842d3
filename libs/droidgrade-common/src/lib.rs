pub mod bus;
pub mod locks;
pub mod types;

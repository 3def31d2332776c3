pub mod attendance;
pub mod auth;
pub mod backup;
pub mod cell_groups;
pub mod core;
pub mod events;
pub mod exchange;
pub mod members;
pub mod reports;

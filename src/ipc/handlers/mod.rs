pub mod attendance;
pub mod core;
pub mod live_classes;
pub mod notifications;
pub mod roster;

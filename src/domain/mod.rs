pub mod actor;
pub mod change;
pub mod notification;
pub mod raw_event;

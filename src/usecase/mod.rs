pub mod actors;
pub mod contracts;
pub mod error;
pub mod feed;
pub mod jwt;
pub mod live;
pub mod merge;
pub mod read_state;
pub mod session;
pub mod sources;
pub mod synthesize;

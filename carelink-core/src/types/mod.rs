pub mod call;
pub mod envelope;
pub mod events;
pub mod media;
pub mod presence;
pub mod user;

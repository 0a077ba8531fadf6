pub mod channel;
pub mod message;
pub mod request;
pub mod session;

pub mod connection;
pub mod handlers;
pub mod options;
pub mod payload;
pub mod registry;
pub mod retransmission;
pub mod transmit_buffer;
pub mod xgress;

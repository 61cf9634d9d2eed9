pub mod contact;
pub mod conversation;
pub mod exchange;
pub mod execution;
pub mod message;
pub mod worker;

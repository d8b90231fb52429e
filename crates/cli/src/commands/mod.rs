pub mod enqueue;
pub mod notify;
pub mod worker;

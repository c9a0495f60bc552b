pub mod coordinator;
pub mod mongo_service;
pub mod mongodump;
pub mod retention;
pub mod scheduler;

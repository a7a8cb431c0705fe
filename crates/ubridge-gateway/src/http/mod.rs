pub mod capture;
pub mod chat;
pub mod devices;
pub mod health;
pub mod providers;
pub mod secrets;
pub mod sessions;
pub mod stats;
pub mod stream;

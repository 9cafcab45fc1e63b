pub mod audio;
pub mod auth;
pub mod ws;

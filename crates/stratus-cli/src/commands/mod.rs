pub mod client;
pub mod cluster;
pub mod deploy;
pub mod scale;
pub mod watch;

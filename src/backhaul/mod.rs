pub mod app;
pub mod config;
pub mod echo;
pub mod logging;
pub mod net;
pub mod tunnel;

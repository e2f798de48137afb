pub mod logging;
pub mod notifier;
pub mod standx;

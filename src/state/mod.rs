pub mod app_settings;
pub mod messages;
pub mod refresher;
pub mod worker;

// src/config/mod.rs
pub mod settings;

pub use settings::{
    BrowserlessSettings, ExtractionSettings, FetchSettings, NotifySettings, Settings,
};

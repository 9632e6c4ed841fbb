pub mod loader;
pub mod models;
pub mod validation;

pub use loader::{load_settings, load_settings_unchecked};
pub use models::*;
pub use validation::SettingsValidator;

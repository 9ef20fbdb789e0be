pub mod cert_manager;
pub mod errors;
pub mod proxy_manager;
pub mod site_config;
pub mod state;
pub mod system;
pub mod validation;

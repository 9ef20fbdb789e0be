mod proxy;

pub use proxy::{create_proxy, delete_proxy};

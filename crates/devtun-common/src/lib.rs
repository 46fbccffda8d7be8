mod error;
mod tls;

pub use error::TunnelError;
pub use tls::{load_client_config, load_client_config_from_pem, load_webpki_client_config};

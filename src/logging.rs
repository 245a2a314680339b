//! Tracing subscriber installation, shared by the server binary and tests.

use std::sync::OnceLock;

use tracing_subscriber::{fmt, EnvFilter};

pub fn install() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = fmt().with_env_filter(filter).try_init();
    });
}

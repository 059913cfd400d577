//! Process-global pieces of the velofit backend: the orchestrator that
//! supervises camera workers, the security task, the HTTP endpoint and the
//! logging bootstrap.

use anyhow::Result;

pub mod endpoint;
pub mod logging;
pub mod orchestrator;
pub mod security;

/// Early-startup helper: load `.env` and install a default log filter so a
/// bare `velofit` invocation is informative without configuration.
pub fn velofit_start() -> Result<()> {
    dotenv::dotenv().ok();

    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var(
            "RUST_LOG",
            "velofit=info,velofit_worker=info,velofit_engine=info,velofit_bus=info,frame_ring=info,warn",
        );
    }
    Ok(())
}

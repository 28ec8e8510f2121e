//! SIGINT handling.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tracing::info;

/// Install a SIGINT handler. The returned flag stays set until the signal arrives.
pub fn install_interrupt_handler() -> Result<Arc<AtomicBool>> {
    let running = Arc::new(AtomicBool::new(true));
    ctrlc::set_handler(interrupt_callback(running.clone())).context("Failed to install SIGINT handler")?;
    Ok(running)
}

fn interrupt_callback(running: Arc<AtomicBool>) -> impl Fn() + Send + 'static {
    move || {
        info!("Finishing session");
        running.store(false, Ordering::SeqCst);
    }
}

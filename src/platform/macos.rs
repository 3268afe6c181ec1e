use anyhow::Result;
use tracing::warn;

/// macOS offers no sanctioned way to block system shortcuts from a normal
/// process; sessions run with reduced protection there.
pub fn engage() -> Result<()> {
    warn!("input blocking is not available on macOS, session runs unprotected");
    Ok(())
}

pub fn disengage() -> Result<()> {
    Ok(())
}

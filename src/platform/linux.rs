use anyhow::{Context, Result, bail};
use std::process::Command;

/// Input blocking on Linux uses setxkbmap to strip the server-side
/// shortcuts (VT switching, server zap) for the current X display. Wayland
/// compositors are expected to run the terminal shell full-screen already.
pub fn supported() -> bool {
    std::env::var_os("DISPLAY").is_some()
}

pub fn engage() -> Result<()> {
    set_xkb_option("srvrkeys:none")
}

pub fn disengage() -> Result<()> {
    set_xkb_option("")
}

fn set_xkb_option(option: &str) -> Result<()> {
    let output = Command::new("setxkbmap")
        .arg("-option")
        .arg(option)
        .output()
        .context("failed to run setxkbmap")?;

    if !output.status.success() {
        bail!(
            "setxkbmap failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Platform-specific kiosk input blocking.
///
/// Engaged for the duration of a session when kiosk mode is enabled:
/// disables task-switch and system-key shortcuts so the customer stays
/// inside the terminal shell. Always disengaged at session end.

#[cfg(target_os = "windows")]
pub mod windows;

#[cfg(target_os = "macos")]
pub mod macos;

#[cfg(target_os = "linux")]
pub mod linux;

use anyhow::Result;

/// Whether this platform can block input at all.
pub fn blocking_supported() -> bool {
    #[cfg(target_os = "windows")]
    {
        true
    }

    #[cfg(target_os = "macos")]
    {
        false
    }

    #[cfg(target_os = "linux")]
    {
        linux::supported()
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        false
    }
}

pub fn engage_input_block() -> Result<()> {
    #[cfg(target_os = "windows")]
    {
        windows::engage()
    }

    #[cfg(target_os = "macos")]
    {
        macos::engage()
    }

    #[cfg(target_os = "linux")]
    {
        linux::engage()
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        anyhow::bail!("input blocking is not supported on this operating system")
    }
}

pub fn disengage_input_block() -> Result<()> {
    #[cfg(target_os = "windows")]
    {
        windows::disengage()
    }

    #[cfg(target_os = "macos")]
    {
        macos::disengage()
    }

    #[cfg(target_os = "linux")]
    {
        linux::disengage()
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        Ok(())
    }
}

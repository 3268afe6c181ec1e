use anyhow::{Result, bail};
use windows_sys::Win32::UI::Input::KeyboardAndMouse::BlockInput;

/// Windows blocks keyboard and mouse input process-wide via BlockInput.
/// Requires the process to run elevated; the admin emergency unlock path is
/// the escape hatch.
pub fn engage() -> Result<()> {
    let ok = unsafe { BlockInput(1) };
    if ok == 0 {
        bail!("BlockInput(TRUE) failed, process may lack the required privileges");
    }
    Ok(())
}

pub fn disengage() -> Result<()> {
    let ok = unsafe { BlockInput(0) };
    if ok == 0 {
        bail!("BlockInput(FALSE) failed");
    }
    Ok(())
}

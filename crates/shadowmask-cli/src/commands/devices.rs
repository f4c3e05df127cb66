use anyhow::Result;

use shadowmask_core::{DeviceClass, DeviceRegistry, WgpuPlatforms};

pub fn cmd_devices(class: DeviceClass) -> Result<()> {
    let registry = DeviceRegistry::enumerate(WgpuPlatforms::new(), class)?;

    if registry.platform_count() == 0 {
        println!("No compute platforms found");
        return Ok(());
    }

    for platform in registry.listing() {
        print!("{}", platform);
    }
    Ok(())
}

//! USBTMC device enumeration: every attached device whose interface table
//! carries class 0xFE / subclass 0x03 becomes a `USB0::...::INSTR`
//! resource string.

use std::time::Duration;

use rusb::{Context, Device, DeviceDescriptor, UsbContext};
use tracing::debug;

use crate::transport::usbtmc::find_tmc_interface;

fn read_serial(device: &Device<Context>, descriptor: &DeviceDescriptor) -> Option<String> {
    let handle = device.open().ok()?;
    let languages = handle.read_languages(Duration::from_millis(100)).ok()?;
    let language = languages.first()?;
    handle
        .read_serial_number_string(*language, descriptor, Duration::from_millis(100))
        .ok()
}

/// Append a resource string for every attached USBTMC device. The serial
/// field is left empty when the device cannot be opened for string
/// descriptors (e.g. missing permissions).
pub(crate) fn discover(results: &mut Vec<String>) {
    let Ok(context) = Context::new() else {
        return;
    };
    let Ok(devices) = context.devices() else {
        return;
    };

    for device in devices.iter() {
        let Ok(descriptor) = device.device_descriptor() else {
            continue;
        };
        let Some(interface) = find_tmc_interface(&device, None) else {
            continue;
        };
        let serial = read_serial(&device, &descriptor).unwrap_or_default();

        let resource = format!(
            "USB0::0x{:04X}::0x{:04X}::{}::{}::INSTR",
            descriptor.vendor_id(),
            descriptor.product_id(),
            serial,
            interface.number,
        );
        debug!(%resource, "found USBTMC device");
        results.push(resource);
    }
}

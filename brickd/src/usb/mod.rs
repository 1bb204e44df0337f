//! USB subsystem: hotplug tracking for Bricks and the per-device transfer
//! pumps.

pub mod brick;

use anyhow::Context;
use futures_util::StreamExt;
use log::{debug, info, warn};
use nusb::hotplug::HotplugEvent;
use nusb::{DeviceId, DeviceInfo};

use crate::daemon::Daemon;
use crate::hardware::StackId;
use crate::reactor::{Callback, Notifier, Ops, SourceId, SourceKind, SourceQueue};
use crate::stack::Stack;

pub const VENDOR_ID: u16 = 0x16d0;
pub const PRODUCT_ID_BRICK: u16 = 0x063d;
pub const PRODUCT_ID_RED_BRICK: u16 = 0x09e5;

/// One attached Brick the daemon currently drives.
pub struct UsbDeviceEntry {
    pub device_id: DeviceId,
    pub stack_id: StackId,
    pub source: SourceId,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Drop for UsbDeviceEntry {
    fn drop(&mut self) {
        // aborting the pumps drops their transfer queues, which cancels
        // everything still in flight
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

pub fn is_brick(info: &DeviceInfo) -> bool {
    info.vendor_id() == VENDOR_ID
        && (info.product_id() == PRODUCT_ID_BRICK || info.product_id() == PRODUCT_ID_RED_BRICK)
}

/// Register the hotplug sources, enqueue the devices that are already
/// attached and start watching for changes.
pub fn setup(daemon: &mut Daemon, ops: &mut Ops<Daemon>) -> anyhow::Result<()> {
    let added: SourceQueue<DeviceInfo> = SourceQueue::new();
    let removed: SourceQueue<DeviceId> = SourceQueue::new();

    let added_source = ops.add_source(
        "usb-added",
        SourceKind::UsbAdded,
        added_callback(added.clone()),
    );
    let removed_source = ops.add_source(
        "usb-removed",
        SourceKind::UsbRemoved,
        removed_callback(removed.clone()),
    );

    let added_notifier = daemon.handle.notifier(added_source);
    let removed_notifier = daemon.handle.notifier(removed_source);

    let watch = nusb::watch_devices().context("could not watch USB devices")?;

    // the watch only reports changes; pick up what is already plugged in
    for info in nusb::list_devices().context("could not list USB devices")? {
        if is_brick(&info) {
            added.push(info);
            added_notifier.notify();
        }
    }

    tokio::spawn(watch_task(
        watch,
        added,
        added_notifier,
        removed,
        removed_notifier,
    ));

    Ok(())
}

async fn watch_task(
    mut watch: nusb::hotplug::HotplugWatch,
    added: SourceQueue<DeviceInfo>,
    added_notifier: Notifier,
    removed: SourceQueue<DeviceId>,
    removed_notifier: Notifier,
) {
    while let Some(event) = watch.next().await {
        match event {
            HotplugEvent::Connected(info) => {
                if is_brick(&info) {
                    debug!(
                        "USB device arrived (bus: {}, device: {})",
                        info.bus_number(),
                        info.device_address()
                    );
                    added.push(info);

                    if !added_notifier.notify() {
                        return;
                    }
                }
            }
            HotplugEvent::Disconnected(device_id) => {
                removed.push(device_id);

                if !removed_notifier.notify() {
                    return;
                }
            }
        }
    }

    warn!("USB hotplug watch ended");
}

fn added_callback(added: SourceQueue<DeviceInfo>) -> Callback<Daemon> {
    Box::new(move |daemon, ops| {
        if let Some(info) = added.pop() {
            brick::create(daemon, ops, info);
        }

        Ok(())
    })
}

fn removed_callback(removed: SourceQueue<DeviceId>) -> Callback<Daemon> {
    Box::new(move |daemon, ops| {
        let Some(device_id) = removed.pop() else {
            return Ok(());
        };

        let Some(index) = daemon
            .usb_devices
            .iter()
            .position(|entry| entry.device_id == device_id)
        else {
            // not a Brick (or never successfully opened)
            return Ok(());
        };

        let entry = daemon.usb_devices.remove(index);

        if let Some(stack) = daemon.registry.get_mut(entry.stack_id) {
            info!("USB device of {} was removed", stack.name());
        }

        ops.remove_source(entry.source);
        daemon.registry.mark_for_removal(entry.stack_id);

        Ok(())
    })
}

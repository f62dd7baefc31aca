//! HID transport: polls for devices matching the bus's vendor id and
//! bridges each one to the dispatcher through the same admission/traffic
//! channels the websocket transport uses. `Def`/`Undef` packets are never
//! written to a device; the link's bandwidth is reserved for events and
//! actions, and a definition catalog on a microcontroller is of no use to
//! it anyway.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hidapi::{HidApi, HidDevice};
use tracing::{info, warn};

use busline_codec::{frame_packet, HidDecoder};
use busline_core::dispatcher::{forward_peer_traffic, DispatcherHandles};
use busline_core::error::BuslineError;
use busline_core::packet::Packet;
use busline_core::peer::{new_peer, DEFAULT_QUEUE_CAPACITY};

const VENDOR_ID: u16 = 0x0042;
const POLL_INTERVAL: Duration = Duration::from_secs(1);
const READ_CHUNK: usize = 64;

/// Enumerates devices matching `VENDOR_ID` forever, bridging each newly
/// seen one. Runs until the task is aborted by the caller.
pub async fn run(handles: DispatcherHandles) {
    info!(vendor_id = format!("0x{:04x}", VENDOR_ID), "HID transport listening");
    let open_serials: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

    loop {
        match HidApi::new() {
            Ok(api) => {
                for info in api.device_list().filter(|d| d.vendor_id() == VENDOR_ID) {
                    let serial = info.serial_number().unwrap_or("").to_owned();
                    if open_serials.lock().unwrap().contains(&serial) {
                        continue;
                    }
                    match info.open_device(&api) {
                        Ok(device) => {
                            open_serials.lock().unwrap().insert(serial.clone());
                            let handles = handles.clone();
                            let open_serials = Arc::clone(&open_serials);
                            tokio::task::spawn_blocking(move || {
                                bridge_device(device, handles);
                                open_serials.lock().unwrap().remove(&serial);
                            });
                        }
                        Err(err) => {
                            warn!(%err, serial, "failed to open HID device");
                        }
                    }
                }
            }
            Err(err) => {
                warn!(%err, "HID enumeration failed");
            }
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Runs on a blocking thread for the lifetime of one device connection:
/// reads frames into packets for the dispatcher, and writes packets handed
/// back by the dispatcher out to the device.
fn bridge_device(device: HidDevice, handles: DispatcherHandles) {
    let (created, peer_handle) = new_peer(DEFAULT_QUEUE_CAPACITY);
    let (admission, out_rx) = created.into_parts();
    let peer_id = admission.id;

    let rt = match tokio::runtime::Handle::try_current() {
        Ok(handle) => handle,
        Err(_) => return,
    };
    rt.spawn(forward_peer_traffic(peer_id, out_rx, handles.traffic_tx.clone()));
    if let Err(err) = rt.block_on(handles.admission_tx.send_async(admission)) {
        let err = BuslineError::admission_failed(err.to_string());
        warn!(peer = %peer_id, %err, "dropping HID connection");
        return;
    }

    let out_tx = peer_handle.out_tx;
    let in_rx = peer_handle.in_rx;
    let mut decoder = HidDecoder::new();
    let mut read_buf = [0u8; READ_CHUNK];

    loop {
        // Drain anything queued for this peer without blocking the read.
        while let Ok(packet) = in_rx.try_recv() {
            if matches!(packet, Packet::Def(_) | Packet::Undef(_)) {
                continue;
            }
            match frame_packet(&packet) {
                Ok(reports) => {
                    for report in reports {
                        if let Err(err) = device.write(&report) {
                            warn!(peer = %peer_id, %err, "HID write failed");
                            return;
                        }
                    }
                }
                Err(err) => warn!(peer = %peer_id, %err, "failed to frame packet for HID"),
            }
        }

        match device.read_timeout(&mut read_buf, 100) {
            // `read_timeout` returns `Ok(0)` when the 100ms window simply
            // elapsed with nothing to read, not when the device closed;
            // a real disconnect surfaces as `Err` below.
            Ok(0) => continue,
            Ok(n) => {
                decoder.feed(&read_buf[..n]);
                loop {
                    match decoder.decode_next() {
                        Ok(Some(packet)) => {
                            if out_tx.send(packet).is_err() {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            warn!(peer = %peer_id, %err, "HID frame decode error, resyncing");
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                warn!(peer = %peer_id, %err, "HID read failed");
                return;
            }
        }
    }
}

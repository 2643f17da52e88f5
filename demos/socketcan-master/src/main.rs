use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use multican::common::constants::cob;
use multican::common::sdo::SdoRequest;
use multican::common::{CanMessage, NodeId};
use multican::{
    register_standard_messages, BusOptions, CanBus, CanBusManager, CanOpenDevice, CanOpenOptions,
    CanOpenState, DeviceRegistry, RegisterError, SocketCanDriver,
};

#[derive(Parser, Debug)]
struct Args {
    /// SocketCAN interface to open, e.g. "can0" or "vcan0"
    socket: String,
    /// Node id of the remote device
    #[clap(long, short, default_value = "1")]
    node_id: u8,
    /// Receive frames sent on this same socket
    #[clap(long)]
    loopback: bool,
}

/// A remote drive: reports a measurement on TxPDO1, takes a command on
/// RxPDO1 and is configured through SDO writes.
struct DriveDevice {
    canopen: CanOpenState,
    measurement: AtomicI32,
}

impl DriveDevice {
    fn new(options: CanOpenOptions) -> Arc<Self> {
        Arc::new(Self {
            canopen: CanOpenState::new(options),
            measurement: AtomicI32::new(0),
        })
    }

    fn node(&self) -> NodeId {
        self.canopen.device().node_id()
    }

    fn configure(&self) {
        self.canopen.set_nmt_enter_pre_operational();
        // Ask the device to produce a heartbeat every 100 ms
        self.canopen
            .send_sdo(SdoRequest::download_u16(self.node(), 0x1017, 0, 100));
        self.canopen.set_nmt_start_remote_device();
    }

    fn set_command(&self, value: i32) {
        let mut msg = CanMessage::new(cob::RXPDO1 + self.node().raw() as u32);
        msg.write_i32(value, 0);
        self.canopen.device().send(msg);
    }

    fn measurement(&self) -> i32 {
        self.measurement.load(Ordering::Relaxed)
    }

    fn parse_pdo1(&self, msg: &CanMessage) -> bool {
        if msg.length() < 4 {
            return false;
        }
        self.measurement.store(msg.read_i32(0), Ordering::Relaxed);
        true
    }
}

impl CanOpenDevice for DriveDevice {
    fn canopen(&self) -> &CanOpenState {
        &self.canopen
    }

    fn init_device(self: Arc<Self>, reg: &mut DeviceRegistry<'_>) -> Result<(), RegisterError> {
        register_standard_messages(&self, reg)?;
        let dev = self.clone();
        reg.add_device_message(cob::TXPDO1 + self.node().raw() as u32, move |msg| {
            dev.parse_pdo1(msg)
        })?;
        self.canopen.set_nmt_restart_remote_device();
        Ok(())
    }

    fn handle_read_sdo_answer(&self, index: u16, sub: u8, data: &[u8; 4]) {
        log::info!("SDO read answer for 0x{index:04X}.{sub}: {data:?}");
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let node_id = NodeId::new(args.node_id).unwrap();
    let mut options = BusOptions::named(&args.socket);
    options.loopback = args.loopback;

    let driver = SocketCanDriver::new(&args.socket).with_loopback(options.loopback);
    let mut bus = CanBus::new(options, Box::new(driver));

    let mut device_options = CanOpenOptions::new(node_id, "drive");
    device_options.producer_heartbeat_time_ms = 100;
    device_options.set_sdo_timeout(Duration::from_millis(500), Duration::from_millis(100));
    let device = DriveDevice::new(device_options);
    bus.add_device(device.clone()).unwrap();

    let mut manager = CanBusManager::new();
    manager.add_bus(bus).unwrap();

    device.configure();

    let mut command = 0;
    loop {
        manager.send_sync_on_all_buses();
        device.set_command(command);
        command = (command + 1) % 1000;

        log::info!(
            "nmt state: {}, measurement: {}, healthy: {}",
            device.canopen.nmt_state(),
            device.measurement(),
            manager.all_devices_active(),
        );
        std::thread::sleep(Duration::from_secs(1));
    }
}

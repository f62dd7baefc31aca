use clap::Parser;

/// Default websocket port, matching the bus's original fixed port.
pub const DEFAULT_PORT: u16 = 4224;

#[derive(Parser, Debug)]
#[command(name = "busline", about = "Process-local message bus for peer clients")]
pub struct Cli {
    /// TCP port the websocket transport listens on.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Disable the HID transport (ignored when built without the `hid` feature).
    #[arg(long)]
    pub no_hid: bool,
}

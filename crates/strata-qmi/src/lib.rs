//! # strata-qmi
//!
//! QMI control port management for Strata cellular links.
//!
//! Opens a modem's QMI control device and brings the kernel driver's frame
//! format (raw-IP or 802.3) and the firmware's link-layer protocol (WDA)
//! into agreement, falling back to CTL-configured framing on firmware
//! without WDA support.
//!
//! ## Crate structure
//!
//! - [`port`] — Port lifecycle: open/close, client registry, cached formats
//! - [`data_format`] — Combination selection and the negotiation state machine
//! - [`kernel`] — Kernel frame format capabilities and sync
//! - [`wda`] — Firmware link-layer protocol negotiation
//! - [`device`] — Device/factory traits, open flags, WDA messages
//! - [`config`] — Per-request timeouts, TOML loading
//! - [`types`] — Formats, services, transport metadata, endpoint identity
//! - [`error`] — Error taxonomy
//! - [`test_util`] — Scripted in-memory device for tests

pub mod config;
pub mod data_format;
pub mod device;
pub mod error;
pub mod kernel;
pub mod port;
pub mod types;
pub mod wda;

pub mod test_util;

pub use config::{PortConfig, PortTimeouts};
pub use device::{DeviceFactory, OpenFlags, QmiClient, QmiDevice};
pub use error::{Error, ProtocolError, Result};
pub use port::QmiPort;
pub use types::{
    DataFormat, DataFormatCombination, EndpointInfo, EndpointType, KernelDevice,
    LinkLayerProtocol, PortFlag, PortSubsys, Service, SetupAction,
};

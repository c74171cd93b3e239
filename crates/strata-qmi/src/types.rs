//! Core value types: frame formats, link-layer protocols, services and
//! endpoint identity.

use std::fmt;

// ─── Frame formats ──────────────────────────────────────────────────────────

/// Frame format the kernel network driver expects on the data interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataFormat {
    /// Ethernet-like 802.3 framing.
    Ieee8023,
    /// Bare IP packets, no link-layer header.
    RawIp,
}

impl DataFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataFormat::Ieee8023 => "802-3",
            DataFormat::RawIp => "raw-ip",
        }
    }

    /// The firmware protocol that must be paired with this kernel format.
    pub fn link_layer_protocol(self) -> LinkLayerProtocol {
        match self {
            DataFormat::Ieee8023 => LinkLayerProtocol::Ieee8023,
            DataFormat::RawIp => LinkLayerProtocol::RawIp,
        }
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Link-layer protocol configured in the baseband firmware (WDA service).
///
/// Discriminants are the on-the-wire TLV values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum LinkLayerProtocol {
    Ieee8023 = 0x01,
    RawIp = 0x02,
}

impl LinkLayerProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkLayerProtocol::Ieee8023 => "802-3",
            LinkLayerProtocol::RawIp => "raw-ip",
        }
    }
}

impl fmt::Display for LinkLayerProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Combinations ───────────────────────────────────────────────────────────

/// A (kernel format, firmware protocol) pair that must be configured together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataFormatCombination {
    pub kernel: DataFormat,
    pub llp: LinkLayerProtocol,
}

impl DataFormatCombination {
    pub const fn new(kernel: DataFormat, llp: LinkLayerProtocol) -> Self {
        Self { kernel, llp }
    }

    /// The pair implied by a kernel format alone, used when the firmware
    /// cannot be queried.
    pub fn from_kernel(kernel: DataFormat) -> Self {
        Self::new(kernel, kernel.link_layer_protocol())
    }
}

impl fmt::Display for DataFormatCombination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kernel {} / link-layer {}", self.kernel, self.llp)
    }
}

/// Candidate combinations, in order of preference.
pub const DATA_FORMAT_COMBINATIONS: [DataFormatCombination; 2] = [
    DataFormatCombination::new(DataFormat::RawIp, LinkLayerProtocol::RawIp),
    DataFormatCombination::new(DataFormat::Ieee8023, LinkLayerProtocol::Ieee8023),
];

/// Whether a data-format run only reports or also writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupAction {
    /// Report the current formats without writing anything.
    Query,
    /// Write as needed until a supported combination is confirmed.
    Apply,
}

// ─── Services ───────────────────────────────────────────────────────────────

/// QMI service a client can be allocated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    Ctl,
    Wds,
    Dms,
    Nas,
    Wms,
    Pds,
    Uim,
    Pbm,
    Loc,
    Voice,
    Pdc,
    Wda,
    Dsd,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Ctl => "ctl",
            Service::Wds => "wds",
            Service::Dms => "dms",
            Service::Nas => "nas",
            Service::Wms => "wms",
            Service::Pds => "pds",
            Service::Uim => "uim",
            Service::Pbm => "pbm",
            Service::Loc => "loc",
            Service::Voice => "voice",
            Service::Pdc => "pdc",
            Service::Wda => "wda",
            Service::Dsd => "dsd",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Usage flag distinguishing several clients of the same service on one port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PortFlag {
    #[default]
    Default,
    WdsIpv4,
    WdsIpv6,
}

// ─── Transport metadata & endpoint identity ─────────────────────────────────

/// Kernel subsystem the control port was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortSubsys {
    /// USB `cdc-wdm` node driven by `qmi_wwan`: the only family whose frame
    /// format can be switched.
    Usbmisc,
    /// Embedded SoC modem over remote-processor messaging.
    Rpmsg,
    /// WWAN subsystem control port (PCIe modems).
    Wwan,
    Net,
    Tty,
    Unknown,
}

impl PortSubsys {
    /// Whether the kernel driver behind this subsystem supports switching
    /// between raw-IP and 802.3 framing.
    pub fn has_switchable_format(&self) -> bool {
        matches!(self, PortSubsys::Usbmisc)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PortSubsys::Usbmisc => "usbmisc",
            PortSubsys::Rpmsg => "rpmsg",
            PortSubsys::Wwan => "wwan",
            PortSubsys::Net => "net",
            PortSubsys::Tty => "tty",
            PortSubsys::Unknown => "unknown",
        }
    }
}

impl fmt::Display for PortSubsys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kernel device metadata the port is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelDevice {
    /// Sysfs name of the device (e.g. `cdc-wdm0`).
    pub name: String,
    /// USB interface number reported by the kernel.
    pub interface_number: u32,
}

/// Physical data endpoint type as encoded in the WDA endpoint-info TLV.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum EndpointType {
    Unknown = 0x00,
    Hsic = 0x01,
    Hsusb = 0x02,
    Pcie = 0x03,
    Embedded = 0x04,
    BamDmux = 0x05,
    Undefined = 0xFF,
}

impl EndpointType {
    pub fn for_subsys(subsys: PortSubsys) -> Self {
        match subsys {
            PortSubsys::Usbmisc => EndpointType::Hsusb,
            PortSubsys::Rpmsg => EndpointType::Embedded,
            PortSubsys::Wwan => EndpointType::Pcie,
            _ => EndpointType::Undefined,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointType::Unknown => "unknown",
            EndpointType::Hsic => "hsic",
            EndpointType::Hsusb => "hsusb",
            EndpointType::Pcie => "pcie",
            EndpointType::Embedded => "embedded",
            EndpointType::BamDmux => "bam-dmux",
            EndpointType::Undefined => "undefined",
        }
    }
}

impl fmt::Display for EndpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// (endpoint type, interface number) identifying one physical data channel.
///
/// Some firmware requires it on WDA requests to know which channel the
/// request applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointInfo {
    pub endpoint_type: EndpointType,
    pub interface_number: u32,
}

impl EndpointInfo {
    pub const UNDEFINED: EndpointInfo = EndpointInfo {
        endpoint_type: EndpointType::Undefined,
        interface_number: 0,
    };

    /// Derive the endpoint identity from the port's transport metadata.
    pub fn derive(subsys: PortSubsys, kernel: Option<&KernelDevice>) -> Self {
        let Some(kernel) = kernel else {
            return Self::UNDEFINED;
        };
        let endpoint_type = EndpointType::for_subsys(subsys);
        let interface_number = match endpoint_type {
            EndpointType::Hsusb => kernel.interface_number,
            EndpointType::Embedded => 1,
            _ => 0,
        };
        EndpointInfo {
            endpoint_type,
            interface_number,
        }
    }

    pub fn is_defined(&self) -> bool {
        self.endpoint_type != EndpointType::Undefined
    }
}

impl Default for EndpointInfo {
    fn default() -> Self {
        Self::UNDEFINED
    }
}

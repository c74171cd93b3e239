//! Kernel-side frame format: capability probing, reading and writing.
//!
//! Only `qmi_wwan` (usbmisc) can switch between raw-IP and 802.3. Every
//! other driver family has fixed raw-IP framing and is never queried.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::device::{guarded, QmiDevice};
use crate::error::Result;
use crate::types::{DataFormat, PortSubsys};

/// Which frame formats the kernel driver can be told to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KernelCapabilities {
    pub ieee_802_3: bool,
    pub raw_ip: bool,
}

impl KernelCapabilities {
    pub fn supports(&self, format: DataFormat) -> bool {
        match format {
            DataFormat::Ieee8023 => self.ieee_802_3,
            DataFormat::RawIp => self.raw_ip,
        }
    }
}

/// Reads and writes the kernel's expected frame format on one device.
pub struct KernelFormatSync<'a> {
    device: &'a dyn QmiDevice,
    subsys: PortSubsys,
    timeout: Duration,
    cancel: &'a CancellationToken,
}

impl<'a> KernelFormatSync<'a> {
    pub fn new(
        device: &'a dyn QmiDevice,
        subsys: PortSubsys,
        timeout: Duration,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            device,
            subsys,
            timeout,
            cancel,
        }
    }

    pub async fn capabilities(&self) -> Result<KernelCapabilities> {
        if !self.subsys.has_switchable_format() {
            return Ok(KernelCapabilities {
                ieee_802_3: false,
                raw_ip: true,
            });
        }

        let raw_ip = guarded(
            "kernel data format capabilities",
            self.timeout,
            self.cancel,
            self.device
                .check_expected_data_format_supported(DataFormat::RawIp),
        )
        .await?;

        Ok(KernelCapabilities {
            ieee_802_3: true,
            raw_ip,
        })
    }

    pub async fn read_current(&self) -> Result<DataFormat> {
        if !self.subsys.has_switchable_format() {
            return Ok(DataFormat::RawIp);
        }

        let current = guarded(
            "kernel data format",
            self.timeout,
            self.cancel,
            self.device.expected_data_format(),
        )
        .await?;

        // Kernels without the raw_ip knob can't report it; they only do 802.3.
        Ok(current.unwrap_or(DataFormat::Ieee8023))
    }

    /// Update the kernel's expected format. The caller must re-read the
    /// current value afterwards.
    pub async fn write(&self, current: Option<DataFormat>, requested: DataFormat) -> Result<()> {
        debug!(
            device = %self.device.path().display(),
            current = current.map(|f| f.as_str()).unwrap_or("unknown"),
            %requested,
            "updating kernel expected data format"
        );
        guarded(
            "kernel data format update",
            self.timeout,
            self.cancel,
            self.device.set_expected_data_format(requested),
        )
        .await
    }
}

//! QMI device abstraction.
//!
//! [`QmiDevice`] is the handle to one `/dev/cdc-wdm*` (or equivalent)
//! control node. The port layer only ever talks to the modem through this
//! trait, so the real libqmi/proxy backend and the scripted
//! [`MockDevice`](crate::test_util::MockDevice) are interchangeable.
//!
//! Deadlines are not part of the trait: every call site bounds its request
//! with the timeout configured for that call (see [`PortTimeouts`]).
//!
//! [`PortTimeouts`]: crate::config::PortTimeouts

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bitflags::bitflags;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{DataFormat, EndpointInfo, LinkLayerProtocol, Service};

bitflags! {
    /// Flags controlling how a device is opened.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        /// Run the CTL version-info handshake.
        const VERSION_INFO      = 1 << 0;
        /// Ask the CTL service to configure 802.3 framing.
        const NET_802_3         = 1 << 2;
        /// Ask the CTL service to configure raw-IP framing.
        const NET_RAW_IP        = 1 << 3;
        const NET_NO_QOS_HEADER = 1 << 5;
        /// Go through the QMI proxy so other processes can share the node.
        const PROXY             = 1 << 6;
    }
}

impl OpenFlags {
    /// The CTL framing flag forcing `format`.
    pub fn for_data_format(format: DataFormat) -> Self {
        match format {
            DataFormat::Ieee8023 => OpenFlags::NET_802_3,
            DataFormat::RawIp => OpenFlags::NET_RAW_IP,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ReleaseClientFlags: u32 {
        /// Release the client id in the modem, not just locally.
        const RELEASE_CID = 1 << 0;
    }
}

/// A client id allocated for one service on an open device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QmiClient {
    service: Service,
    cid: u8,
}

impl QmiClient {
    pub fn new(service: Service, cid: u8) -> Self {
        Self { service, cid }
    }

    pub fn service(&self) -> Service {
        self.service
    }

    pub fn cid(&self) -> u8 {
        self.cid
    }
}

// ─── WDA messages ───────────────────────────────────────────────────────────

/// Data aggregation protocol (uplink/downlink TLVs of WDA data format).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum AggregationProtocol {
    Disabled = 0x00,
    Tlp = 0x01,
    QcNcm = 0x02,
    Mbim = 0x03,
    Rndis = 0x04,
    Qmap = 0x05,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WdaGetDataFormatInput {
    pub endpoint: Option<EndpointInfo>,
}

/// Response of WDA Get Data Format. Every TLV is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WdaGetDataFormatOutput {
    pub link_layer_protocol: Option<LinkLayerProtocol>,
    pub uplink_aggregation: Option<AggregationProtocol>,
    pub downlink_aggregation: Option<AggregationProtocol>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WdaSetDataFormatInput {
    pub link_layer_protocol: LinkLayerProtocol,
    pub uplink_aggregation: AggregationProtocol,
    pub downlink_aggregation: AggregationProtocol,
    pub endpoint: Option<EndpointInfo>,
}

impl WdaSetDataFormatInput {
    /// Request `llp` with aggregation disabled in both directions.
    pub fn new(llp: LinkLayerProtocol) -> Self {
        Self {
            link_layer_protocol: llp,
            uplink_aggregation: AggregationProtocol::Disabled,
            downlink_aggregation: AggregationProtocol::Disabled,
            endpoint: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: Option<EndpointInfo>) -> Self {
        self.endpoint = endpoint;
        self
    }
}

// ─── Traits ─────────────────────────────────────────────────────────────────

/// Asynchronous handle to a QMI control device.
#[async_trait]
pub trait QmiDevice: Send + Sync {
    /// Path of the device node this handle is bound to.
    fn path(&self) -> &Path;

    async fn open(&self, flags: OpenFlags) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Frame format the kernel driver currently expects, or `None` when the
    /// kernel cannot report it.
    async fn expected_data_format(&self) -> Result<Option<DataFormat>>;

    async fn set_expected_data_format(&self, format: DataFormat) -> Result<()>;

    async fn check_expected_data_format_supported(&self, format: DataFormat) -> Result<bool>;

    async fn allocate_client(&self, service: Service) -> Result<QmiClient>;

    async fn release_client(&self, client: QmiClient, flags: ReleaseClientFlags) -> Result<()>;

    async fn wda_get_data_format(
        &self,
        client: &QmiClient,
        input: WdaGetDataFormatInput,
    ) -> Result<WdaGetDataFormatOutput>;

    async fn wda_set_data_format(
        &self,
        client: &QmiClient,
        input: WdaSetDataFormatInput,
    ) -> Result<()>;
}

/// Creates device handles for a device node path.
#[async_trait]
pub trait DeviceFactory: Send + Sync {
    async fn create(&self, path: &Path) -> Result<Arc<dyn QmiDevice>>;
}

// ─── Call helpers ───────────────────────────────────────────────────────────

/// Bound `fut` by `timeout`.
pub(crate) async fn with_timeout<T, F>(what: &'static str, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .unwrap_or(Err(Error::Timeout(what)))
}

/// Bound `fut` by `timeout` and abort it when `cancel` fires.
pub(crate) async fn guarded<T, F>(
    what: &'static str,
    timeout: Duration,
    cancel: &CancellationToken,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        res = with_timeout(what, timeout, fut) => res,
    }
}

/// Release `client` without waiting for the outcome.
///
/// Needs a Tokio runtime; outside of one the client id is left to the
/// device's own cleanup when it is closed.
pub(crate) fn release_detached(device: Arc<dyn QmiDevice>, client: QmiClient, timeout: Duration) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        debug!(
            service = %client.service(),
            cid = client.cid(),
            "no runtime available, client left to device cleanup"
        );
        return;
    };
    handle.spawn(async move {
        let service = client.service();
        let cid = client.cid();
        let res = with_timeout(
            "client release",
            timeout,
            device.release_client(client, ReleaseClientFlags::RELEASE_CID),
        )
        .await;
        if let Err(e) = res {
            debug!(%service, cid, error = %e, "couldn't release client");
        }
    });
}

//! # QMI Port
//!
//! One QMI control port: owns the device handle, the service clients
//! allocated on it and the negotiated data format.
//!
//! ## Open
//!
//! ```text
//! create device → open(VERSION_INFO|PROXY) ─(no force)──────────────→ done
//!                        │
//!                        └→ query data format ─(ok)─────────────────→ done
//!                                  │
//!                                  └(failed: WDA unsupported)
//!                                     → close → read kernel format
//!                                     → open(… | NET_RAW_IP / NET_802_3) → done
//! ```
//!
//! Once the firmware is known not to support WDA data format negotiation,
//! later opens go straight to the CTL reopen. Any failure closes the
//! partially opened device before the error is returned.
//!
//! Only one open/close runs at a time; a second one fails with
//! [`Error::InProgress`] instead of waiting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PortConfig;
use crate::data_format::{DataFormatSetup, SetupParams};
use crate::device::{
    guarded, release_detached, with_timeout, DeviceFactory, OpenFlags, QmiClient, QmiDevice,
    ReleaseClientFlags,
};
use crate::error::{Error, Result};
use crate::kernel::KernelFormatSync;
use crate::types::{
    DataFormat, DataFormatCombination, EndpointInfo, KernelDevice, LinkLayerProtocol, PortFlag,
    PortSubsys, Service, SetupAction,
};

#[derive(Default)]
struct PortState {
    /// An open or close is running.
    in_progress: bool,
    device: Option<Arc<dyn QmiDevice>>,
    clients: HashMap<(Service, PortFlag), QmiClient>,
    kernel_data_format: Option<DataFormat>,
    llp: Option<LinkLayerProtocol>,
}

pub struct QmiPort {
    name: String,
    subsys: PortSubsys,
    config: PortConfig,
    factory: Arc<dyn DeviceFactory>,
    endpoint: OnceLock<EndpointInfo>,
    /// Sticky: once set, data format is only ever configured through CTL.
    wda_unsupported: AtomicBool,
    state: Mutex<PortState>,
}

/// Clears the in-progress flag when the owning operation ends, however it ends.
struct InProgress<'a> {
    port: &'a QmiPort,
}

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.port.lock().in_progress = false;
    }
}

impl QmiPort {
    pub fn new(
        name: impl Into<String>,
        subsys: PortSubsys,
        factory: Arc<dyn DeviceFactory>,
    ) -> Self {
        Self::with_config(name, subsys, factory, PortConfig::default())
    }

    pub fn with_config(
        name: impl Into<String>,
        subsys: PortSubsys,
        factory: Arc<dyn DeviceFactory>,
        config: PortConfig,
    ) -> Self {
        Self {
            name: name.into(),
            subsys,
            config,
            factory,
            endpoint: OnceLock::new(),
            wda_unsupported: AtomicBool::new(false),
            state: Mutex::new(PortState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PortState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ─── Accessors ──────────────────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subsys(&self) -> PortSubsys {
        self.subsys
    }

    /// Record the kernel device backing this port and derive the endpoint
    /// identity from it. Only the first call has an effect.
    pub fn attach_kernel_device(&self, kernel: Option<&KernelDevice>) {
        let info = EndpointInfo::derive(self.subsys, kernel);
        if self.endpoint.set(info).is_err() {
            debug!(port = %self.name, "endpoint info already set, ignoring kernel device update");
            return;
        }
        debug!(
            port = %self.name,
            kernel_device = kernel.map(|k| k.name.as_str()).unwrap_or("none"),
            endpoint_type = %info.endpoint_type,
            interface = info.interface_number,
            "endpoint info updated"
        );
    }

    /// Endpoint identity; undefined until a kernel device is attached.
    pub fn endpoint(&self) -> EndpointInfo {
        self.endpoint.get().copied().unwrap_or_default()
    }

    pub fn is_open(&self) -> bool {
        self.lock().device.is_some()
    }

    pub fn device(&self) -> Option<Arc<dyn QmiDevice>> {
        self.lock().device.clone()
    }

    pub fn kernel_data_format(&self) -> Option<DataFormat> {
        self.lock().kernel_data_format
    }

    pub fn link_layer_protocol(&self) -> Option<LinkLayerProtocol> {
        self.lock().llp
    }

    pub fn wda_unsupported(&self) -> bool {
        self.wda_unsupported.load(Ordering::SeqCst)
    }

    // ─── Open / close ───────────────────────────────────────────────────────

    /// Open the port. With `force_data_format` the kernel and firmware data
    /// formats are loaded, falling back to a CTL reopen when the firmware
    /// can't report them.
    pub async fn open(&self, force_data_format: bool, cancel: &CancellationToken) -> Result<()> {
        debug!(port = %self.name, "opening QMI device");
        let _in_progress = {
            let mut state = self.lock();
            if state.in_progress {
                return Err(Error::InProgress);
            }
            if state.device.is_some() {
                return Ok(());
            }
            state.in_progress = true;
            InProgress { port: self }
        };

        let path = self.config.device_path(&self.name);
        debug!(port = %self.name, path = %path.display(), "creating QMI device");
        let created = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            res = self.factory.create(&path) => res,
        };
        let device = created.map_err(|e| e.context("couldn't create QMI device"))?;

        if let Err(e) = self.open_sequence(&device, force_data_format, cancel).await {
            debug!(port = %self.name, error = %e, "QMI port open operation failed");
            let closed =
                with_timeout("QMI device close", self.config.timeouts.close, device.close()).await;
            if let Err(close_err) = closed {
                warn!(
                    port = %self.name,
                    error = %close_err,
                    "couldn't close QMI device after failed open sequence"
                );
            }
            return Err(e);
        }

        let mut state = self.lock();
        state.device = Some(device);
        info!(
            port = %self.name,
            kernel = state.kernel_data_format.map(|f| f.as_str()).unwrap_or("unknown"),
            llp = state.llp.map(|p| p.as_str()).unwrap_or("unknown"),
            wda_unsupported = self.wda_unsupported(),
            "QMI port open operation finished successfully"
        );
        Ok(())
    }

    async fn open_sequence(
        &self,
        device: &Arc<dyn QmiDevice>,
        force_data_format: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let timeouts = &self.config.timeouts;

        if !self.wda_unsupported() {
            debug!(port = %self.name, "opening device without data format update");
            guarded(
                "QMI device open",
                timeouts.open_version_info,
                cancel,
                device.open(OpenFlags::VERSION_INFO | OpenFlags::PROXY),
            )
            .await?;

            if !force_data_format {
                return Ok(());
            }

            match self.run_setup(device.clone(), SetupAction::Query, cancel).await {
                Ok(current) => {
                    self.store_data_format(current);
                    return Ok(());
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(port = %self.name, error = %e, "couldn't setup data format");
                    self.wda_unsupported.store(true, Ordering::SeqCst);
                }
            }
        }

        if device.is_open() {
            debug!(port = %self.name, "closing device to reopen it right away");
            let closed = guarded("QMI device close", timeouts.close, cancel, device.close()).await;
            if let Err(e) = closed {
                warn!(port = %self.name, error = %e, "couldn't close QMI device to reopen it");
                return Err(e);
            }
        }

        // A kernel that can't report its format only does 802.3.
        let read = KernelFormatSync::new(&**device, self.subsys, timeouts.ctl_query, cancel)
            .read_current()
            .await;
        let kernel = match read {
            Ok(kernel) => kernel,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                warn!(
                    port = %self.name,
                    error = %e,
                    "couldn't read kernel data format, assuming 802.3"
                );
                DataFormat::Ieee8023
            }
        };
        let flags = OpenFlags::VERSION_INFO
            | OpenFlags::PROXY
            | OpenFlags::NET_NO_QOS_HEADER
            | OpenFlags::for_data_format(kernel);

        debug!(port = %self.name, %kernel, "reopening device with data format");
        guarded(
            "QMI device open",
            timeouts.open_with_format,
            cancel,
            device.open(flags),
        )
        .await?;

        self.store_data_format(DataFormatCombination::from_kernel(kernel));
        Ok(())
    }

    /// Release every client and close the device. Closing a closed port is
    /// a no-op.
    pub async fn close(&self) -> Result<()> {
        let (device, clients, _in_progress) = {
            let mut state = self.lock();
            if state.in_progress {
                return Err(Error::InProgress);
            }
            let Some(device) = state.device.take() else {
                return Ok(());
            };
            state.in_progress = true;
            let clients: Vec<QmiClient> = state.clients.drain().map(|(_, c)| c).collect();
            (device, clients, InProgress { port: self })
        };

        let timeouts = &self.config.timeouts;
        for client in clients {
            let service = client.service();
            debug!(port = %self.name, %service, "releasing client");
            let released = with_timeout(
                "client release",
                timeouts.release_client,
                device.release_client(client, ReleaseClientFlags::RELEASE_CID),
            )
            .await;
            if let Err(e) = released {
                warn!(port = %self.name, %service, error = %e, "couldn't release client");
            }
        }

        debug!(port = %self.name, "closing QMI device");
        with_timeout("QMI device close", timeouts.close, device.close()).await
    }

    // ─── Data format ────────────────────────────────────────────────────────

    /// Query or apply the data format on the open device. The resulting
    /// pair is cached on the port.
    pub async fn setup_data_format(
        &self,
        action: SetupAction,
        cancel: &CancellationToken,
    ) -> Result<DataFormatCombination> {
        let device = self
            .device()
            .ok_or_else(|| Error::WrongState("port not open".into()))?;
        if self.wda_unsupported() {
            return Err(Error::Unsupported(
                "setting up data format is unsupported".into(),
            ));
        }

        let combination = self.run_setup(device, action, cancel).await?;
        self.store_data_format(combination);
        Ok(combination)
    }

    async fn run_setup(
        &self,
        device: Arc<dyn QmiDevice>,
        action: SetupAction,
        cancel: &CancellationToken,
    ) -> Result<DataFormatCombination> {
        DataFormatSetup::new(SetupParams {
            device,
            subsys: self.subsys,
            endpoint: self.endpoint(),
            action,
            timeouts: &self.config.timeouts,
            cancel,
            firmware_unsupported: &self.wda_unsupported,
        })
        .run()
        .await
    }

    fn store_data_format(&self, combination: DataFormatCombination) {
        let mut state = self.lock();
        state.kernel_data_format = Some(combination.kernel);
        state.llp = Some(combination.llp);
    }

    // ─── Clients ────────────────────────────────────────────────────────────

    /// Allocate a client for `service`, registered under `flag`.
    pub async fn allocate_client(
        &self,
        service: Service,
        flag: PortFlag,
        cancel: &CancellationToken,
    ) -> Result<QmiClient> {
        let device = {
            let state = self.lock();
            let Some(device) = state.device.clone() else {
                return Err(Error::WrongState("port is closed".into()));
            };
            if state.clients.contains_key(&(service, flag)) {
                return Err(already_allocated(service));
            }
            device
        };

        let client = guarded(
            "client allocation",
            self.config.timeouts.allocate_client,
            cancel,
            device.allocate_client(service),
        )
        .await
        .map_err(|e| e.context(format!("couldn't create client for service '{service}'")))?;

        let mut state = self.lock();
        let same_device = state
            .device
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, &device));
        let conflict = if !same_device {
            Some(Error::WrongState("port closed during client allocation".into()))
        } else if state.clients.contains_key(&(service, flag)) {
            Some(already_allocated(service))
        } else {
            None
        };
        if let Some(e) = conflict {
            drop(state);
            release_detached(device, client, self.config.timeouts.release_client);
            return Err(e);
        }

        debug!(port = %self.name, %service, cid = client.cid(), ?flag, "allocated client");
        state.clients.insert((service, flag), client.clone());
        Ok(client)
    }

    /// The client allocated for `service` under `flag`, if any.
    pub fn peek_client(&self, service: Service, flag: PortFlag) -> Option<QmiClient> {
        self.lock().clients.get(&(service, flag)).cloned()
    }

    /// Forget the client and release it in the background. No-op when the
    /// port is closed or no such client exists.
    pub fn release_client(&self, service: Service, flag: PortFlag) {
        let (device, client) = {
            let mut state = self.lock();
            let Some(device) = state.device.clone() else {
                return;
            };
            let Some(client) = state.clients.remove(&(service, flag)) else {
                return;
            };
            (device, client)
        };
        debug!(port = %self.name, %service, "explicitly releasing client");
        release_detached(device, client, self.config.timeouts.release_client);
    }
}

fn already_allocated(service: Service) -> Error {
    Error::Exists(format!("client for service '{service}' already allocated"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{settle, Call, FirmwareMode, MockDevice, MockFactory};
    use crate::types::EndpointType;

    fn port_with(subsys: PortSubsys) -> (QmiPort, Arc<MockFactory>) {
        let factory = Arc::new(MockFactory::new(Arc::new(MockDevice::new("/dev/cdc-wdm0"))));
        let port = QmiPort::new("cdc-wdm0", subsys, factory.clone());
        (port, factory)
    }

    #[test]
    fn endpoint_is_derived_once() {
        let (port, _) = port_with(PortSubsys::Usbmisc);
        assert_eq!(port.endpoint(), EndpointInfo::UNDEFINED);

        port.attach_kernel_device(Some(&KernelDevice {
            name: "cdc-wdm0".into(),
            interface_number: 8,
        }));
        port.attach_kernel_device(Some(&KernelDevice {
            name: "cdc-wdm0".into(),
            interface_number: 2,
        }));
        let info = port.endpoint();
        assert_eq!(info.endpoint_type, EndpointType::Hsusb);
        assert_eq!(info.interface_number, 8);
    }

    #[tokio::test]
    async fn open_without_force_stops_after_first_open() {
        let (port, factory) = port_with(PortSubsys::Usbmisc);
        port.open(false, &CancellationToken::new()).await.unwrap();

        assert!(port.is_open());
        assert_eq!(
            factory.device().calls(),
            vec![Call::Open(OpenFlags::VERSION_INFO | OpenFlags::PROXY)]
        );
        assert_eq!(port.kernel_data_format(), None);
        assert_eq!(port.link_layer_protocol(), None);
    }

    #[tokio::test]
    async fn open_with_force_caches_queried_formats() {
        let (port, factory) = port_with(PortSubsys::Usbmisc);
        {
            let mut script = factory.device().script();
            script.kernel_format = Some(DataFormat::Ieee8023);
            script.firmware_llp = LinkLayerProtocol::Ieee8023;
        }
        port.open(true, &CancellationToken::new()).await.unwrap();

        assert_eq!(port.kernel_data_format(), Some(DataFormat::Ieee8023));
        assert_eq!(port.link_layer_protocol(), Some(LinkLayerProtocol::Ieee8023));
        assert!(!port.wda_unsupported());
        assert_eq!(factory.device().write_count(), 0);
        assert_eq!(factory.device().count(|c| *c == Call::Close), 0);
    }

    #[tokio::test]
    async fn open_twice_is_idempotent() {
        let (port, factory) = port_with(PortSubsys::Usbmisc);
        let cancel = CancellationToken::new();
        port.open(false, &cancel).await.unwrap();
        port.open(false, &cancel).await.unwrap();
        assert_eq!(factory.created(), 1);
    }

    #[tokio::test]
    async fn open_failure_closes_and_clears_in_progress() {
        let (port, factory) = port_with(PortSubsys::Usbmisc);
        factory.device().script().open_failures = 1;
        let cancel = CancellationToken::new();

        assert!(port.open(false, &cancel).await.is_err());
        assert!(!port.is_open());
        assert_eq!(factory.device().count(|c| *c == Call::Close), 1);

        // flag was cleared, so a retry goes through
        port.open(false, &cancel).await.unwrap();
        assert!(port.is_open());
    }

    #[tokio::test]
    async fn failed_cleanup_close_keeps_open_error() {
        let (port, factory) = port_with(PortSubsys::Usbmisc);
        {
            let mut script = factory.device().script();
            script.open_failures = 1;
            script.close_fails = true;
        }
        let err = port.open(false, &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "transport error: open failed");
    }

    #[tokio::test]
    async fn device_creation_failure_is_prefixed() {
        let (port, factory) = port_with(PortSubsys::Usbmisc);
        factory.set_create_fails(true);
        let err = port.open(true, &CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().starts_with("couldn't create QMI device"));
        assert!(factory.device().calls().is_empty());
    }

    #[tokio::test]
    async fn close_before_reopen_failure_fails_open() {
        let (port, factory) = port_with(PortSubsys::Usbmisc);
        {
            let mut script = factory.device().script();
            script.firmware = FirmwareMode::AllocationFails;
            script.close_fails = true;
        }
        let err = port.open(true, &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "transport error: close failed");
        assert!(port.wda_unsupported());
        assert!(!port.is_open());
    }

    #[tokio::test]
    async fn unreadable_kernel_format_falls_back_to_ctl_802_3() {
        let (port, factory) = port_with(PortSubsys::Usbmisc);
        factory.device().script().kernel_query_fails = true;

        port.open(true, &CancellationToken::new()).await.unwrap();

        assert!(port.is_open());
        assert!(port.wda_unsupported());
        assert_eq!(port.kernel_data_format(), Some(DataFormat::Ieee8023));
        assert_eq!(port.link_layer_protocol(), Some(LinkLayerProtocol::Ieee8023));
        assert_eq!(factory.device().count(|c| *c == Call::Close), 1);
        assert!(factory.device().calls().contains(&Call::Open(
            OpenFlags::VERSION_INFO
                | OpenFlags::PROXY
                | OpenFlags::NET_NO_QOS_HEADER
                | OpenFlags::NET_802_3
        )));
        assert_eq!(factory.device().write_count(), 0);
    }

    #[tokio::test]
    async fn cancelled_firmware_query_does_not_mark_wda_unsupported() {
        let (port, factory) = port_with(PortSubsys::Usbmisc);
        let cancel = CancellationToken::new();
        factory.device().script().cancel_on_wda_get = Some(cancel.clone());

        let err = port.open(true, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(!port.wda_unsupported());
        assert!(!port.is_open());
        // only the cleanup close, no CTL reopen
        assert_eq!(factory.device().count(|c| *c == Call::Close), 1);
        assert_eq!(factory.device().count(|c| matches!(c, Call::Open(_))), 1);

        // the next open still negotiates through WDA
        factory.device().script().cancel_on_wda_get = None;
        port.open(true, &CancellationToken::new()).await.unwrap();
        assert!(!port.wda_unsupported());
        assert_eq!(port.link_layer_protocol(), Some(LinkLayerProtocol::RawIp));
    }

    #[tokio::test]
    async fn known_unsupported_skips_first_open() {
        let (port, factory) = port_with(PortSubsys::Usbmisc);
        factory.device().script().firmware = FirmwareMode::AllocationFails;
        let cancel = CancellationToken::new();
        port.open(true, &cancel).await.unwrap();
        port.close().await.unwrap();
        factory.device().clear_calls();

        factory.device().script().kernel_format = Some(DataFormat::Ieee8023);
        port.open(false, &cancel).await.unwrap();

        let opens: Vec<_> = factory
            .device()
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Open(_)))
            .collect();
        assert_eq!(
            opens,
            vec![Call::Open(
                OpenFlags::VERSION_INFO
                    | OpenFlags::PROXY
                    | OpenFlags::NET_NO_QOS_HEADER
                    | OpenFlags::NET_802_3
            )]
        );
        assert_eq!(port.kernel_data_format(), Some(DataFormat::Ieee8023));
        assert_eq!(port.link_layer_protocol(), Some(LinkLayerProtocol::Ieee8023));
    }

    #[tokio::test]
    async fn setup_requires_open_port() {
        let (port, _) = port_with(PortSubsys::Usbmisc);
        let err = port
            .setup_data_format(SetupAction::Apply, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WrongState(_)));
    }

    #[tokio::test]
    async fn setup_rejected_once_wda_unsupported() {
        let (port, factory) = port_with(PortSubsys::Usbmisc);
        factory.device().script().firmware = FirmwareMode::AllocationFails;
        let cancel = CancellationToken::new();
        port.open(true, &cancel).await.unwrap();

        let err = port
            .setup_data_format(SetupAction::Apply, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[tokio::test]
    async fn apply_updates_cached_formats() {
        let (port, factory) = port_with(PortSubsys::Usbmisc);
        {
            let mut script = factory.device().script();
            script.kernel_format = Some(DataFormat::Ieee8023);
            script.firmware_llp = LinkLayerProtocol::Ieee8023;
        }
        let cancel = CancellationToken::new();
        port.open(true, &cancel).await.unwrap();

        let result = port
            .setup_data_format(SetupAction::Apply, &cancel)
            .await
            .unwrap();
        assert_eq!(result.kernel, DataFormat::RawIp);
        assert_eq!(port.kernel_data_format(), Some(DataFormat::RawIp));
        assert_eq!(port.link_layer_protocol(), Some(LinkLayerProtocol::RawIp));
    }

    #[tokio::test]
    async fn allocate_requires_open_port() {
        let (port, _) = port_with(PortSubsys::Usbmisc);
        let err = port
            .allocate_client(Service::Wds, PortFlag::Default, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WrongState(_)));
    }

    #[tokio::test]
    async fn allocation_error_is_prefixed() {
        let (port, factory) = port_with(PortSubsys::Usbmisc);
        let cancel = CancellationToken::new();
        port.open(false, &cancel).await.unwrap();
        factory.device().script().allocate_fails = true;

        let err = port
            .allocate_client(Service::Nas, PortFlag::Default, &cancel)
            .await
            .unwrap_err();
        assert!(err
            .to_string()
            .starts_with("couldn't create client for service 'nas'"));
        assert!(port.peek_client(Service::Nas, PortFlag::Default).is_none());
    }

    #[tokio::test]
    async fn clients_keyed_by_service_and_flag() {
        let (port, _) = port_with(PortSubsys::Usbmisc);
        let cancel = CancellationToken::new();
        port.open(false, &cancel).await.unwrap();

        let v4 = port
            .allocate_client(Service::Wds, PortFlag::WdsIpv4, &cancel)
            .await
            .unwrap();
        let v6 = port
            .allocate_client(Service::Wds, PortFlag::WdsIpv6, &cancel)
            .await
            .unwrap();
        assert_ne!(v4.cid(), v6.cid());
        assert_eq!(port.peek_client(Service::Wds, PortFlag::WdsIpv4), Some(v4));
        assert_eq!(port.peek_client(Service::Wds, PortFlag::WdsIpv6), Some(v6));
    }

    #[tokio::test]
    async fn release_client_forgets_and_releases() {
        let (port, factory) = port_with(PortSubsys::Usbmisc);
        let cancel = CancellationToken::new();
        port.open(false, &cancel).await.unwrap();
        port.allocate_client(Service::Dms, PortFlag::Default, &cancel)
            .await
            .unwrap();

        port.release_client(Service::Dms, PortFlag::Default);
        // absent: no-op
        port.release_client(Service::Dms, PortFlag::Default);
        settle().await;

        assert!(port.peek_client(Service::Dms, PortFlag::Default).is_none());
        assert_eq!(
            factory.device().count(|c| *c == Call::Release(Service::Dms)),
            1
        );
    }

    #[tokio::test]
    async fn close_releases_clients_before_closing() {
        let (port, factory) = port_with(PortSubsys::Usbmisc);
        let cancel = CancellationToken::new();
        port.open(false, &cancel).await.unwrap();
        port.allocate_client(Service::Nas, PortFlag::Default, &cancel)
            .await
            .unwrap();
        factory.device().clear_calls();

        port.close().await.unwrap();
        assert_eq!(
            factory.device().calls(),
            vec![Call::Release(Service::Nas), Call::Close]
        );
        assert!(!port.is_open());
        assert!(port.peek_client(Service::Nas, PortFlag::Default).is_none());
    }

    #[tokio::test]
    async fn close_failure_is_reported() {
        let (port, factory) = port_with(PortSubsys::Usbmisc);
        port.open(false, &CancellationToken::new()).await.unwrap();
        factory.device().script().close_fails = true;

        assert!(port.close().await.is_err());
        assert!(!port.is_open());
        // not stuck in progress
        port.close().await.unwrap();
    }
}

//! Scripted in-memory QMI device for tests.
//!
//! [`MockDevice`] keeps a kernel frame format and a firmware link-layer
//! protocol like a real modem would, applies writes to them (unless told
//! to ignore them), and records every call so tests can assert on exactly
//! what a port operation did.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::device::{
    DeviceFactory, OpenFlags, QmiClient, QmiDevice, ReleaseClientFlags, WdaGetDataFormatInput,
    WdaGetDataFormatOutput, WdaSetDataFormatInput,
};
use crate::error::{Error, ProtocolError, Result};
use crate::types::{DataFormat, EndpointInfo, LinkLayerProtocol, Service};

/// One recorded device call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Open(OpenFlags),
    Close,
    QueryFormat,
    SetFormat(DataFormat),
    CheckFormatSupported(DataFormat),
    Allocate(Service),
    Release(Service),
    WdaGet {
        endpoint: Option<EndpointInfo>,
    },
    WdaSet {
        llp: LinkLayerProtocol,
        endpoint: Option<EndpointInfo>,
    },
}

/// How the firmware's WDA service behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FirmwareMode {
    #[default]
    Supported,
    /// WDA client allocation is rejected.
    AllocationFails,
    /// Every get data format fails with this code.
    GetFails(ProtocolError),
    /// Get data format without endpoint info fails with missing-argument.
    RequiresEndpoint,
    /// Get data format answers without the link-layer-protocol TLV.
    MissingLlp,
    /// Set data format is rejected.
    SetFails,
}

/// Knobs and simulated modem state.
#[derive(Debug, Clone)]
pub struct MockScript {
    /// What the kernel reports; `None` for kernels that can't tell.
    pub kernel_format: Option<DataFormat>,
    pub raw_ip_supported: bool,
    pub kernel_query_fails: bool,
    pub kernel_write_fails: bool,
    pub firmware: FirmwareMode,
    pub firmware_llp: LinkLayerProtocol,
    /// Firmware acknowledges set data format but keeps its old value.
    pub firmware_ignores_set: bool,
    /// Number of upcoming `open` calls that fail.
    pub open_failures: usize,
    pub close_fails: bool,
    pub allocate_fails: bool,
    /// When set, `open` waits for a notification before completing.
    pub open_gate: Option<Arc<Notify>>,
    /// When set, get data format fires this token and never answers.
    pub cancel_on_wda_get: Option<CancellationToken>,
}

impl Default for MockScript {
    fn default() -> Self {
        Self {
            kernel_format: Some(DataFormat::RawIp),
            raw_ip_supported: true,
            kernel_query_fails: false,
            kernel_write_fails: false,
            firmware: FirmwareMode::Supported,
            firmware_llp: LinkLayerProtocol::RawIp,
            firmware_ignores_set: false,
            open_failures: 0,
            close_fails: false,
            allocate_fails: false,
            open_gate: None,
            cancel_on_wda_get: None,
        }
    }
}

pub struct MockDevice {
    path: PathBuf,
    open: AtomicBool,
    next_cid: AtomicUsize,
    script: Mutex<MockScript>,
    calls: Mutex<Vec<Call>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl MockDevice {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            open: AtomicBool::new(false),
            next_cid: AtomicUsize::new(1),
            script: Mutex::new(MockScript::default()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// A device that is already open, for driving negotiation directly.
    pub fn opened(path: impl Into<PathBuf>) -> Self {
        let dev = Self::new(path);
        dev.open.store(true, Ordering::SeqCst);
        dev
    }

    pub fn script(&self) -> MutexGuard<'_, MockScript> {
        lock(&self.script)
    }

    pub fn calls(&self) -> Vec<Call> {
        lock(&self.calls).clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        lock(&self.calls).iter().filter(|c| pred(c)).count()
    }

    /// Kernel and firmware format writes issued so far.
    pub fn write_count(&self) -> usize {
        self.count(|c| matches!(c, Call::SetFormat(_) | Call::WdaSet { .. }))
    }

    fn record(&self, call: Call) {
        lock(&self.calls).push(call);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Transport("device not open".into()))
        }
    }
}

#[async_trait]
impl QmiDevice for MockDevice {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn open(&self, flags: OpenFlags) -> Result<()> {
        self.record(Call::Open(flags));
        let gate = self.script().open_gate.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let mut script = self.script();
        if script.open_failures > 0 {
            script.open_failures -= 1;
            return Err(Error::Transport("open failed".into()));
        }
        if flags.contains(OpenFlags::NET_RAW_IP) {
            script.kernel_format = Some(DataFormat::RawIp);
        } else if flags.contains(OpenFlags::NET_802_3) {
            script.kernel_format = Some(DataFormat::Ieee8023);
        }
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.record(Call::Close);
        self.open.store(false, Ordering::SeqCst);
        if self.script().close_fails {
            return Err(Error::Transport("close failed".into()));
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn expected_data_format(&self) -> Result<Option<DataFormat>> {
        self.record(Call::QueryFormat);
        let script = self.script();
        if script.kernel_query_fails {
            return Err(Error::Transport("couldn't read raw_ip attribute".into()));
        }
        Ok(script.kernel_format)
    }

    async fn set_expected_data_format(&self, format: DataFormat) -> Result<()> {
        self.record(Call::SetFormat(format));
        let mut script = self.script();
        if script.kernel_write_fails {
            return Err(Error::Transport("couldn't write raw_ip attribute".into()));
        }
        script.kernel_format = Some(format);
        Ok(())
    }

    async fn check_expected_data_format_supported(&self, format: DataFormat) -> Result<bool> {
        self.record(Call::CheckFormatSupported(format));
        let script = self.script();
        Ok(match format {
            DataFormat::RawIp => script.raw_ip_supported,
            DataFormat::Ieee8023 => true,
        })
    }

    async fn allocate_client(&self, service: Service) -> Result<QmiClient> {
        self.record(Call::Allocate(service));
        self.ensure_open()?;
        {
            let script = self.script();
            if script.allocate_fails
                || (service == Service::Wda && script.firmware == FirmwareMode::AllocationFails)
            {
                return Err(Error::protocol(
                    ProtocolError::NOT_SUPPORTED,
                    format!("service '{service}' not supported"),
                ));
            }
        }
        let cid = self.next_cid.fetch_add(1, Ordering::SeqCst);
        Ok(QmiClient::new(service, cid as u8))
    }

    async fn release_client(&self, client: QmiClient, _flags: ReleaseClientFlags) -> Result<()> {
        self.record(Call::Release(client.service()));
        Ok(())
    }

    async fn wda_get_data_format(
        &self,
        _client: &QmiClient,
        input: WdaGetDataFormatInput,
    ) -> Result<WdaGetDataFormatOutput> {
        self.record(Call::WdaGet {
            endpoint: input.endpoint,
        });
        self.ensure_open()?;
        let cancel = self.script().cancel_on_wda_get.clone();
        if let Some(cancel) = cancel {
            cancel.cancel();
            std::future::pending::<()>().await;
        }
        let script = self.script();
        match script.firmware {
            FirmwareMode::GetFails(code) => Err(Error::protocol(code, "get data format failed")),
            FirmwareMode::RequiresEndpoint if input.endpoint.is_none() => Err(Error::protocol(
                ProtocolError::MISSING_ARGUMENT,
                "endpoint info required",
            )),
            FirmwareMode::MissingLlp => Ok(WdaGetDataFormatOutput::default()),
            _ => Ok(WdaGetDataFormatOutput {
                link_layer_protocol: Some(script.firmware_llp),
                ..Default::default()
            }),
        }
    }

    async fn wda_set_data_format(
        &self,
        _client: &QmiClient,
        input: WdaSetDataFormatInput,
    ) -> Result<()> {
        self.record(Call::WdaSet {
            llp: input.link_layer_protocol,
            endpoint: input.endpoint,
        });
        self.ensure_open()?;
        let mut script = self.script();
        match script.firmware {
            FirmwareMode::SetFails => Err(Error::protocol(
                ProtocolError::INVALID_ARGUMENT,
                "set data format failed",
            )),
            FirmwareMode::RequiresEndpoint if input.endpoint.is_none() => Err(Error::protocol(
                ProtocolError::MISSING_ARGUMENT,
                "endpoint info required",
            )),
            _ => {
                if !script.firmware_ignores_set {
                    script.firmware_llp = input.link_layer_protocol;
                }
                Ok(())
            }
        }
    }
}

/// Hands out the same [`MockDevice`] for every path, like a device node
/// that keeps its state between opens.
pub struct MockFactory {
    device: Arc<MockDevice>,
    create_fails: AtomicBool,
    created: AtomicUsize,
}

impl MockFactory {
    pub fn new(device: Arc<MockDevice>) -> Self {
        Self {
            device,
            create_fails: AtomicBool::new(false),
            created: AtomicUsize::new(0),
        }
    }

    pub fn device(&self) -> &Arc<MockDevice> {
        &self.device
    }

    pub fn set_create_fails(&self, fails: bool) {
        self.create_fails.store(fails, Ordering::SeqCst);
    }

    /// Number of handles created so far.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceFactory for MockFactory {
    async fn create(&self, path: &Path) -> Result<Arc<dyn QmiDevice>> {
        if self.create_fails.load(Ordering::SeqCst) {
            return Err(Error::Transport(format!(
                "couldn't create device for {}",
                path.display()
            )));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(self.device.clone())
    }
}

/// Let detached tasks (client releases) run to completion.
pub async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

//! # Data Format Negotiation
//!
//! Brings the kernel driver's expected frame format and the firmware's
//! link-layer protocol to one of the supported [`DATA_FORMAT_COMBINATIONS`].
//!
//! ## Steps
//!
//! ```text
//! Start → KernelCapabilities → KernelFormatCurrent → AllocateWdaClient
//!       → WdaFormatCurrent → QueryDone ──(query)──────────────→ done
//!                              │
//!                              └→ CheckDataFormat ─(confirmed)→ done
//!                                   │            └(exhausted)─→ error
//!                                   └→ SyncWda → SyncKernel ─┐
//!       KernelFormatCurrent ←─────────────────────────────────┘
//! ```
//!
//! Capabilities are probed and the WDA client allocated on the first pass
//! only. Current values are reloaded only after a write invalidated them.
//! When a pass of writes does not stick (firmware coercing the setting),
//! the next candidate is tried.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::PortTimeouts;
use crate::device::QmiDevice;
use crate::error::{Error, Result};
use crate::kernel::{KernelCapabilities, KernelFormatSync};
use crate::types::{
    DataFormat, DataFormatCombination, EndpointInfo, LinkLayerProtocol, PortSubsys, SetupAction,
    DATA_FORMAT_COMBINATIONS,
};
use crate::wda::WdaNegotiator;

// ─── Combination selection ──────────────────────────────────────────────────

/// Cursor over [`DATA_FORMAT_COMBINATIONS`].
#[derive(Debug, Clone, Default)]
pub struct CombinationCursor {
    next: usize,
    started: bool,
}

impl CombinationCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// True until the first candidate has been requested.
    pub fn is_first(&self) -> bool {
        !self.started
    }

    /// Move to the next candidate whose kernel leg the driver supports.
    pub fn advance(&mut self, caps: &KernelCapabilities) -> Option<DataFormatCombination> {
        self.started = true;
        while let Some(candidate) = DATA_FORMAT_COMBINATIONS.get(self.next) {
            self.next += 1;
            if caps.supports(candidate.kernel) {
                return Some(*candidate);
            }
        }
        None
    }
}

// ─── State machine ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Start,
    KernelCapabilities,
    KernelFormatCurrent,
    AllocateWdaClient,
    WdaFormatCurrent,
    QueryDone,
    CheckDataFormat,
    SyncWda,
    SyncKernel,
}

enum Check {
    Confirmed(DataFormatCombination),
    Proceed,
    Exhausted,
}

/// Inputs of one data-format run.
pub(crate) struct SetupParams<'a> {
    pub device: Arc<dyn QmiDevice>,
    pub subsys: PortSubsys,
    pub endpoint: EndpointInfo,
    pub action: SetupAction,
    pub timeouts: &'a PortTimeouts,
    pub cancel: &'a CancellationToken,
    /// Set when the firmware rejects the data format query.
    pub firmware_unsupported: &'a AtomicBool,
}

/// State of one data-format run. Dropping it releases the WDA client.
pub(crate) struct DataFormatSetup<'a> {
    device: Arc<dyn QmiDevice>,
    subsys: PortSubsys,
    action: SetupAction,
    timeouts: &'a PortTimeouts,
    cancel: &'a CancellationToken,
    firmware_unsupported: &'a AtomicBool,

    step: Step,
    cursor: CombinationCursor,
    caps: KernelCapabilities,

    kernel_current: Option<DataFormat>,
    kernel_requested: Option<DataFormat>,

    wda: WdaNegotiator,
    llp_current: Option<LinkLayerProtocol>,
    llp_requested: Option<LinkLayerProtocol>,
}

impl<'a> DataFormatSetup<'a> {
    pub fn new(params: SetupParams<'a>) -> Self {
        let wda = WdaNegotiator::new(
            params.device.clone(),
            params.endpoint,
            params.timeouts.clone(),
        );
        Self {
            device: params.device,
            subsys: params.subsys,
            action: params.action,
            timeouts: params.timeouts,
            cancel: params.cancel,
            firmware_unsupported: params.firmware_unsupported,
            step: Step::Start,
            cursor: CombinationCursor::new(),
            caps: KernelCapabilities::default(),
            kernel_current: None,
            kernel_requested: None,
            wda,
            llp_current: None,
            llp_requested: None,
        }
    }

    /// Drive the run to completion. In query mode the current setup is
    /// returned as found; in apply mode the confirmed combination.
    pub async fn run(mut self) -> Result<DataFormatCombination> {
        loop {
            self.step = match self.step {
                Step::Start => Step::KernelCapabilities,

                Step::KernelCapabilities => {
                    let caps = self.kernel().capabilities().await?;
                    debug!(
                        device = %self.device.path().display(),
                        ieee_802_3 = caps.ieee_802_3,
                        raw_ip = caps.raw_ip,
                        "kernel data format capabilities"
                    );
                    self.caps = caps;
                    Step::KernelFormatCurrent
                }

                Step::KernelFormatCurrent => {
                    if self.kernel_current.is_none() {
                        let current = self.kernel().read_current().await?;
                        self.kernel_current = Some(current);
                    }
                    Step::AllocateWdaClient
                }

                Step::AllocateWdaClient => {
                    if self.cursor.is_first() {
                        self.wda.ensure_client(self.cancel).await?;
                    }
                    Step::WdaFormatCurrent
                }

                Step::WdaFormatCurrent => {
                    if self.llp_current.is_none() {
                        match self.wda.current(self.cancel).await {
                            Ok(llp) => self.llp_current = Some(llp),
                            Err(e) if e.is_cancelled() => return Err(e),
                            Err(e) => {
                                warn!(
                                    device = %self.device.path().display(),
                                    error = %e,
                                    "firmware data format query failed, WDA marked unsupported"
                                );
                                self.firmware_unsupported.store(true, Ordering::SeqCst);
                                return Err(e.context("couldn't load WDA data format"));
                            }
                        }
                    }
                    Step::QueryDone
                }

                Step::QueryDone => {
                    let current = self.current()?;
                    debug!(
                        kernel = %current.kernel,
                        llp = %current.llp,
                        "current data format setup"
                    );
                    if self.action == SetupAction::Query {
                        return Ok(current);
                    }
                    Step::CheckDataFormat
                }

                Step::CheckDataFormat => match self.check() {
                    Check::Confirmed(combination) => return Ok(combination),
                    Check::Proceed => Step::SyncWda,
                    Check::Exhausted => {
                        return Err(Error::Failed(
                            "no more data format combinations supported".into(),
                        ))
                    }
                },

                Step::SyncWda => {
                    if let Some(requested) = self.llp_requested {
                        if self.llp_current != Some(requested) {
                            self.wda
                                .set(self.llp_current, requested, self.cancel)
                                .await?;
                            self.llp_current = None;
                        }
                    }
                    Step::SyncKernel
                }

                Step::SyncKernel => {
                    if let Some(requested) = self.kernel_requested {
                        if self.kernel_current != Some(requested) {
                            self.kernel()
                                .write(self.kernel_current, requested)
                                .await?;
                            self.kernel_current = None;
                        }
                    }
                    // reload whatever was just written
                    Step::KernelFormatCurrent
                }
            };
        }
    }

    fn kernel(&self) -> KernelFormatSync<'_> {
        KernelFormatSync::new(
            &*self.device,
            self.subsys,
            self.timeouts.ctl_query,
            self.cancel,
        )
    }

    fn current(&self) -> Result<DataFormatCombination> {
        match (self.kernel_current, self.llp_current) {
            (Some(kernel), Some(llp)) => Ok(DataFormatCombination::new(kernel, llp)),
            _ => Err(Error::Failed("current data format not loaded".into())),
        }
    }

    fn completed(&self) -> bool {
        self.kernel_current.is_some()
            && self.kernel_current == self.kernel_requested
            && self.llp_current.is_some()
            && self.llp_current == self.llp_requested
    }

    fn check(&mut self) -> Check {
        let first_iteration = self.cursor.is_first();
        if !first_iteration && self.completed() {
            if let Ok(confirmed) = self.current() {
                return Check::Confirmed(confirmed);
            }
        }

        let Some(candidate) = self.cursor.advance(&self.caps) else {
            return Check::Exhausted;
        };
        debug!(
            kernel = %candidate.kernel,
            llp = %candidate.llp,
            "selected data format setup"
        );
        self.kernel_requested = Some(candidate.kernel);
        self.llp_requested = Some(candidate.llp);

        if first_iteration && self.completed() {
            return Check::Confirmed(candidate);
        }
        Check::Proceed
    }
}

//! Firmware link-layer protocol negotiation over the WDA service.
//!
//! A [`WdaNegotiator`] owns one transient WDA client for the duration of a
//! data-format run. The client is released when the negotiator is dropped,
//! whatever the outcome of the run.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::PortTimeouts;
use crate::device::{
    guarded, release_detached, QmiClient, QmiDevice, WdaGetDataFormatInput,
    WdaSetDataFormatInput,
};
use crate::error::{Error, Result};
use crate::types::{EndpointInfo, LinkLayerProtocol, Service};

pub struct WdaNegotiator {
    device: Arc<dyn QmiDevice>,
    client: Option<QmiClient>,
    endpoint: EndpointInfo,
    /// Set once the firmware asked for endpoint info; sticky for the run.
    use_endpoint: bool,
    timeouts: PortTimeouts,
}

impl WdaNegotiator {
    pub fn new(device: Arc<dyn QmiDevice>, endpoint: EndpointInfo, timeouts: PortTimeouts) -> Self {
        Self {
            device,
            client: None,
            endpoint,
            use_endpoint: false,
            timeouts,
        }
    }

    /// Whether requests carry the endpoint-info TLV.
    #[cfg(test)]
    fn uses_endpoint(&self) -> bool {
        self.use_endpoint
    }

    #[cfg(test)]
    fn has_client(&self) -> bool {
        self.client.is_some()
    }

    /// Allocate the WDA client if not done yet.
    pub async fn ensure_client(&mut self, cancel: &CancellationToken) -> Result<()> {
        if self.client.is_some() {
            return Ok(());
        }
        let client = guarded(
            "WDA client allocation",
            self.timeouts.allocate_client,
            cancel,
            self.device.allocate_client(Service::Wda),
        )
        .await
        .map_err(|e| e.context("couldn't create client for service 'wda'"))?;
        debug!(cid = client.cid(), "allocated WDA client");
        self.client = Some(client);
        Ok(())
    }

    /// Query the firmware's current link-layer protocol.
    ///
    /// A missing-argument rejection is retried once with endpoint info when
    /// the endpoint type is known. Every later request of this negotiator
    /// then carries it as well.
    pub async fn current(&mut self, cancel: &CancellationToken) -> Result<LinkLayerProtocol> {
        match self.query(cancel).await {
            Err(e)
                if e.is_missing_argument() && !self.use_endpoint && self.endpoint.is_defined() =>
            {
                debug!(
                    endpoint_type = %self.endpoint.endpoint_type,
                    interface = self.endpoint.interface_number,
                    "firmware requires endpoint info, retrying data format query"
                );
                self.use_endpoint = true;
                self.query(cancel).await
            }
            res => res,
        }
    }

    async fn query(&self, cancel: &CancellationToken) -> Result<LinkLayerProtocol> {
        let client = self.client()?;
        let input = WdaGetDataFormatInput {
            endpoint: self.endpoint_tlv(),
        };
        let output = guarded(
            "WDA get data format",
            self.timeouts.wda_request,
            cancel,
            self.device.wda_get_data_format(client, input),
        )
        .await?;

        // WDA without an LLP TLV in its answer is not something we can work with.
        output.link_layer_protocol.ok_or_else(|| {
            Error::Failed("missing link-layer-protocol field in response".into())
        })
    }

    /// Configure `requested` in the firmware, aggregation disabled. The
    /// caller must re-query the current value afterwards.
    pub async fn set(
        &self,
        current: Option<LinkLayerProtocol>,
        requested: LinkLayerProtocol,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if current != Some(requested) {
            debug!(
                current = current.map(|p| p.as_str()).unwrap_or("unknown"),
                %requested,
                "updating device link layer protocol"
            );
        }
        let client = self.client()?;
        let input = WdaSetDataFormatInput::new(requested).with_endpoint(self.endpoint_tlv());
        guarded(
            "WDA set data format",
            self.timeouts.wda_request,
            cancel,
            self.device.wda_set_data_format(client, input),
        )
        .await
    }

    fn client(&self) -> Result<&QmiClient> {
        self.client
            .as_ref()
            .ok_or_else(|| Error::WrongState("WDA client not allocated".into()))
    }

    fn endpoint_tlv(&self) -> Option<EndpointInfo> {
        self.use_endpoint.then_some(self.endpoint)
    }
}

impl Drop for WdaNegotiator {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            release_detached(self.device.clone(), client, self.timeouts.release_client);
        }
    }
}

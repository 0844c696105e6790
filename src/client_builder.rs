use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::amqp::AmqpEndpoint;
use crate::client::{DeviceClient, DeviceClientConfig};
use crate::token::{DeviceKeyTokenSource, SasTokenSource, TokenSource};
use crate::transport::{Protocol, TransportConfig};

impl DeviceClient {
    /// Get a builder for the device client
    pub fn builder() -> DeviceClientBuilder<DeviceClientBuilderUninitializedHubDetails> {
        DeviceClientBuilder::default()
    }
}

/// Error related to building the client
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DeviceClientBuilderError {
    /// Uninitialized field
    #[error("{0} must be initialized")]
    UninitializedField(&'static str),
    /// Custom validation error
    #[error("{0} failed to validate")]
    ValidationError(&'static str),
    /// Error initializing the client
    #[error("An error occurred initializing the device client {0}")]
    ClientError(String),
}

/// The client builder has no initialized fields and requires the hub name and device id
#[derive(Debug)]
pub struct DeviceClientBuilderUninitializedHubDetails;
/// The client builder has hub and device details and can have the token source initialized
#[derive(Debug)]
pub struct DeviceClientBuilderInitializedHubDetails;
/// The client builder has all fields required to be built
#[derive(Debug)]
pub struct DeviceClientBuilderInitializedTokenSource;

/// Builder object for the device client
#[derive(Debug)]
pub struct DeviceClientBuilder<T> {
    iothub_hostname: Option<String>,
    device_id: Option<String>,
    token_source: Option<Arc<dyn TokenSource>>,
    protocol: Protocol,
    amqp_endpoint: Option<Arc<dyn AmqpEndpoint>>,
    send_period: Option<Duration>,
    receive_period: Option<Duration>,
    token_validity: Option<chrono::Duration>,
    read_timeout: Option<Duration>,
    batch_limit: Option<usize>,
    _phantom: PhantomData<T>,
}

impl Default for DeviceClientBuilder<DeviceClientBuilderUninitializedHubDetails> {
    fn default() -> DeviceClientBuilder<DeviceClientBuilderUninitializedHubDetails> {
        Self {
            iothub_hostname: None,
            device_id: None,
            token_source: None,
            protocol: Protocol::Https,
            amqp_endpoint: None,
            send_period: None,
            receive_period: None,
            token_validity: None,
            read_timeout: None,
            batch_limit: None,
            _phantom: Default::default(),
        }
    }
}

impl<T> DeviceClientBuilder<T> {
    fn into_state<S>(self) -> DeviceClientBuilder<S> {
        DeviceClientBuilder {
            iothub_hostname: self.iothub_hostname,
            device_id: self.device_id,
            token_source: self.token_source,
            protocol: self.protocol,
            amqp_endpoint: self.amqp_endpoint,
            send_period: self.send_period,
            receive_period: self.receive_period,
            token_validity: self.token_validity,
            read_timeout: self.read_timeout,
            batch_limit: self.batch_limit,
            _phantom: Default::default(),
        }
    }
}

impl DeviceClientBuilder<DeviceClientBuilderUninitializedHubDetails> {
    /// Set the values for the IoT hub hostname and device id
    pub fn iothub_details<T>(
        self,
        iothub_hostname: T,
        device_id: T,
    ) -> DeviceClientBuilder<DeviceClientBuilderInitializedHubDetails>
    where
        T: ToString,
    {
        let mut builder = self.into_state();
        builder.iothub_hostname = Some(iothub_hostname.to_string());
        builder.device_id = Some(device_id.to_string());
        builder
    }
}

impl DeviceClientBuilder<DeviceClientBuilderInitializedHubDetails> {
    fn hub_details(&self) -> crate::Result<(&str, &str)> {
        match (&self.iothub_hostname, &self.device_id) {
            (Some(hostname), Some(device_id)) => Ok((hostname, device_id)),
            _ => Err(crate::Error::InvalidArgument(
                "hub details must be set first".to_owned(),
            )),
        }
    }

    /// The device access key
    pub fn access_key<T>(
        self,
        access_key: T,
    ) -> crate::Result<DeviceClientBuilder<DeviceClientBuilderInitializedTokenSource>>
    where
        T: AsRef<str>,
    {
        let (hostname, device_id) = self.hub_details()?;
        let token_source = DeviceKeyTokenSource::new(hostname, device_id, access_key.as_ref())?;
        Ok(self.token_source(Arc::new(token_source)))
    }

    /// A pre-generated shared access signature
    pub fn sas_token<T>(
        self,
        sas: T,
    ) -> crate::Result<DeviceClientBuilder<DeviceClientBuilderInitializedTokenSource>>
    where
        T: AsRef<str>,
    {
        let token_source = SasTokenSource::new(sas.as_ref())?;
        Ok(self.token_source(Arc::new(token_source)))
    }

    /// Any other source of tokens
    pub fn token_source(
        self,
        token_source: Arc<dyn TokenSource>,
    ) -> DeviceClientBuilder<DeviceClientBuilderInitializedTokenSource> {
        let mut builder = self.into_state();
        builder.token_source = Some(token_source);
        builder
    }
}

impl DeviceClientBuilder<DeviceClientBuilderInitializedTokenSource> {
    /// Wire protocol, HTTPS unless set
    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Connection provider for [`Protocol::Amqps`]
    pub fn amqp_endpoint(mut self, endpoint: Arc<dyn AmqpEndpoint>) -> Self {
        self.amqp_endpoint = Some(endpoint);
        self
    }

    ///
    pub fn send_period(mut self, period: Duration) -> Self {
        self.send_period = Some(period);
        self
    }

    ///
    pub fn receive_period(mut self, period: Duration) -> Self {
        self.receive_period = Some(period);
        self
    }

    /// Lifetime of each token minted from an access key
    pub fn token_validity(mut self, validity: chrono::Duration) -> Self {
        self.token_validity = Some(validity);
        self
    }

    ///
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    ///
    pub fn batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = Some(limit);
        self
    }

    /// Validate and assemble the configuration without creating a client
    pub fn build_config(self) -> Result<DeviceClientConfig, DeviceClientBuilderError> {
        let Some(iothub_hostname) = self.iothub_hostname else {
            return Err(DeviceClientBuilderError::UninitializedField(
                "iothub_hostname",
            ));
        };

        let Some(device_id) = self.device_id else {
            return Err(DeviceClientBuilderError::UninitializedField("device_id"));
        };

        let Some(token_source) = self.token_source else {
            return Err(DeviceClientBuilderError::ValidationError(
                "One of `access_key` or `sas_token` must be provided such that the token source can be configured",
            ));
        };

        if self.protocol == Protocol::Amqps && self.amqp_endpoint.is_none() {
            return Err(DeviceClientBuilderError::UninitializedField("amqp_endpoint"));
        }
        if self.batch_limit == Some(0) {
            return Err(DeviceClientBuilderError::ValidationError("batch_limit"));
        }

        let mut transport = TransportConfig::new(&iothub_hostname, &device_id, token_source);
        if let Some(validity) = self.token_validity {
            transport.token_validity = validity;
        }
        if let Some(timeout) = self.read_timeout {
            transport.read_timeout = timeout;
        }
        if let Some(limit) = self.batch_limit {
            transport.batch_limit = limit;
        }

        let mut config = DeviceClientConfig::new(transport, self.protocol);
        config.amqp_endpoint = self.amqp_endpoint;
        if let Some(period) = self.send_period {
            config.send_period = period;
        }
        if let Some(period) = self.receive_period {
            config.receive_period = period;
        }
        Ok(config)
    }

    /// Build the device client
    pub fn build(self) -> Result<DeviceClient, DeviceClientBuilderError> {
        let config = self.build_config()?;
        let client = DeviceClient::from_config(config)
            .map_err(|e| DeviceClientBuilderError::ClientError(format!("{e}")))?;

        Ok(client)
    }
}

//! # IoT Hub AMQP Protocol Agents
//!
//! Protocol agents layered on the [`amqp_link`] framework:
//!
//! - [`CbsAgent`]: claims-based-security token refresh over the `$cbs` node,
//!   with request/response correlation, per-request deadlines, and a single
//!   sweep timer that expires stuck renewals
//! - [`TwinClient`]: the device-twin request/response and desired-property
//!   notification protocol over a channel-correlated link pair
//!
//! ## Basic Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use amqp_link::AmqpClient;
//! use iothub_amqp::{CbsAgent, CbsConfig, TwinClient, TwinConfig};
//!
//! async fn bootstrap(client: Arc<dyn AmqpClient>) -> Result<(), Box<dyn std::error::Error>> {
//!     // Renew the SAS token before opening operational links.
//!     let cbs = CbsAgent::new(Arc::clone(&client), CbsConfig::default());
//!     cbs.attach().await?;
//!     cbs.put_token(
//!         "myhub.azure-devices.net/devices/device-1",
//!         "SharedAccessSignature sr=...",
//!     )
//!     .await?;
//!
//!     // Fetch the full twin document.
//!     let twin = TwinClient::new(client, TwinConfig::new("device-1"));
//!     let mut responses = twin.subscribe_responses().await?;
//!     twin.send_twin_request("GET", "/", &Default::default(), " ")
//!         .await?;
//!     if let Some(response) = responses.recv().await {
//!         println!("twin document: {:?}", response.body);
//!     }
//!     Ok(())
//! }
//! ```

pub mod cbs;
pub mod error;
pub mod twin;

// Re-export main types for convenience
pub use cbs::{CBS_ENDPOINT, CbsAgent, CbsConfig, CbsStats};
pub use error::{CbsError, TwinError};
pub use twin::{
    DesiredPropertyStream, TWIN_API_VERSION, TWIN_RESPONSE_TOPIC, TwinClient, TwinConfig,
    TwinResponse, TwinResponseStream, TwinState,
};

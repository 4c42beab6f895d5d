pub mod connection;
pub mod simulated;

use std::time::Duration;

use thiserror::Error;

use crate::model::{BackfillRow, Packet};
use crate::stream::decode::ValueDecoder;

pub use connection::{ConnectionManager, OpGuard};

/// Errors raised by a base station binding.
///
/// The `Display` text is what retry classification pattern-matches, so
/// device-reported messages are passed through verbatim.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("base station not connected")]
    Disconnected,

    #[error("connect throttled")]
    Throttled,

    #[error("ping failed")]
    PingFailed,

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Device(String),

    #[error("link error: {0}")]
    Link(String),
}

/// Identity and feature list reported by a base station on connect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub model: String,
    pub firmware: String,
    /// Feature names the binding exposes (e.g. "as_float", "datalog").
    pub features: Vec<String>,
}

impl DeviceInfo {
    fn has(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }
}

/// Per-session capability set, resolved once on connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub model: String,
    pub hardware_timestamps: bool,
    pub datalog_download: bool,
    /// Value decoders the device supports, in preference order.
    pub decoders: Vec<ValueDecoder>,
}

impl Capabilities {
    /// Resolves capabilities from what the device advertised.
    ///
    /// A device that advertises no typed getters gets the full default
    /// decoder order. Text parsing is always kept as the last resort.
    pub fn negotiate(info: &DeviceInfo) -> Self {
        let advertised: Vec<ValueDecoder> = ValueDecoder::DEFAULT_ORDER
            .iter()
            .copied()
            .filter(|d| *d != ValueDecoder::ParseText && info.has(d.feature_name()))
            .collect();

        let mut decoders = if advertised.is_empty() {
            ValueDecoder::DEFAULT_ORDER.to_vec()
        } else {
            advertised
        };
        if !decoders.contains(&ValueDecoder::ParseText) {
            decoders.push(ValueDecoder::ParseText);
        }

        Self {
            model: info.model.clone(),
            hardware_timestamps: info.has("timestamp"),
            datalog_download: info.has("datalog"),
            decoders,
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::negotiate(&DeviceInfo::default())
    }
}

/// Hardware binding for one radio base station.
///
/// The link supports a single logical conversation; callers serialize
/// access through [`ConnectionManager`].
pub trait Transport: Send + 'static {
    /// Returns the binding's name for logging.
    fn name(&self) -> &str;

    /// Open the link and identify the device.
    fn connect(
        &mut self,
    ) -> impl std::future::Future<Output = Result<DeviceInfo, TransportError>> + Send;

    /// Check the device still answers.
    fn ping(&mut self) -> impl std::future::Future<Output = Result<bool, TransportError>> + Send;

    /// Wait up to `timeout` for packets.
    fn poll(
        &mut self,
        timeout: Duration,
    ) -> impl std::future::Future<Output = Result<Vec<Packet>, TransportError>> + Send;

    /// Download logged sweeps from a node's storage.
    fn download_historical(
        &mut self,
        node_id: u32,
        session: Option<u32>,
    ) -> impl std::future::Future<Output = Result<Vec<BackfillRow>, TransportError>> + Send;

    /// Close the link.
    fn disconnect(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate_without_features_uses_default_order() {
        let caps = Capabilities::negotiate(&DeviceInfo::default());
        assert_eq!(caps.decoders, ValueDecoder::DEFAULT_ORDER.to_vec());
        assert!(!caps.hardware_timestamps);
        assert!(!caps.datalog_download);
    }

    #[test]
    fn test_negotiate_keeps_advertised_order_and_text_fallback() {
        let info = DeviceInfo {
            model: "WSDA-200".to_string(),
            firmware: "1.0".to_string(),
            features: vec![
                "as_uint16".to_string(),
                "as_float".to_string(),
                "timestamp".to_string(),
                "datalog".to_string(),
            ],
        };
        let caps = Capabilities::negotiate(&info);
        assert_eq!(
            caps.decoders,
            vec![
                ValueDecoder::AsFloat,
                ValueDecoder::AsUint16,
                ValueDecoder::ParseText
            ]
        );
        assert!(caps.hardware_timestamps);
        assert!(caps.datalog_download);
        assert_eq!(caps.model, "WSDA-200");
    }

    #[test]
    fn test_device_error_display_is_verbatim() {
        let err = TransportError::Device("EEPROM read failed".to_string());
        assert_eq!(err.to_string(), "EEPROM read failed");
    }
}

//! Per-point extraction: channel key, scalar value and timestamp.
//!
//! Values are decoded by walking an ordered list of [`ValueDecoder`]
//! strategies until one yields a finite number. The list comes from the
//! negotiated [`Capabilities`](crate::transport::Capabilities), so devices
//! that only expose a subset of typed getters skip the rest.

use crate::model::{now_unix_nanos, DataPoint, RawValue};

/// Prefix of radio diagnostic channels.
pub const DIAGNOSTIC_PREFIX: &str = "diagnostic_";

/// One way of reading a scalar out of a [`RawValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueDecoder {
    AsFloat,
    AsDouble,
    AsInt32,
    AsUint32,
    AsInt16,
    AsUint16,
    AsInt8,
    AsUint8,
    ParseText,
}

impl ValueDecoder {
    /// The default strategy order, narrowest float first.
    pub const DEFAULT_ORDER: [ValueDecoder; 9] = [
        ValueDecoder::AsFloat,
        ValueDecoder::AsDouble,
        ValueDecoder::AsInt32,
        ValueDecoder::AsUint32,
        ValueDecoder::AsInt16,
        ValueDecoder::AsUint16,
        ValueDecoder::AsInt8,
        ValueDecoder::AsUint8,
        ValueDecoder::ParseText,
    ];

    /// Device feature name advertising this getter.
    pub fn feature_name(self) -> &'static str {
        match self {
            Self::AsFloat => "as_float",
            Self::AsDouble => "as_double",
            Self::AsInt32 => "as_int32",
            Self::AsUint32 => "as_uint32",
            Self::AsInt16 => "as_int16",
            Self::AsUint16 => "as_uint16",
            Self::AsInt8 => "as_int8",
            Self::AsUint8 => "as_uint8",
            Self::ParseText => "value",
        }
    }

    /// Attempts this strategy. Non-finite results count as failure.
    pub fn decode(self, raw: &RawValue) -> Option<f64> {
        let v = match (self, raw) {
            (Self::AsFloat, RawValue::Float(v)) => f64::from(*v),
            (Self::AsDouble, RawValue::Double(v)) => *v,
            (Self::AsInt32, RawValue::Int32(v)) => f64::from(*v),
            (Self::AsUint32, RawValue::Uint32(v)) => f64::from(*v),
            (Self::AsInt16, RawValue::Int16(v)) => f64::from(*v),
            (Self::AsUint16, RawValue::Uint16(v)) => f64::from(*v),
            (Self::AsInt8, RawValue::Int8(v)) => f64::from(*v),
            (Self::AsUint8, RawValue::Uint8(v)) => f64::from(*v),
            (Self::ParseText, RawValue::Text(s)) => s.trim().parse::<f64>().ok()?,
            _ => return None,
        };

        v.is_finite().then_some(v)
    }
}

/// Runs `decoders` in order and returns the first successful value.
pub fn decode_value(raw: &RawValue, decoders: &[ValueDecoder]) -> Option<f64> {
    decoders.iter().find_map(|d| d.decode(raw))
}

/// Channel key: explicit name, else `ch{id}`, else `"channel"`.
pub fn channel_key(dp: &DataPoint) -> String {
    match (&dp.channel_name, dp.channel_id) {
        (Some(name), _) if !name.is_empty() => name.clone(),
        (_, Some(id)) => format!("ch{id}"),
        _ => "channel".to_string(),
    }
}

/// Point timestamp in unix ns, falling back to host time.
pub fn point_time_ns(dp: &DataPoint) -> i64 {
    dp.timestamp
        .and_then(|ts| ts.to_unix_nanos())
        .unwrap_or_else(now_unix_nanos)
}

/// Whether the channel is channel 1 under either naming scheme.
pub fn is_channel_1(channel: &str) -> bool {
    channel == "channel_1" || channel == "ch1"
}

/// Whether the channel carries radio diagnostics.
pub fn is_diagnostic(channel: &str) -> bool {
    channel.starts_with(DIAGNOSTIC_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HwTimestamp;

    fn point(name: Option<&str>, id: Option<u8>, value: RawValue) -> DataPoint {
        DataPoint {
            channel_name: name.map(str::to_string),
            channel_id: id,
            value,
            timestamp: None,
        }
    }

    #[test]
    fn test_decode_first_matching_strategy() {
        let order = ValueDecoder::DEFAULT_ORDER;
        assert_eq!(decode_value(&RawValue::Float(1.5), &order), Some(1.5));
        assert_eq!(decode_value(&RawValue::Uint16(65535), &order), Some(65535.0));
        assert_eq!(decode_value(&RawValue::Int8(-3), &order), Some(-3.0));
        assert_eq!(
            decode_value(&RawValue::Text(" 21.25 ".to_string()), &order),
            Some(21.25)
        );
    }

    #[test]
    fn test_decode_all_strategies_fail() {
        let order = ValueDecoder::DEFAULT_ORDER;
        assert_eq!(decode_value(&RawValue::Text("n/a".to_string()), &order), None);
        assert_eq!(decode_value(&RawValue::Double(f64::NAN), &order), None);
        assert_eq!(decode_value(&RawValue::Float(f32::INFINITY), &order), None);
    }

    #[test]
    fn test_decode_restricted_order() {
        let order = [ValueDecoder::AsFloat, ValueDecoder::AsDouble];
        assert_eq!(decode_value(&RawValue::Int32(4), &order), None);
        assert_eq!(decode_value(&RawValue::Double(4.0), &order), Some(4.0));
    }

    #[test]
    fn test_channel_key_fallbacks() {
        assert_eq!(channel_key(&point(Some("ch3"), Some(1), RawValue::Uint8(0))), "ch3");
        assert_eq!(channel_key(&point(Some(""), Some(2), RawValue::Uint8(0))), "ch2");
        assert_eq!(channel_key(&point(None, Some(7), RawValue::Uint8(0))), "ch7");
        assert_eq!(channel_key(&point(None, None, RawValue::Uint8(0))), "channel");
    }

    #[test]
    fn test_point_time_prefers_hardware() {
        let mut dp = point(Some("ch1"), None, RawValue::Float(0.0));
        dp.timestamp = Some(HwTimestamp {
            seconds: 100,
            nanoseconds: 5,
        });
        assert_eq!(point_time_ns(&dp), 100_000_000_005);
    }

    #[test]
    fn test_point_time_falls_back_to_host() {
        let mut dp = point(Some("ch1"), None, RawValue::Float(0.0));
        dp.timestamp = Some(HwTimestamp {
            seconds: 0,
            nanoseconds: 0,
        });
        let before = now_unix_nanos();
        let ts = point_time_ns(&dp);
        assert!(ts >= before);
    }

    #[test]
    fn test_channel_predicates() {
        assert!(is_channel_1("ch1"));
        assert!(is_channel_1("channel_1"));
        assert!(!is_channel_1("ch10"));
        assert!(is_diagnostic("diagnostic_state"));
        assert!(!is_diagnostic("ch1"));
    }
}

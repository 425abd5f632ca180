//! Maps `Box<dyn Error>` from trait boundaries to typed `CoreError`.
//!
//! The traits in `biosense_traits` use `Box<dyn Error + Send + Sync>`; this
//! module converts those to our typed error enum, with an optional
//! feature-gated path for `biosense_hardware::HwError` downcasting.

use crate::error::CoreError;

/// Map a trait-boundary error to a typed `CoreError`.
///
/// Attempts to downcast known hardware error types first, then falls back
/// to string-based heuristics.
pub fn map_hw_error(e: &(dyn std::error::Error + 'static)) -> CoreError {
    #[cfg(feature = "hardware-errors")]
    {
        use biosense_hardware::error::HwError;
        if let Some(hw) = e.downcast_ref::<HwError>() {
            return match hw {
                HwError::Timeout => CoreError::Timeout,
                HwError::NotConfigured => CoreError::State(hw.to_string()),
                other => CoreError::HardwareFault(other.to_string()),
            };
        }
    }

    let s = e.to_string();
    if s.to_lowercase().contains("timeout") {
        CoreError::Timeout
    } else {
        CoreError::Hardware(s)
    }
}

/// Convenience for `map_err` on boxed trait errors.
pub(crate) fn to_report(e: biosense_traits::BoxError) -> eyre::Report {
    eyre::Report::new(map_hw_error(e.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_text_maps_to_timeout() {
        let e = std::io::Error::other("ADC timeout after 150 ms");
        assert!(matches!(map_hw_error(&e), CoreError::Timeout));
    }

    #[test]
    fn other_text_maps_to_hardware() {
        let e = std::io::Error::other("bus glitch");
        match map_hw_error(&e) {
            CoreError::Hardware(msg) => assert!(msg.contains("bus glitch")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[cfg(feature = "hardware-errors")]
    #[test]
    fn hw_error_downcasts_precisely() {
        use biosense_hardware::error::HwError;
        assert!(matches!(map_hw_error(&HwError::Timeout), CoreError::Timeout));
        assert!(matches!(
            map_hw_error(&HwError::NotConnected),
            CoreError::HardwareFault(_)
        ));
        assert!(matches!(
            map_hw_error(&HwError::NotConfigured),
            CoreError::State(_)
        ));
    }
}

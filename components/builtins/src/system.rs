//! System module methods

use std::time::{SystemTime, UNIX_EPOCH};

/// System module: process and clock access
pub struct SystemLib;

impl SystemLib {
    /// System.time() - whole seconds since the epoch
    pub fn time() -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as f64)
            .unwrap_or(0.0)
    }

    /// System.clock() - seconds since the epoch with sub-second precision
    pub fn clock() -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    /// System.platform()
    pub fn platform() -> &'static str {
        std::env::consts::OS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_is_positive() {
        assert!(SystemLib::time() > 0.0);
        assert!(SystemLib::clock() >= SystemLib::time());
    }

    #[test]
    fn test_platform_nonempty() {
        assert!(!SystemLib::platform().is_empty());
    }
}

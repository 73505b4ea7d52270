//! Discovery readiness signal

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Ready once a discovery pass completed without a failed directory scan
#[derive(Debug, Default)]
pub struct Readiness {
    ready: AtomicBool,
}

impl Readiness {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Health-check form of [`Readiness::is_ready`]
    pub fn check(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(Error::Internal(
                "last discovery pass failed or has not run yet".into(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_transitions() {
        let readiness = Readiness::new();
        assert!(!readiness.is_ready());
        assert!(readiness.check().is_err());

        readiness.set(true);
        assert!(readiness.check().is_ok());

        readiness.set(false);
        assert!(!readiness.is_ready());
    }
}

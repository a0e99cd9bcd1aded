//! Scripted [`HealthProbe`] implementations.

use parking_lot::Mutex;
use staffetta::HealthProbe;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

/// A probe whose verdict per endpoint is flipped from the test body.
/// Endpoints without an explicit entry use the default verdict.
#[derive(Clone)]
pub struct ScriptedProbe {
    verdicts: Arc<Mutex<HashMap<SocketAddr, bool>>>,
    default_verdict: bool,
}

impl ScriptedProbe {
    /// Every endpoint passes its checks until told otherwise.
    pub fn passing() -> Self {
        Self {
            verdicts: Arc::new(Mutex::new(HashMap::new())),
            default_verdict: true,
        }
    }

    /// Every endpoint fails its checks until told otherwise.
    pub fn failing() -> Self {
        Self {
            verdicts: Arc::new(Mutex::new(HashMap::new())),
            default_verdict: false,
        }
    }

    pub fn set(&self, addr: SocketAddr, passes: bool) {
        self.verdicts.lock().insert(addr, passes);
    }
}

#[async_trait::async_trait]
impl HealthProbe for ScriptedProbe {
    async fn check(&self, addr: SocketAddr) -> Result<(), anyhow::Error> {
        let passes = self
            .verdicts
            .lock()
            .get(&addr)
            .copied()
            .unwrap_or(self.default_verdict);
        if passes {
            Ok(())
        } else {
            anyhow::bail!("scripted check failure for {addr}")
        }
    }
}

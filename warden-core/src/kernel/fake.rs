use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use super::{KernelLoader, LoadError, ProbeHandle};

/// Deterministic loader for tests and demos.
///
/// Outcomes are scripted per object-bytes; everything else attaches
/// successfully with sequentially numbered handles.
#[derive(Default)]
pub struct FakeKernelLoader {
    next_handle: AtomicU64,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    scripted_failures: HashMap<Vec<u8>, LoadError>,
    attached: HashSet<ProbeHandle>,
    detach_fails: bool,
    attach_log: Vec<ProbeHandle>,
    detach_log: Vec<ProbeHandle>,
}

impl fmt::Debug for FakeKernelLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("FakeKernelLoader")
            .field("attached", &state.attached.len())
            .field("scripted_failures", &state.scripted_failures.len())
            .finish()
    }
}

impl FakeKernelLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script `error` for any attach of exactly these object bytes.
    pub fn fail_attach(&self, object: &[u8], error: LoadError) {
        self.lock().scripted_failures.insert(object.to_vec(), error);
    }

    pub fn clear_attach_failure(&self, object: &[u8]) {
        self.lock().scripted_failures.remove(object);
    }

    /// Make every subsequent detach fail (wedge simulation).
    pub fn set_detach_fails(&self, fails: bool) {
        self.lock().detach_fails = fails;
    }

    pub fn attached_handles(&self) -> Vec<ProbeHandle> {
        let mut handles: Vec<_> = self.lock().attached.iter().copied().collect();
        handles.sort_by_key(|h| h.0);
        handles
    }

    pub fn attach_count(&self) -> usize {
        self.lock().attach_log.len()
    }

    pub fn detach_count(&self) -> usize {
        self.lock().detach_log.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

#[async_trait]
impl KernelLoader for FakeKernelLoader {
    async fn attach(
        &self,
        object: &[u8],
        _params: &serde_json::Value,
    ) -> Result<ProbeHandle, LoadError> {
        let mut state = self.lock();
        if let Some(error) = state.scripted_failures.get(object) {
            return Err(error.clone());
        }
        let handle = ProbeHandle(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1);
        state.attached.insert(handle);
        state.attach_log.push(handle);
        Ok(handle)
    }

    async fn detach(&self, handle: ProbeHandle) -> Result<(), LoadError> {
        let mut state = self.lock();
        if state.detach_fails {
            return Err(LoadError::Io("scripted detach failure".into()));
        }
        if !state.attached.remove(&handle) {
            return Err(LoadError::UnknownHandle(handle));
        }
        state.detach_log.push(handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn attach_detach_round_trip() {
        let loader = FakeKernelLoader::new();
        let handle = loader
            .attach(b"obj", &serde_json::Value::Null)
            .await
            .expect("attach");
        assert_eq!(loader.attached_handles(), vec![handle]);
        loader.detach(handle).await.expect("detach");
        assert!(loader.attached_handles().is_empty());
    }

    #[tokio::test]
    async fn scripted_verifier_rejection() {
        let loader = FakeKernelLoader::new();
        loader.fail_attach(
            b"bad",
            LoadError::VerifierRejected {
                diagnostic: "R1 invalid mem access".into(),
            },
        );
        let err = loader
            .attach(b"bad", &serde_json::Value::Null)
            .await
            .expect_err("must fail");
        assert_eq!(err.verifier_diagnostic(), Some("R1 invalid mem access"));
        // Other objects still load.
        loader
            .attach(b"good", &serde_json::Value::Null)
            .await
            .expect("attach");
    }

    #[tokio::test]
    async fn double_detach_reports_unknown_handle() {
        let loader = FakeKernelLoader::new();
        let handle = loader
            .attach(b"obj", &serde_json::Value::Null)
            .await
            .expect("attach");
        loader.detach(handle).await.expect("detach");
        assert!(matches!(
            loader.detach(handle).await,
            Err(LoadError::UnknownHandle(_))
        ));
    }
}

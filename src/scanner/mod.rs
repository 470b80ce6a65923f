use crate::crd::Vulnerability;
use crate::image_reference::ImageReference;
use crate::registry_auth::AuthContext;
use std::future::Future;
use std::sync::Arc;

pub mod trivy;

pub use trivy::Trivy;

/// Scans one content addressed image. Implementations try the auth contexts in order and
/// return the result of the first one that works, or an error covering every attempt.
pub trait Scanner: Send + Sync + 'static {
    fn scan(
        &self,
        image: &ImageReference,
        auths: &[AuthContext],
    ) -> impl Future<Output = anyhow::Result<Vec<Vulnerability>>> + Send;
}

impl<T: Scanner> Scanner for Arc<T> {
    fn scan(
        &self,
        image: &ImageReference,
        auths: &[AuthContext],
    ) -> impl Future<Output = anyhow::Result<Vec<Vulnerability>>> + Send {
        (**self).scan(image, auths)
    }
}

#[cfg(test)]
pub mod scripted {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays queued outcomes; once the script runs out every scan succeeds with no findings.
    #[derive(Default)]
    pub struct ScriptedScanner {
        outcomes: Mutex<VecDeque<Result<Vec<Vulnerability>, String>>>,
        pub calls: AtomicUsize,
        pub scanned: Mutex<Vec<String>>,
    }

    impl ScriptedScanner {
        pub fn push_ok(&self, vulnerabilities: Vec<Vulnerability>) {
            self.outcomes.lock().unwrap().push_back(Ok(vulnerabilities));
        }

        pub fn push_err(&self, error: &str) {
            self.outcomes
                .lock()
                .unwrap()
                .push_back(Err(error.to_string()));
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Scanner for ScriptedScanner {
        async fn scan(
            &self,
            image: &ImageReference,
            _auths: &[AuthContext],
        ) -> anyhow::Result<Vec<Vulnerability>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.scanned.lock().unwrap().push(image.to_string());
            let outcome = self.outcomes.lock().unwrap().pop_front();
            match outcome {
                Some(Ok(vulnerabilities)) => Ok(vulnerabilities),
                Some(Err(e)) => Err(anyhow::anyhow!(e)),
                None => Ok(Vec::new()),
            }
        }
    }
}

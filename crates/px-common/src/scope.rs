//! Ordered teardown of reversibly acquired host resources.
//!
//! Every acquisition that modifies external state pushes a matching release
//! action here; one `unwind` call pops and runs them in reverse order, from
//! every exit path, and aggregates whatever could not be released.

use std::future::Future;
use std::pin::Pin;

use tracing::{debug, error, warn};

use crate::error::{Result, TeardownError};

type ReleaseFuture = Pin<Box<dyn Future<Output = Result<()>>>>;

/// A stack of named release actions, run in reverse acquisition order.
pub struct ReleaseStack {
    actions: Vec<(String, ReleaseFuture)>,
}

impl ReleaseStack {
    pub fn new() -> Self {
        Self {
            actions: Vec::new(),
        }
    }

    /// Register the release action for a resource that was just acquired.
    ///
    /// The future owns whatever state it needs to undo the acquisition; it is
    /// not polled until `unwind` reaches it.
    pub fn push(
        &mut self,
        resource: impl Into<String>,
        release: impl Future<Output = Result<()>> + 'static,
    ) {
        self.actions.push((resource.into(), Box::pin(release)));
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Release everything acquired so far, most recent first.
    ///
    /// A failed release never stops the remaining ones; all failures are
    /// collected into a single [`TeardownError`] surfaced after the full
    /// reverse pass completes.
    pub async fn unwind(&mut self) -> std::result::Result<(), TeardownError> {
        let mut failures = Vec::new();
        while let Some((resource, release)) = self.actions.pop() {
            debug!("releasing {resource}");
            if let Err(e) = release.await {
                error!("failed to release {resource}: {e}");
                failures.push((resource, e.to_string()));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(TeardownError::new(failures))
        }
    }
}

impl Default for ReleaseStack {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ReleaseStack {
    fn drop(&mut self) {
        if !self.actions.is_empty() {
            warn!(
                "release stack dropped with {} action(s) never run",
                self.actions.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::error::Error;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) + Clone) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_c = log.clone();
        (log, move |entry| log_c.lock().unwrap().push(entry))
    }

    #[tokio::test]
    async fn test_unwind_runs_in_reverse_order() {
        let (log, record) = recorder();
        let mut stack = ReleaseStack::new();
        for name in ["first", "second", "third"] {
            let record = record.clone();
            stack.push(name, async move {
                record(name);
                Ok(())
            });
        }

        stack.unwind().await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["third", "second", "first"]);
        assert!(stack.is_empty());
    }

    #[tokio::test]
    async fn test_unwind_continues_past_failures() {
        let (log, record) = recorder();
        let mut stack = ReleaseStack::new();

        let r = record.clone();
        stack.push("outer", async move {
            r("outer");
            Ok(())
        });
        stack.push("middle", async move {
            Err(Error::RuleApplication("iptables exploded".into()))
        });
        let r = record.clone();
        stack.push("inner", async move {
            r("inner");
            Ok(())
        });

        let err = stack.unwind().await.unwrap_err();

        // Both healthy releases ran despite the failure between them.
        assert_eq!(*log.lock().unwrap(), vec!["inner", "outer"]);
        assert_eq!(err.failures().len(), 1);
        assert_eq!(err.failures()[0].0, "middle");
    }

    #[tokio::test]
    async fn test_unwind_aggregates_all_failures() {
        let mut stack = ReleaseStack::new();
        for name in ["a", "b"] {
            stack.push(name, async move { Err(Error::Lookup(format!("{name} gone"))) });
        }

        let err = stack.unwind().await.unwrap_err();
        let resources: Vec<_> = err.failures().iter().map(|(r, _)| r.as_str()).collect();
        assert_eq!(resources, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_unwind_on_empty_stack_is_ok() {
        let mut stack = ReleaseStack::new();
        assert!(stack.unwind().await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_acquisition_releases_only_what_was_acquired() {
        let (log, record) = recorder();
        let mut stack = ReleaseStack::new();

        // Two acquisitions succeed, the third fails before it can register
        // a release action; unwinding covers exactly the first two,
        // most recent first.
        for name in ["interface address", "masquerade rules"] {
            let record = record.clone();
            stack.push(name, async move {
                record(name);
                Ok(())
            });
        }
        let acquisition: Result<()> = Err(Error::Launch {
            command: "dnsmasq".into(),
            reason: "not found in PATH".into(),
        });
        assert!(acquisition.is_err());

        stack.unwind().await.unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["masquerade rules", "interface address"]
        );
    }
}

//! The sync engine: push collection and the two-phase pull state machine.

use crate::error::{SyncError, SyncResult};
use crate::options::AuthCallback;
use crate::transport::{Puller, Pusher};
use parking_lot::RwLock;
use replikv_core::{CommitHash, Store};
use replikv_protocol::{PullRequest, PushRequest, PULL_VERSION, PUSH_VERSION};
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Maximum reauthentication attempts per sync cycle.
const MAX_REAUTH_ATTEMPTS: u32 = 8;

/// Outcome of the first pull phase.
#[derive(Debug, Clone)]
pub struct BeginPullResult {
    /// Request identifier, for correlating logs.
    pub request_id: String,
    /// Head of the sync branch, or `None` when there was nothing to do.
    pub sync_head: Option<CommitHash>,
}

/// Per-direction endpoint and credential configuration.
pub(crate) struct Endpoint {
    pub(crate) url: String,
    pub(crate) auth: RwLock<Option<String>>,
    pub(crate) get_auth: Option<AuthCallback>,
}

impl Endpoint {
    pub(crate) fn new(
        url: String,
        auth: Option<String>,
        get_auth: Option<AuthCallback>,
    ) -> Self {
        Self {
            url,
            auth: RwLock::new(auth),
            get_auth,
        }
    }

    fn is_configured(&self) -> bool {
        !self.url.is_empty()
    }
}

/// Drives pushes and pulls for one store.
///
/// Each direction is serial; the two directions may run concurrently from
/// their connection loops.
pub struct SyncEngine {
    store: Store,
    puller: Arc<dyn Puller>,
    pusher: Arc<dyn Pusher>,
    pull_endpoint: Endpoint,
    push_endpoint: Endpoint,
    schema_version: String,
}

impl SyncEngine {
    /// Creates an engine over `store` and the given transports.
    pub fn new(
        store: Store,
        puller: Arc<dyn Puller>,
        pusher: Arc<dyn Pusher>,
        pull_endpoint_url: impl Into<String>,
        push_endpoint_url: impl Into<String>,
        schema_version: impl Into<String>,
    ) -> Self {
        Self {
            store,
            puller,
            pusher,
            pull_endpoint: Endpoint::new(pull_endpoint_url.into(), None, None),
            push_endpoint: Endpoint::new(push_endpoint_url.into(), None, None),
            schema_version: schema_version.into(),
        }
    }

    /// Seeds the pull credential and its refresh callback.
    pub fn set_pull_auth(&mut self, auth: Option<String>, get_auth: Option<AuthCallback>) {
        self.pull_endpoint = Endpoint::new(self.pull_endpoint.url.clone(), auth, get_auth);
    }

    /// Seeds the push credential and its refresh callback.
    pub fn set_push_auth(&mut self, auth: Option<String>, get_auth: Option<AuthCallback>) {
        self.push_endpoint = Endpoint::new(self.push_endpoint.url.clone(), auth, get_auth);
    }

    /// Returns the store this engine syncs.
    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Runs one full pull cycle. A no-op when no pull endpoint is
    /// configured.
    pub fn pull(&self) -> SyncResult<()> {
        if !self.pull_endpoint.is_configured() {
            return Ok(());
        }
        let result = self.begin_pull()?;
        self.maybe_end_pull(&result)?;
        Ok(())
    }

    /// First pull phase: request the patch, build the sync branch, replay
    /// pending mutations on it.
    pub fn begin_pull(&self) -> SyncResult<BeginPullResult> {
        if !self.pull_endpoint.is_configured() {
            return Err(SyncError::protocol("no pull endpoint configured"));
        }

        let request_id = Uuid::new_v4().to_string();
        let info = self.store.pull_info()?;
        let request = PullRequest {
            client_id: self.store.client_id().to_string(),
            base_state_id: info.base_state_id.to_hex(),
            cookie: info.cookie.clone(),
            last_mutation_id: info.last_mutation_id,
            pull_version: PULL_VERSION,
            schema_version: self.schema_version.clone(),
        };

        let response = with_reauth(&self.pull_endpoint, |auth| {
            self.puller.pull(&request, auth)
        })?;

        if response.last_mutation_id < info.last_mutation_id {
            return Err(SyncError::protocol(format!(
                "pull lastMutationID regressed from {} to {}",
                info.last_mutation_id, response.last_mutation_id
            )));
        }

        // Nothing to apply and nothing newly acknowledged: no sync branch.
        if response.patch.is_empty()
            && response.last_mutation_id == info.last_mutation_id
            && response.cookie == info.cookie
        {
            debug!(request_id, "pull had nothing to do");
            return Ok(BeginPullResult {
                request_id,
                sync_head: None,
            });
        }

        let sync_head =
            self.store
                .begin_sync(response.cookie, response.last_mutation_id, &response.patch)?;
        debug!(request_id, sync_head = %sync_head, patch_len = response.patch.len(), "pull applied");

        Ok(BeginPullResult {
            request_id,
            sync_head: Some(sync_head),
        })
    }

    /// Second pull phase: fold the sync branch into the main head. A no-op
    /// when `begin_pull` had nothing to do.
    pub fn maybe_end_pull(&self, result: &BeginPullResult) -> SyncResult<Option<CommitHash>> {
        let Some(sync_head) = result.sync_head else {
            return Ok(None);
        };
        let new_head = self.store.end_sync(sync_head)?;
        debug!(request_id = %result.request_id, head = %new_head, "pull finished");
        Ok(Some(new_head))
    }

    /// Pushes all pending mutations in one batch. A no-op when no push
    /// endpoint is configured or nothing is pending.
    pub fn push(&self) -> SyncResult<()> {
        if !self.push_endpoint.is_configured() {
            return Ok(());
        }

        let mutations = self.store.pending_mutations()?;
        if mutations.is_empty() {
            debug!("nothing to push");
            return Ok(());
        }

        let request = PushRequest {
            client_id: self.store.client_id().to_string(),
            mutations,
            push_version: PUSH_VERSION,
            schema_version: self.schema_version.clone(),
        };
        let count = request.mutations.len();

        let response = with_reauth(&self.push_endpoint, |auth| {
            self.pusher.push(&request, auth)
        })?;

        // Advisory only: mutations stay pending until a pull acknowledges
        // them.
        for mutation_info in &response.mutation_infos {
            if let Some(message) = &mutation_info.error {
                info!(
                    mutation_id = mutation_info.id,
                    error = %message,
                    "server reported mutation error"
                );
            }
        }
        debug!(count, "push complete");
        Ok(())
    }
}

/// Runs `call`, refreshing the endpoint credential on 401 up to
/// [`MAX_REAUTH_ATTEMPTS`] times.
fn with_reauth<T>(
    endpoint: &Endpoint,
    call: impl Fn(Option<&str>) -> SyncResult<T>,
) -> SyncResult<T> {
    let mut reauths = 0u32;
    loop {
        let auth = endpoint.auth.read().clone();
        match call(auth.as_deref()) {
            Err(SyncError::Unauthorized) => {
                reauths += 1;
                if reauths > MAX_REAUTH_ATTEMPTS {
                    error!("Tried to reauthenticate too many times");
                    return Err(SyncError::ReauthLimit);
                }
                let Some(get_auth) = &endpoint.get_auth else {
                    return Err(SyncError::Unauthorized);
                };
                match get_auth() {
                    Some(fresh) => {
                        debug!("credential refreshed after 401");
                        *endpoint.auth.write() = Some(fresh);
                    }
                    None => return Err(SyncError::Unauthorized),
                }
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn endpoint_with_auth(calls: Arc<AtomicU32>) -> Endpoint {
        Endpoint::new(
            "https://example.com/pull".into(),
            None,
            Some(Arc::new(move || {
                calls.fetch_add(1, Ordering::SeqCst);
                Some("fresh".to_string())
            })),
        )
    }

    #[test]
    fn reauth_retries_with_fresh_credential() {
        let calls = Arc::new(AtomicU32::new(0));
        let endpoint = endpoint_with_auth(Arc::clone(&calls));

        let result = with_reauth(&endpoint, |auth| match auth {
            Some("fresh") => Ok(42),
            _ => Err(SyncError::Unauthorized),
        });

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(endpoint.auth.read().as_deref(), Some("fresh"));
    }

    #[test]
    fn reauth_gives_up_after_limit() {
        let calls = Arc::new(AtomicU32::new(0));
        let endpoint = endpoint_with_auth(Arc::clone(&calls));

        let result: SyncResult<()> =
            with_reauth(&endpoint, |_| Err(SyncError::Unauthorized));
        assert!(matches!(result, Err(SyncError::ReauthLimit)));
        assert_eq!(calls.load(Ordering::SeqCst), MAX_REAUTH_ATTEMPTS);
    }

    #[test]
    fn reauth_without_callback_surfaces_unauthorized() {
        let endpoint = Endpoint::new("https://example.com".into(), None, None);
        let result: SyncResult<()> =
            with_reauth(&endpoint, |_| Err(SyncError::Unauthorized));
        assert!(matches!(result, Err(SyncError::Unauthorized)));
    }

    #[test]
    fn reauth_callback_returning_none_stops() {
        let endpoint = Endpoint::new(
            "https://example.com".into(),
            Some("stale".into()),
            Some(Arc::new(|| None)),
        );
        let result: SyncResult<()> =
            with_reauth(&endpoint, |_| Err(SyncError::Unauthorized));
        assert!(matches!(result, Err(SyncError::Unauthorized)));
    }
}

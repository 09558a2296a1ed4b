use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::StreamError;
use crate::profile::Profile;
use crate::rtsp::{MediaDescription, StreamKey, StreamRequest};

use super::{PublisherId, SessionContext, StreamSession};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub key: String,
    pub profile: Profile,
    pub video_id: String,
    pub offset: f64,
    pub ready: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
struct RegistryMaps {
    streams: HashMap<StreamKey, Arc<StreamSession>>,
    publishers: HashMap<PublisherId, Arc<StreamSession>>,
}

/// Key and publisher indexes over live stream sessions. The lock only guards
/// map operations; session teardown runs after it is released.
#[derive(Debug)]
pub struct SessionRegistry {
    context: Arc<SessionContext>,
    maps: Mutex<RegistryMaps>,
}

impl std::fmt::Debug for RegistryMaps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryMaps")
            .field("streams", &self.streams.len())
            .field("publishers", &self.publishers.len())
            .finish()
    }
}

impl SessionRegistry {
    pub fn new(context: SessionContext) -> Arc<Self> {
        Arc::new(Self {
            context: Arc::new(context),
            maps: Mutex::new(RegistryMaps::default()),
        })
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    fn lock(&self) -> MutexGuard<'_, RegistryMaps> {
        self.maps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &StreamKey) -> Option<Arc<StreamSession>> {
        self.lock().streams.get(key).cloned()
    }

    /// Returns the session for `request.key`, creating it atomically.
    pub fn get_or_create(self: &Arc<Self>, request: &StreamRequest) -> Arc<StreamSession> {
        let mut maps = self.lock();
        if let Some(existing) = maps.streams.get(&request.key) {
            return Arc::clone(existing);
        }
        let session = Arc::new(StreamSession::new(
            request,
            Arc::clone(&self.context),
            Arc::downgrade(self),
        ));
        maps.streams
            .insert(request.key.clone(), Arc::clone(&session));
        debug!(key = %request.key, "created stream session");
        session
    }

    /// Attaches `publisher` to `session` and indexes it in one step under the
    /// registry lock, so a concurrent `remove` cannot leave a stale binding.
    pub fn attach_publisher(
        &self,
        publisher: PublisherId,
        session: &Arc<StreamSession>,
        description: MediaDescription,
    ) -> Result<(), StreamError> {
        let mut maps = self.lock();
        let registered = maps
            .streams
            .get(session.key())
            .map(|current| Arc::ptr_eq(current, session))
            .unwrap_or(false);
        if !registered {
            return Err(StreamError::Closed);
        }
        session.attach_publisher(publisher, description)?;
        maps.publishers.insert(publisher, Arc::clone(session));
        Ok(())
    }

    pub fn unbind_publisher(&self, publisher: PublisherId) -> Option<Arc<StreamSession>> {
        self.lock().publishers.remove(&publisher)
    }

    pub fn session_by_publisher(&self, publisher: PublisherId) -> Option<Arc<StreamSession>> {
        self.lock().publishers.get(&publisher).cloned()
    }

    /// Drops both index entries for `session` and shuts it down.
    pub fn remove(&self, session: &Arc<StreamSession>) {
        {
            let mut maps = self.lock();
            let owned = maps
                .streams
                .get(session.key())
                .map(|current| Arc::ptr_eq(current, session))
                .unwrap_or(false);
            if owned {
                maps.streams.remove(session.key());
            }
            maps.publishers
                .retain(|_, bound| !Arc::ptr_eq(bound, session));
        }
        info!(key = %session.key(), "removed stream session");
        session.shutdown();
    }

    /// Tears down the session a closing publisher was feeding, if any.
    pub fn close_publisher(&self, publisher: PublisherId) -> bool {
        match self.session_by_publisher(publisher) {
            Some(session) => {
                self.remove(&session);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let sessions: Vec<Arc<StreamSession>> = self.lock().streams.values().cloned().collect();
        let mut snapshot: Vec<SessionSnapshot> =
            sessions.iter().map(|session| session.snapshot()).collect();
        snapshot.sort_by(|a, b| a.key.cmp(&b.key));
        snapshot
    }

    pub fn shutdown_all(&self) {
        let sessions: Vec<Arc<StreamSession>> = {
            let mut maps = self.lock();
            maps.publishers.clear();
            maps.streams.drain().map(|(_, session)| session).collect()
        };
        for session in sessions {
            session.shutdown();
        }
    }
}

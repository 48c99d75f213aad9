use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, warn};

use parley_types::events::AuthEvent;
use parley_types::models::{Profile, Session};

use crate::backend::{Backend, BackendResult};
use crate::config::SyncConfig;
use crate::directory::Directory;
use crate::error::AuthError;
use crate::handoff::PeerHandoff;
use crate::sync::{Applied, Synchronizer};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    /// `start` has not completed yet.
    Loading,
    /// No session; only password sign-in is offered.
    Unauthenticated,
    Authenticated(Session),
}

/// Something the client may want to redraw for.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Auth(AuthEvent),
    Conversation(Applied),
}

/// Top-level client state: who is signed in, who they can talk to, and the
/// open conversation.
pub struct ChatSession {
    backend: Arc<dyn Backend>,
    config: SyncConfig,
    handoff: Option<PeerHandoff>,
    auth_events: broadcast::Receiver<AuthEvent>,
    state: AuthState,
    directory: Directory,
    conversation: Option<Synchronizer>,
    pending_peer: Option<Profile>,
}

impl ChatSession {
    pub fn new(backend: Arc<dyn Backend>, config: SyncConfig) -> Self {
        let auth_events = backend.subscribe();
        Self {
            backend,
            config,
            handoff: None,
            auth_events,
            state: AuthState::Loading,
            directory: Directory::default(),
            conversation: None,
            pending_peer: None,
        }
    }

    pub fn with_handoff(mut self, handoff: PeerHandoff) -> Self {
        self.handoff = Some(handoff);
        self
    }

    /// Pick up any handed-off peer, then restore the current session.
    pub async fn start(&mut self) -> BackendResult<()> {
        if let Some(handoff) = &self.handoff {
            match handoff.take().await {
                Ok(peer) => self.pending_peer = peer,
                Err(e) => warn!("Ignoring hand-off entry: {}", e),
            }
        }

        match self.backend.current_session().await? {
            Some(session) => self.establish(session).await,
            None => {
                info!("No session, sign-in required");
                self.state = AuthState::Unauthenticated;
            }
        }
        Ok(())
    }

    pub async fn sign_in(&mut self, email: &str, password: &str) -> Result<(), AuthError> {
        let session = self.backend.sign_in_with_password(email, password).await?;
        self.establish(session).await;
        Ok(())
    }

    pub async fn sign_out(&mut self) -> BackendResult<()> {
        self.backend.sign_out().await?;
        self.clear();
        Ok(())
    }

    /// Wait for the next auth event and apply it. Lagged events are skipped;
    /// only the latest session matters.
    pub async fn next_auth_event(&mut self) -> Option<AuthEvent> {
        loop {
            match self.auth_events.recv().await {
                Ok(event) => {
                    self.handle_auth_event(event.clone()).await;
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Skipped {} auth events", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Wait for whichever comes first: an auth event or a conversation
    /// update. Both are applied before returning. `None` once the auth
    /// event source has closed.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        enum Next {
            Auth(Result<AuthEvent, broadcast::error::RecvError>),
            Conversation(Applied),
        }

        loop {
            let next = tokio::select! {
                event = self.auth_events.recv() => Next::Auth(event),
                applied = next_applied(&mut self.conversation) => Next::Conversation(applied),
            };

            match next {
                Next::Auth(Ok(event)) => {
                    self.handle_auth_event(event.clone()).await;
                    return Some(SessionEvent::Auth(event));
                }
                Next::Auth(Err(broadcast::error::RecvError::Lagged(n))) => {
                    warn!("Skipped {} auth events", n);
                }
                Next::Auth(Err(broadcast::error::RecvError::Closed)) => return None,
                Next::Conversation(applied) => return Some(SessionEvent::Conversation(applied)),
            }
        }
    }

    pub async fn handle_auth_event(&mut self, event: AuthEvent) {
        match event {
            AuthEvent::SignedIn(session) | AuthEvent::TokenRefreshed(session) => {
                self.establish(session).await;
            }
            AuthEvent::SignedOut => self.clear(),
        }
    }

    /// Adopt `session`. The same user only gets the new token; a different
    /// user gets a fresh directory and conversation.
    async fn establish(&mut self, session: Session) {
        if let AuthState::Authenticated(current) = &self.state {
            if current.user.id == session.user.id {
                self.state = AuthState::Authenticated(session);
                return;
            }
        }

        let user_id = session.user_id();
        info!("Signed in as {}", user_id);
        self.conversation = None;
        self.state = AuthState::Authenticated(session);
        self.directory = Directory::load(self.backend.as_ref(), user_id).await;

        let mut sync = Synchronizer::new(self.backend.clone(), user_id, self.config.clone());
        if let Some(peer) = self.pending_peer.take() {
            sync.select_peer(peer).await;
        }
        self.conversation = Some(sync);
    }

    fn clear(&mut self) {
        if matches!(self.state, AuthState::Authenticated(_)) {
            info!("Signed out");
        }
        self.conversation = None;
        self.directory = Directory::default();
        self.state = AuthState::Unauthenticated;
    }

    pub fn state(&self) -> &AuthState {
        &self.state
    }

    pub fn session(&self) -> Option<&Session> {
        match &self.state {
            AuthState::Authenticated(session) => Some(session),
            _ => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.session().is_some()
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn search(&self, term: &str) -> Vec<&Profile> {
        self.directory.search(term)
    }

    pub fn conversation(&self) -> Option<&Synchronizer> {
        self.conversation.as_ref()
    }

    pub fn conversation_mut(&mut self) -> Option<&mut Synchronizer> {
        self.conversation.as_mut()
    }

    /// Open a conversation with `peer`. Ignored while signed out.
    pub async fn select_peer(&mut self, peer: Profile) {
        match self.conversation.as_mut() {
            Some(sync) => sync.select_peer(peer).await,
            None => warn!("Cannot open a conversation without a session"),
        }
    }
}

/// Next merged update of the open conversation. Never resolves while no
/// peer is selected or the poll task has stopped.
async fn next_applied(conversation: &mut Option<Synchronizer>) -> Applied {
    if let Some(sync) = conversation.as_mut().filter(|sync| sync.peer().is_some()) {
        if let Some(applied) = sync.next_update().await {
            return applied;
        }
        warn!("Conversation updates stopped");
    }
    std::future::pending().await
}

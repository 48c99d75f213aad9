use std::collections::HashSet;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use parley_core::blog::{BlogDraft, publish_blog};
use parley_core::compose::{AttachmentDraft, AttachmentPreview, ComposeBox};
use parley_core::handoff::PeerHandoff;
use parley_core::signup::{SignupFlow, SignupForm, SignupResult};
use parley_core::{Backend, ChatSession, SessionEvent};
use parley_db::LocalBackend;
use parley_remote::{RemoteBackend, RemoteConfig};
use parley_types::events::AuthEvent;
use parley_types::models::MessageId;

mod command;
mod config;
mod view;

use command::{Command, HELP};
use config::{BackendKind, CliConfig};

struct App {
    backend: Arc<dyn Backend>,
    chat: ChatSession,
    compose: ComposeBox,
    signup: SignupFlow,
    handoff: PeerHandoff,
    bucket: String,
    /// Ids already written to the terminal for the open conversation.
    shown: HashSet<MessageId>,
}

impl App {
    /// Run one command. `false` means quit.
    async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Help => println!("{}", HELP),
            Command::Quit => {
                self.leave().await;
                return false;
            }
            Command::Login { email, password } => match self.chat.sign_in(&email, &password).await {
                Ok(()) => self.greet(),
                Err(e) => println!("! sign-in failed: {}", e),
            },
            Command::Register {
                email,
                password,
                role,
                name,
            } => self.register(email, password, role, name).await,
            Command::Refresh => match self.backend.refresh_session().await {
                Ok(_) => println!("* session refreshed"),
                Err(e) => println!("! refresh failed: {}", e),
            },
            Command::Logout => {
                if let Err(e) = self.chat.sign_out().await {
                    println!("! sign-out failed: {}", e);
                }
                self.shown.clear();
            }
            _ if !self.chat.is_authenticated() => println!("! sign in first (/login)"),
            Command::Users(term) => {
                let matches = self.chat.search(term.as_deref().unwrap_or_default());
                if matches.is_empty() {
                    println!("* nobody found");
                }
                for profile in matches {
                    println!("  {}", view::profile_line(profile));
                }
            }
            Command::Peer(username) => self.open(&username).await,
            Command::Attach(path) => match AttachmentDraft::from_path(&path).await {
                Ok(draft) => {
                    let size = draft.size();
                    match self.compose.attach(draft) {
                        Ok(AttachmentPreview::Image { name, .. }) => {
                            println!("* image {} staged ({} bytes)", name, size)
                        }
                        Ok(AttachmentPreview::File { name }) => {
                            println!("* file {} staged ({} bytes)", name, size)
                        }
                        Err(e) => println!("! {}", e),
                    }
                }
                Err(e) => println!("! cannot read {}: {}", path.display(), e),
            },
            Command::Detach => {
                self.compose.cancel_attachment();
                println!("* attachment dropped");
            }
            Command::Blog { title, content } => self.blog(title, content).await,
            Command::Send(text) => self.send(text).await,
        }
        true
    }

    fn greet(&self) {
        if let Some(session) = self.chat.session() {
            println!(
                "* signed in as {} ({} people)",
                session.user.email.as_deref().unwrap_or("unknown"),
                self.chat.directory().len()
            );
        }
    }

    async fn register(&mut self, email: String, password: String, role: String, name: String) {
        let form = SignupForm {
            name,
            email,
            confirm_password: password.clone(),
            password,
            role,
            agree_terms: true,
        };
        match self.signup.submit(self.backend.as_ref(), &form).await {
            Ok(SignupResult::Registered(_)) => println!("* account created, you are signed in"),
            Ok(SignupResult::VerifyEmail(_)) => {
                println!("* check {} for a verification link, then /login", form.email)
            }
            Err(e) => println!("! registration failed: {}", e),
        }
    }

    async fn open(&mut self, username: &str) {
        let Some(peer) = self.chat.directory().find_by_username(username).cloned() else {
            println!("! no user @{}", username);
            return;
        };
        println!("* talking to {}", view::profile_line(&peer));
        self.shown.clear();
        self.chat.select_peer(peer).await;
        self.show_new();
    }

    async fn send(&mut self, text: String) {
        let Some(sync) = self.chat.conversation_mut() else {
            return;
        };
        if sync.peer().is_none() {
            println!("! open a conversation first (/peer <username>)");
            return;
        }
        self.compose.set_text(text);
        match sync.send(&mut self.compose).await {
            Ok(Some(_)) => self.show_new(),
            Ok(None) => {}
            Err(e) => println!("! not sent: {}", e),
        }
    }

    async fn blog(&mut self, title: String, content: String) {
        let Some(author) = self.chat.session().map(|s| s.user_id()) else {
            return;
        };
        let draft = BlogDraft {
            title,
            content,
            image: self.compose.attachment().cloned(),
            ..BlogDraft::default()
        };
        match publish_blog(self.backend.as_ref(), &self.bucket, author, draft).await {
            Ok(blog) => {
                self.compose.cancel_attachment();
                println!("* published \"{}\" ({})", blog.title, blog.id);
            }
            Err(e) => println!("! not published: {}", e),
        }
    }

    /// Print confirmed messages not shown yet, oldest first.
    fn show_new(&mut self) {
        let Some(sync) = self.chat.conversation() else {
            return;
        };
        let Some(peer) = sync.peer() else {
            return;
        };
        for message in sync.messages() {
            if message.is_optimistic || !self.shown.insert(message.id.clone()) {
                continue;
            }
            println!("{}", view::message_line(message, sync.self_id(), peer));
        }
    }

    fn on_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Auth(AuthEvent::SignedIn(session)) => {
                debug!("Session established for {}", session.user_id())
            }
            SessionEvent::Auth(AuthEvent::TokenRefreshed(_)) => debug!("Token refreshed"),
            SessionEvent::Auth(AuthEvent::SignedOut) => {
                self.shown.clear();
                println!("* signed out");
            }
            SessionEvent::Conversation(applied) if applied.changed() => self.show_new(),
            SessionEvent::Conversation(_) => {}
        }
    }

    /// Hand the open conversation to the next run.
    async fn leave(&self) {
        let peer = self.chat.conversation().and_then(|sync| sync.peer());
        if let Some(peer) = peer {
            if let Err(e) = self.handoff.stash(peer).await {
                warn!("Could not remember the open conversation: {}", e);
            }
        }
    }
}

async fn connect(config: &CliConfig) -> anyhow::Result<Arc<dyn Backend>> {
    let backend: Arc<dyn Backend> = match &config.backend {
        BackendKind::Remote { url, anon_key } => {
            info!("Using hosted backend at {}", url);
            Arc::new(RemoteBackend::new(RemoteConfig::new(url, anon_key.clone())?))
        }
        BackendKind::Local {
            db_path,
            storage_dir,
            jwt_secret,
        } => {
            info!("Using local database {}", db_path.display());
            Arc::new(LocalBackend::open(db_path.clone(), storage_dir.clone(), jwt_secret.clone()).await?)
        }
    };
    Ok(backend)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = CliConfig::from_env()?;
    let backend = connect(&config).await?;
    let handoff = PeerHandoff::new(&config.handoff_path);

    let mut chat = ChatSession::new(backend.clone(), config.sync.clone()).with_handoff(handoff.clone());
    chat.start().await?;

    let mut app = App {
        backend,
        chat,
        compose: ComposeBox::new(config.sync.max_attachment_bytes),
        signup: SignupFlow::new(),
        handoff,
        bucket: config.sync.bucket.clone(),
        shown: HashSet::new(),
    };

    if app.chat.is_authenticated() {
        app.greet();
    } else if let Some((email, password)) = &config.credentials {
        app.handle(Command::Login {
            email: email.clone(),
            password: password.clone(),
        })
        .await;
    } else {
        println!("* not signed in, use /login or /register (/help for more)");
    }
    app.show_new();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    app.leave().await;
                    break;
                };
                match Command::parse(&line) {
                    Ok(command) => {
                        if !app.handle(command).await {
                            break;
                        }
                    }
                    Err(usage) => println!("! {}", usage),
                }
            }
            event = app.chat.next_event() => match event {
                Some(event) => app.on_event(event),
                None => {
                    warn!("Auth events closed");
                    break;
                }
            },
        }
    }

    info!("Bye");
    Ok(())
}

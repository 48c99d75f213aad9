use std::sync::LazyLock;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{error, info};

use parley_types::api::{SignUpMetadata, SignUpOutcome, SignUpRequest};
use parley_types::models::{AuthUser, Session, UserRecord};

use crate::backend::Backend;
use crate::error::SignupError;

/// How long submissions are refused after a failed attempt.
pub const SIGNUP_COOLDOWN: Duration = Duration::from_secs(60);

static EMAIL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("static pattern"));

#[derive(Debug, Clone, Default)]
pub struct SignupForm {
    pub name: String,
    pub email: String,
    pub password: String,
    pub confirm_password: String,
    pub role: String,
    pub agree_terms: bool,
}

impl SignupForm {
    /// Local checks that never cost a cooldown.
    pub fn validate(&self) -> Result<(), SignupError> {
        if self.password != self.confirm_password {
            return Err(SignupError::PasswordMismatch);
        }
        if !is_valid_email(&self.email) {
            return Err(SignupError::InvalidEmail);
        }
        if !self.agree_terms {
            return Err(SignupError::TermsNotAccepted);
        }
        Ok(())
    }
}

pub fn is_valid_email(email: &str) -> bool {
    EMAIL_PATTERN.is_match(email)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignupResult {
    /// Account created and signed in; the `users` row is written.
    Registered(Session),
    /// Account created; the address must be verified before signing in.
    VerifyEmail(AuthUser),
}

/// Registration with a cooldown after each failed attempt.
#[derive(Debug, Default)]
pub struct SignupFlow {
    cooldown_until: Option<Instant>,
}

impl SignupFlow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remaining_cooldown(&self, now: Instant) -> Option<Duration> {
        self.cooldown_until
            .and_then(|until| until.checked_duration_since(now))
            .filter(|d| !d.is_zero())
    }

    pub async fn submit<B>(&mut self, backend: &B, form: &SignupForm) -> Result<SignupResult, SignupError>
    where
        B: Backend + ?Sized,
    {
        if let Some(remaining) = self.remaining_cooldown(Instant::now()) {
            return Err(SignupError::CoolingDown { remaining });
        }
        form.validate()?;

        let result = register(backend, form).await;
        match &result {
            Ok(_) => self.cooldown_until = None,
            Err(e) => {
                error!("Signup error: {}", e);
                self.cooldown_until = Some(Instant::now() + SIGNUP_COOLDOWN);
            }
        }
        result
    }
}

async fn register<B>(backend: &B, form: &SignupForm) -> Result<SignupResult, SignupError>
where
    B: Backend + ?Sized,
{
    let request = SignUpRequest {
        email: form.email.clone(),
        password: form.password.clone(),
        data: SignUpMetadata {
            full_name: form.name.clone(),
            role: form.role.clone(),
        },
    };

    match backend.sign_up(request).await.map_err(SignupError::Auth)? {
        SignUpOutcome::Session(session) => {
            backend
                .upsert_user(UserRecord {
                    id: session.user_id(),
                    name: form.name.clone(),
                    email: form.email.clone(),
                    role: form.role.clone(),
                })
                .await
                .map_err(SignupError::Profile)?;
            info!("Registered {}", session.user_id());
            Ok(SignupResult::Registered(session))
        }
        SignUpOutcome::ConfirmationRequired(user) => {
            info!("Registered {}, awaiting email verification", user.id);
            Ok(SignupResult::VerifyEmail(user))
        }
    }
}

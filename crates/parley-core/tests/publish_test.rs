mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use uuid::Uuid;

use common::MemoryBackend;
use parley_core::blog::{BlogDraft, publish_blog};
use parley_core::compose::AttachmentDraft;
use parley_core::error::{BlogError, SignupError};
use parley_core::signup::{SIGNUP_COOLDOWN, SignupFlow, SignupForm, SignupResult};

fn form() -> SignupForm {
    SignupForm {
        name: "Ann Lee".into(),
        email: "ann@example.com".into(),
        password: "hunter22".into(),
        confirm_password: "hunter22".into(),
        role: "student".into(),
        agree_terms: true,
    }
}

#[tokio::test]
async fn test_signup_writes_user_row() {
    let backend = MemoryBackend::new();
    let mut flow = SignupFlow::new();

    let result = flow.submit(backend.as_ref(), &form()).await.unwrap();
    let SignupResult::Registered(session) = result else {
        panic!("expected a session");
    };

    let users = backend.users.lock().unwrap().clone();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].id, session.user_id());
    assert_eq!(users[0].name, "Ann Lee");
    assert_eq!(users[0].role, "student");
}

#[tokio::test]
async fn test_signup_awaiting_verification_skips_user_row() {
    let backend = MemoryBackend::new();
    backend.confirm_email.store(true, Ordering::SeqCst);

    let result = SignupFlow::new()
        .submit(backend.as_ref(), &form())
        .await
        .unwrap();
    assert!(matches!(result, SignupResult::VerifyEmail(_)));
    assert!(backend.users.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_signup_starts_cooldown() {
    let backend = MemoryBackend::new();
    backend.fail_signup.store(true, Ordering::SeqCst);
    let mut flow = SignupFlow::new();

    let err = flow.submit(backend.as_ref(), &form()).await.unwrap_err();
    assert!(matches!(err, SignupError::Auth(_)));

    backend.fail_signup.store(false, Ordering::SeqCst);
    match flow.submit(backend.as_ref(), &form()).await {
        Err(SignupError::CoolingDown { remaining }) => {
            assert!(remaining <= SIGNUP_COOLDOWN);
            assert!(remaining > SIGNUP_COOLDOWN - Duration::from_secs(5));
        }
        other => panic!("expected cooldown, got {:?}", other),
    }
    assert!(backend.accounts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_local_validation_does_not_start_cooldown() {
    let backend = MemoryBackend::new();
    let mut flow = SignupFlow::new();

    let mismatch = SignupForm {
        confirm_password: "other".into(),
        ..form()
    };
    assert!(matches!(
        flow.submit(backend.as_ref(), &mismatch).await,
        Err(SignupError::PasswordMismatch)
    ));
    assert!(flow.submit(backend.as_ref(), &form()).await.is_ok());
}

#[tokio::test]
async fn test_publish_blog_with_cover_image() {
    let backend = MemoryBackend::new();
    let author = Uuid::new_v4();
    let draft = BlogDraft {
        title: "First post".into(),
        summary: "  ".into(),
        content: "Body".into(),
        image: Some(AttachmentDraft::new("cover.jpg", vec![7u8; 64])),
    };

    let blog = publish_blog(backend.as_ref(), "blog-images", author, draft)
        .await
        .unwrap();

    let uploads = backend.uploads.lock().unwrap().clone();
    assert_eq!(uploads.len(), 1);
    let (bucket, path, _) = &uploads[0];
    assert_eq!(bucket, "blog-images");
    assert!(path.starts_with(&format!("{}/", author)));
    assert!(path.ends_with(".jpg"));

    assert_eq!(blog.summary, None);
    assert_eq!(blog.author_id, author);
    assert_eq!(
        blog.image_url,
        Some(format!("https://store/blog-images/{}", path))
    );
    assert_eq!(backend.blogs.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_publish_blog_requires_title_and_content() {
    let backend = MemoryBackend::new();
    let draft = BlogDraft {
        title: " ".into(),
        content: "Body".into(),
        ..BlogDraft::default()
    };
    let err = publish_blog(backend.as_ref(), "blog-images", Uuid::new_v4(), draft)
        .await
        .unwrap_err();
    assert!(matches!(err, BlogError::MissingFields));
    assert!(backend.blogs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_publish_blog_upload_failure_inserts_nothing() {
    let backend = MemoryBackend::new();
    backend.fail_upload.store(true, Ordering::SeqCst);
    let draft = BlogDraft {
        title: "Post".into(),
        content: "Body".into(),
        image: Some(AttachmentDraft::new("cover.png", vec![1u8; 8])),
        ..BlogDraft::default()
    };
    let err = publish_blog(backend.as_ref(), "blog-images", Uuid::new_v4(), draft)
        .await
        .unwrap_err();
    assert!(matches!(err, BlogError::Upload(_)));
    assert!(backend.blogs.lock().unwrap().is_empty());
}

use chrono::Utc;
use tracing::{error, info};
use uuid::Uuid;

use parley_types::models::{Blog, NewBlog};

use crate::backend::{Backend, UploadOptions};
use crate::compose::{AttachmentDraft, object_name, owner_path, random_stem};
use crate::error::BlogError;

#[derive(Debug, Clone, Default)]
pub struct BlogDraft {
    pub title: String,
    pub summary: String,
    pub content: String,
    pub image: Option<AttachmentDraft>,
}

/// Upload the cover image, if any, and insert the `blogs` row.
pub async fn publish_blog<B>(
    backend: &B,
    bucket: &str,
    author_id: Uuid,
    draft: BlogDraft,
) -> Result<Blog, BlogError>
where
    B: Backend + ?Sized,
{
    if draft.title.trim().is_empty() || draft.content.trim().is_empty() {
        return Err(BlogError::MissingFields);
    }

    let image_url = match &draft.image {
        Some(image) => {
            let stem = format!("{}-{}", random_stem(), Utc::now().timestamp_millis());
            let path = owner_path(author_id, &object_name(&stem, image.extension()));
            let options = UploadOptions {
                content_type: image.content_type().map(str::to_string),
                cache_control: Some("3600".into()),
                upsert: false,
                owner: Some(author_id),
            };
            backend
                .upload(bucket, &path, image.bytes.clone(), options)
                .await
                .map_err(|e| {
                    error!("Image upload failed: {}", e);
                    BlogError::Upload(e)
                })?;
            Some(backend.public_url(bucket, &path))
        }
        None => None,
    };

    let summary = Some(draft.summary).filter(|s| !s.trim().is_empty());
    let blog = backend
        .insert_blog(NewBlog {
            title: draft.title,
            summary,
            content: draft.content,
            image_url,
            author_id,
        })
        .await
        .map_err(BlogError::Insert)?;

    info!("Blog {} created", blog.id);
    Ok(blog)
}

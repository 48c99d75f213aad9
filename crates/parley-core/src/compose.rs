use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use bytes::Bytes;
use rand::Rng;
use uuid::Uuid;

use crate::error::ComposeError;

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const OBJECT_NAME_LEN: usize = 13;

/// A file staged for sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentDraft {
    pub name: String,
    pub bytes: Bytes,
}

impl AttachmentDraft {
    pub fn new(name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }

    pub async fn from_path(path: &Path) -> std::io::Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        Ok(Self::new(name, bytes))
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Text after the last dot of the original name.
    pub fn extension(&self) -> Option<&str> {
        self.name
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .filter(|ext| !ext.is_empty())
    }

    pub fn content_type(&self) -> Option<&'static str> {
        content_type_for(self.extension()?)
    }

    pub fn is_image(&self) -> bool {
        self.content_type().is_some_and(|t| t.starts_with("image/"))
    }
}

/// Local preview of the staged file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentPreview {
    /// Images carry an inline `data:` URL.
    Image { name: String, data_url: String },
    File { name: String },
}

impl AttachmentPreview {
    fn for_draft(draft: &AttachmentDraft) -> Self {
        match draft.content_type().filter(|_| draft.is_image()) {
            Some(mime) => Self::Image {
                name: draft.name.clone(),
                data_url: format!("data:{};base64,{}", mime, B64.encode(&draft.bytes)),
            },
            None => Self::File {
                name: draft.name.clone(),
            },
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Image { name, .. } | Self::File { name } => name,
        }
    }
}

/// Text input plus at most one staged attachment.
#[derive(Debug, Clone, Default)]
pub struct ComposeBox {
    text: String,
    attachment: Option<AttachmentDraft>,
    preview: Option<AttachmentPreview>,
    limit: Option<u64>,
}

impl ComposeBox {
    pub fn new(max_attachment_bytes: u64) -> Self {
        Self {
            limit: Some(max_attachment_bytes),
            ..Self::default()
        }
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = text.into();
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Stage a file, rejecting it up front when it is over the size limit.
    pub fn attach(&mut self, draft: AttachmentDraft) -> Result<&AttachmentPreview, ComposeError> {
        if let Some(limit) = self.limit {
            check_size(draft.size(), limit)?;
        }
        let preview = AttachmentPreview::for_draft(&draft);
        self.attachment = Some(draft);
        Ok(self.preview.insert(preview))
    }

    pub fn cancel_attachment(&mut self) {
        self.attachment = None;
        self.preview = None;
    }

    pub fn attachment(&self) -> Option<&AttachmentDraft> {
        self.attachment.as_ref()
    }

    pub fn preview(&self) -> Option<&AttachmentPreview> {
        self.preview.as_ref()
    }

    /// Nothing worth sending: blank text and no staged file.
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty() && self.attachment.is_none()
    }

    pub fn clear(&mut self) {
        self.text.clear();
        self.cancel_attachment();
    }
}

pub fn check_size(size: u64, limit: u64) -> Result<(), ComposeError> {
    if size > limit {
        return Err(ComposeError::TooLarge { size, limit });
    }
    Ok(())
}

/// Random base36 stem, the same shape for attachments and blog images.
pub fn random_stem() -> String {
    let mut rng = rand::rng();
    (0..OBJECT_NAME_LEN)
        .map(|_| BASE36[rng.random_range(0..BASE36.len())] as char)
        .collect()
}

/// `<stem>.<ext>`, or the bare stem when the original had no extension.
pub fn object_name(stem: &str, extension: Option<&str>) -> String {
    match extension {
        Some(ext) => format!("{}.{}", stem, ext),
        None => stem.to_string(),
    }
}

/// Object path scoped by the uploader so storage policies can match on it.
pub fn owner_path(owner: Uuid, file_name: &str) -> String {
    format!("{}/{}", owner, file_name)
}

pub fn content_type_for(extension: &str) -> Option<&'static str> {
    let mime = match extension.to_ascii_lowercase().as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "bmp" => "image/bmp",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "json" => "application/json",
        "zip" => "application/zip",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        _ => return None,
    };
    Some(mime)
}

//! Document content: what one parsed paper contributes to a model request.
//!
//! Upstream parsers (e.g. MinerU) leave each paper as a directory holding a
//! `full.md` and an `images/` folder. [`load_document_dir`] reads that layout
//! into a [`RawDocument`]; [`assemble`] then normalises the text and applies
//! the image cap to produce the [`DocumentContent`] handed to the dispatcher.

use crate::error::PipelineError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One image, base64-encoded and ready for a multimodal request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageBlob {
    /// Identifier within the document, usually the file name.
    pub id: String,
    pub mime_type: String,
    /// Base64 (standard alphabet, padded).
    pub data: String,
}

impl ImageBlob {
    /// Encode raw image bytes, detecting the format from magic bytes.
    pub fn from_bytes(id: impl Into<String>, bytes: &[u8]) -> Result<Self, image::ImageError> {
        let format = image::guess_format(bytes)?;
        Ok(Self {
            id: id.into(),
            mime_type: format.to_mime_type().to_string(),
            data: STANDARD.encode(bytes),
        })
    }
}

/// A document as handed to the pipeline, before normalisation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawDocument {
    pub source_id: String,
    pub text: String,
    /// Images in document order.
    pub images: Vec<ImageBlob>,
}

impl RawDocument {
    pub fn new(source_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            text: text.into(),
            images: Vec::new(),
        }
    }

    pub fn with_image(mut self, image: ImageBlob) -> Self {
        self.images.push(image);
        self
    }
}

/// Normalised document content, the dispatcher's input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentContent {
    source_id: String,
    text: String,
    images: Vec<ImageBlob>,
    dropped_images: usize,
    truncated: bool,
}

impl DocumentContent {
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// At most `max_images` images, in document order.
    pub fn images(&self) -> &[ImageBlob] {
        &self.images
    }

    /// Images beyond the cap that were left out.
    pub fn dropped_images(&self) -> usize {
        self.dropped_images
    }

    /// Whether the text was cut at `max_text_chars`.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }
}

/// Strip invisible characters and normalise line endings.
pub fn normalise_text(input: &str) -> String {
    input
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .replace(
            [
                '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
            ],
            "",
        )
}

/// Build the dispatcher input for one document.
///
/// Keeps the first `max_images` images. `max_images == 0` forces text-only
/// mode. Text is cut on a character boundary when `max_text_chars` is set.
pub fn assemble(raw: RawDocument, max_images: usize, max_text_chars: Option<usize>) -> DocumentContent {
    let mut text = normalise_text(&raw.text).trim().to_string();
    let mut truncated = false;
    if let Some(limit) = max_text_chars {
        if let Some((cut, _)) = text.char_indices().nth(limit) {
            text.truncate(cut);
            truncated = true;
        }
    }

    let mut images = raw.images;
    let dropped_images = images.len().saturating_sub(max_images);
    images.truncate(max_images);

    if dropped_images > 0 || truncated {
        debug!(
            source_id = %raw.source_id,
            dropped_images,
            truncated,
            "content capped"
        );
    }

    DocumentContent {
        source_id: raw.source_id,
        text,
        images,
        dropped_images,
        truncated,
    }
}

static RE_IMAGE_REF: Lazy<Regex> = Lazy::new(|| Regex::new(r"!\[[^\]]*\]\(([^)\s]+)[^)]*\)").unwrap());

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "bmp", "tif", "tiff"];

/// Load a parsed-document directory.
///
/// Text comes from `full.md`, or the only `*.md` file when there is no
/// `full.md`. Images come from `images/`, ordered by first reference in the
/// markdown, then unreferenced files by name. Unreadable or unrecognised
/// images are skipped with a warning. The source id is the directory name.
pub async fn load_document_dir(dir: &Path) -> Result<RawDocument, PipelineError> {
    let load_err = |detail: String| PipelineError::DocumentLoad {
        path: dir.to_path_buf(),
        detail,
    };

    let markdown_path = find_markdown(dir).await.map_err(|e| load_err(e.to_string()))?;
    let Some(markdown_path) = markdown_path else {
        return Err(load_err("no full.md or single *.md file found".into()));
    };
    let text = tokio::fs::read_to_string(&markdown_path)
        .await
        .map_err(|e| load_err(format!("{}: {e}", markdown_path.display())))?;

    let source_id = dir_source_id(dir);

    let mut image_files = list_images(&dir.join("images")).await;
    let order: HashMap<String, usize> = RE_IMAGE_REF
        .captures_iter(&text)
        .filter_map(|c| Path::new(&c[1]).file_name().map(|n| n.to_string_lossy().into_owned()))
        .enumerate()
        .fold(HashMap::new(), |mut acc, (i, name)| {
            acc.entry(name).or_insert(i);
            acc
        });
    image_files.sort_by(|a, b| {
        let rank = |p: &PathBuf| {
            let name = p.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            (order.get(&name).copied().unwrap_or(usize::MAX), name)
        };
        rank(a).cmp(&rank(b))
    });

    let mut images = Vec::with_capacity(image_files.len());
    for path in image_files {
        let id = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable image");
                continue;
            }
        };
        match ImageBlob::from_bytes(id, &bytes) {
            Ok(blob) => images.push(blob),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unrecognised image"),
        }
    }

    debug!(source_id = %source_id, chars = text.len(), images = images.len(), "loaded document");
    Ok(RawDocument {
        source_id,
        text,
        images,
    })
}

fn dir_source_id(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| dir.display().to_string())
}

/// One batch entry: a loaded document, or an input that could not be read.
///
/// Unreadable inputs stay in the batch so they show up as failed outcomes
/// in their input position instead of silently disappearing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchInput {
    Loaded(RawDocument),
    Unreadable { source_id: String, detail: String },
}

impl BatchInput {
    pub fn source_id(&self) -> &str {
        match self {
            BatchInput::Loaded(doc) => &doc.source_id,
            BatchInput::Unreadable { source_id, .. } => source_id,
        }
    }
}

impl From<RawDocument> for BatchInput {
    fn from(doc: RawDocument) -> Self {
        BatchInput::Loaded(doc)
    }
}

/// Load every directory in order; failures become [`BatchInput::Unreadable`].
pub async fn load_batch(dirs: &[PathBuf]) -> Vec<BatchInput> {
    let mut inputs = Vec::with_capacity(dirs.len());
    for dir in dirs {
        let input = match load_document_dir(dir).await {
            Ok(doc) => BatchInput::Loaded(doc),
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "document directory could not be loaded");
                let detail = match e {
                    PipelineError::DocumentLoad { detail, .. } => detail,
                    other => other.to_string(),
                };
                BatchInput::Unreadable {
                    source_id: dir_source_id(dir),
                    detail,
                }
            }
        };
        inputs.push(input);
    }
    inputs
}

async fn find_markdown(dir: &Path) -> std::io::Result<Option<PathBuf>> {
    let full = dir.join("full.md");
    if tokio::fs::metadata(&full).await.is_ok() {
        return Ok(Some(full));
    }
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut found = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|e| e.eq_ignore_ascii_case("md")) {
            found.push(path);
        }
    }
    Ok(if found.len() == 1 { found.pop() } else { None })
}

async fn list_images(dir: &Path) -> Vec<PathBuf> {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return Vec::new();
    };
    let mut out = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
        if is_image {
            out.push(path);
        }
    }
    out
}

/// Subdirectories of `root` that look like parsed documents, sorted by name.
pub async fn discover_document_dirs(root: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    let mut entries = tokio::fs::read_dir(root)
        .await
        .map_err(|e| PipelineError::DocumentLoad {
            path: root.to_path_buf(),
            detail: e.to_string(),
        })?;
    let mut dirs = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.is_dir() && matches!(find_markdown(&path).await, Ok(Some(_))) {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, Rgba, RgbaImage};
    use std::io::Cursor;

    fn png_bytes() -> Vec<u8> {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 4, Rgba([0, 128, 255, 255])));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .expect("encode png");
        buf
    }

    fn blob(id: &str) -> ImageBlob {
        ImageBlob {
            id: id.into(),
            mime_type: "image/png".into(),
            data: "AAAA".into(),
        }
    }

    #[test]
    fn image_blob_detects_png() {
        let b = ImageBlob::from_bytes("fig1.png", &png_bytes()).unwrap();
        assert_eq!(b.mime_type, "image/png");
        assert!(!STANDARD.decode(&b.data).unwrap().is_empty());
        assert!(ImageBlob::from_bytes("x", b"not an image").is_err());
    }

    #[test]
    fn assemble_caps_images_in_order() {
        let mut raw = RawDocument::new("d", "text");
        for i in 0..7 {
            raw = raw.with_image(blob(&format!("img{i}")));
        }
        let c = assemble(raw, 5, None);
        assert_eq!(c.images().len(), 5);
        assert_eq!(c.images()[0].id, "img0");
        assert_eq!(c.images()[4].id, "img4");
        assert_eq!(c.dropped_images(), 2);
    }

    #[test]
    fn zero_cap_forces_text_only() {
        let c = assemble(RawDocument::new("d", "t").with_image(blob("a")), 0, None);
        assert!(c.images().is_empty());
    }

    #[test]
    fn assemble_normalises_and_truncates_on_char_boundary() {
        let raw = RawDocument::new("d", "\u{FEFF}Zn\u{200B}O band\r\ngap é€ tail\r\n");
        let c = assemble(raw.clone(), 5, None);
        assert_eq!(c.text(), "ZnO band\ngap é€ tail");
        assert!(!c.is_truncated());

        let c = assemble(raw, 5, Some(14));
        assert_eq!(c.text(), "ZnO band\ngap é");
        assert!(c.is_truncated());
    }

    #[tokio::test]
    async fn load_dir_orders_images_by_reference() {
        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("paper-1");
        std::fs::create_dir_all(doc.join("images")).unwrap();
        std::fs::write(
            doc.join("full.md"),
            "Intro ![](images/b.png)\n\nThen ![fig](images/a.png \"A\")",
        )
        .unwrap();
        let png = png_bytes();
        for name in ["a.png", "b.png", "c.png"] {
            std::fs::write(doc.join("images").join(name), &png).unwrap();
        }
        std::fs::write(doc.join("images").join("broken.png"), b"junk").unwrap();

        let raw = load_document_dir(&doc).await.unwrap();
        assert_eq!(raw.source_id, "paper-1");
        let ids: Vec<&str> = raw.images.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, ["b.png", "a.png", "c.png"]);
    }

    #[tokio::test]
    async fn load_dir_without_markdown_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_document_dir(dir.path()).await.unwrap_err();
        assert!(matches!(err, PipelineError::DocumentLoad { .. }));
    }

    #[tokio::test]
    async fn load_batch_keeps_unreadable_dirs_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good");
        std::fs::create_dir_all(&good).unwrap();
        std::fs::write(good.join("full.md"), "ZnO").unwrap();
        let empty = dir.path().join("empty");
        std::fs::create_dir_all(&empty).unwrap();

        let inputs = load_batch(&[empty, good]).await;
        assert_eq!(inputs.len(), 2);
        match &inputs[0] {
            BatchInput::Unreadable { source_id, detail } => {
                assert_eq!(source_id, "empty");
                assert!(detail.contains("full.md"), "{detail}");
            }
            other => panic!("expected unreadable, got {other:?}"),
        }
        assert!(matches!(&inputs[1], BatchInput::Loaded(doc) if doc.text == "ZnO"));
        assert_eq!(inputs[1].source_id(), "good");
    }

    #[tokio::test]
    async fn discover_finds_document_dirs() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b", "a"] {
            let d = dir.path().join(name);
            std::fs::create_dir_all(&d).unwrap();
            std::fs::write(d.join("paper.md"), "x").unwrap();
        }
        std::fs::create_dir_all(dir.path().join("empty")).unwrap();
        let found = discover_document_dirs(dir.path()).await.unwrap();
        let names: Vec<String> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["a", "b"]);
    }
}

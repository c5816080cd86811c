//! Admission checks run before a file may enter the queue.
//!
//! Pure functions only: nothing here touches queue state or the network, so
//! every check can be repeated freely.

use std::path::Path;

use super::error::{RejectCode, Rejection};
use super::models::{Category, FileRef};
use crate::format::format_bytes;

pub const MIB: u64 = 1024 * 1024;

/// Absolute ceiling on a single file.
pub const MAX_FILE_SIZE: u64 = 500 * MIB;

/// Archive and executable formats, refused whatever their declared type.
pub const BLOCKED_EXTENSIONS: &[&str] = &[
    "zip", "rar", "7z", "tar", "gz", "exe", "bin", "sh", "app", "msi", "iso", "dmg", "bat", "cmd",
    "ps1", "dll", "so", "dylib",
];

/// Every extension on the allowlist, in display order.
const KNOWN_EXTENSIONS: &[&str] = &[
    "txt", "md", "markdown", "csv", "tsv", "json", "xml", "yaml", "yml", "html", "htm", "log",
    "rtf", "pdf", "doc", "docx", "jpg", "jpeg", "png", "gif", "webp", "bmp", "tif", "tiff", "svg",
    "heic", "heif", "avif", "mp3", "wav", "flac", "aac", "m4a", "wma", "opus", "aiff", "ogg",
    "mp4", "webm", "mov", "avi", "mkv", "m4v", "wmv", "flv", "mpeg", "mpg", "3gp",
];

/// Categories an extension may belong to, most likely first. More than one
/// entry means the declared MIME type has to break the tie.
fn extension_categories(ext: &str) -> &'static [Category] {
    match ext {
        "txt" | "md" | "markdown" | "csv" | "tsv" | "json" | "xml" | "yaml" | "yml" | "html"
        | "htm" | "log" | "rtf" | "pdf" | "doc" | "docx" => &[Category::Text],
        "jpg" | "jpeg" | "png" | "gif" | "webp" | "bmp" | "tif" | "tiff" | "svg" | "heic"
        | "heif" | "avif" => &[Category::Image],
        "mp3" | "wav" | "flac" | "aac" | "m4a" | "wma" | "opus" | "aiff" => &[Category::Audio],
        "mov" | "avi" | "mkv" | "m4v" | "wmv" | "flv" | "mpeg" | "mpg" | "3gp" => {
            &[Category::Video]
        }
        "ogg" => &[Category::Audio, Category::Video],
        "mp4" | "webm" => &[Category::Video, Category::Audio],
        _ => &[],
    }
}

fn category_for_mime(mime: &str) -> Option<Category> {
    let essence = mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    let (top, sub) = essence.split_once('/')?;
    match top {
        "text" => Some(Category::Text),
        "image" => Some(Category::Image),
        "audio" => Some(Category::Audio),
        "video" => Some(Category::Video),
        "application" => match sub {
            "json" | "xml" | "pdf" | "rtf" | "yaml" | "x-yaml" | "msword"
            | "vnd.openxmlformats-officedocument.wordprocessingml.document" => {
                Some(Category::Text)
            }
            _ => None,
        },
        _ => None,
    }
}

/// Extensions accepted for one category.
pub fn allowed_extensions(category: Category) -> Vec<&'static str> {
    KNOWN_EXTENSIONS
        .iter()
        .copied()
        .filter(|ext| extension_categories(ext).contains(&category))
        .collect()
}

fn allowed_summary() -> String {
    Category::ALL
        .iter()
        .map(|category| format!("{} ({})", category, allowed_extensions(*category).join(", ")))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Check a file against the admission rules, in order, stopping at the
/// first failure. Returns the category the file will be uploaded under.
pub fn validate(file: &FileRef) -> Result<Category, Rejection> {
    let reject = |code: RejectCode, message: String| Rejection {
        file_name: file.name.clone(),
        code,
        message,
    };

    if file.byte_size == 0 {
        return Err(reject(RejectCode::EmptyFile, "file is empty".to_string()));
    }

    if file.byte_size > MAX_FILE_SIZE {
        return Err(reject(
            RejectCode::FileTooLarge,
            format!(
                "file is {} ({} bytes), which exceeds the {} limit",
                format_bytes(file.byte_size),
                file.byte_size,
                format_bytes(MAX_FILE_SIZE)
            ),
        ));
    }

    let extension = file.extension();

    if let Some(ext) = extension.as_deref()
        && BLOCKED_EXTENSIONS.contains(&ext)
    {
        return Err(reject(
            RejectCode::BlockedExtension,
            format!(".{} files are not accepted (archives and executables are blocked)", ext),
        ));
    }

    let declared = category_for_mime(&file.mime_type);
    let category = match extension.as_deref() {
        Some(ext) => match extension_categories(ext) {
            [] => None,
            [only] => Some(*only),
            candidates => declared
                .filter(|c| candidates.contains(c))
                .or(Some(candidates[0])),
        },
        None => declared,
    };

    category.ok_or_else(|| {
        let shown = match extension.as_deref() {
            Some(ext) => format!(".{}", ext),
            None => format!("'{}' without an extension", file.mime_type),
        };
        reject(
            RejectCode::UnsupportedType,
            format!("unsupported file type {}; allowed: {}", shown, allowed_summary()),
        )
    })
}

/// Split a batch into accepted files (with their category) and rejections,
/// preserving input order on both sides.
pub fn validate_batch(files: Vec<FileRef>) -> (Vec<(FileRef, Category)>, Vec<Rejection>) {
    let mut accepted = Vec::new();
    let mut rejected = Vec::new();

    for file in files {
        match validate(&file) {
            Ok(category) => accepted.push((file, category)),
            Err(rejection) => rejected.push(rejection),
        }
    }

    (accepted, rejected)
}

/// Lowercased extension of a file name: whatever follows the last dot once
/// trailing dots and whitespace are stripped. A dotfile such as `.sh` has
/// its whole name as extension.
pub fn extension_of(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let trimmed = base.trim_end_matches(|c: char| c == '.' || c.is_whitespace());
    let (_, ext) = trimmed.rsplit_once('.')?;
    let ext = ext.trim();
    (!ext.is_empty()).then(|| ext.to_lowercase())
}

/// Guess a content type from a path's extension.
pub fn mime_for_path(path: &Path) -> String {
    let ext = path
        .file_name()
        .and_then(|name| extension_of(&name.to_string_lossy()))
        .unwrap_or_default();

    let mime = match ext.as_str() {
        "txt" | "log" => "text/plain",
        "md" | "markdown" => "text/markdown",
        "csv" => "text/csv",
        "tsv" => "text/tab-separated-values",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "xml" => "application/xml",
        "yaml" | "yml" => "application/yaml",
        "rtf" => "application/rtf",
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        "svg" => "image/svg+xml",
        "heic" => "image/heic",
        "heif" => "image/heif",
        "avif" => "image/avif",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "flac" => "audio/flac",
        "aac" => "audio/aac",
        "m4a" => "audio/mp4",
        "wma" => "audio/x-ms-wma",
        "opus" => "audio/opus",
        "aiff" => "audio/aiff",
        "ogg" => "audio/ogg",
        "mp4" | "m4v" => "video/mp4",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "mkv" => "video/x-matroska",
        "wmv" => "video/x-ms-wmv",
        "flv" => "video/x-flv",
        "mpeg" | "mpg" => "video/mpeg",
        "3gp" => "video/3gpp",
        _ => "application/octet-stream",
    };
    mime.to_string()
}

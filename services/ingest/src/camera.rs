//! Camera descriptors and chunk files.
//!
//! A chunk file is a JSON array of descriptors produced by an external
//! splitter; one capture process handles exactly one chunk.

use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Errors that make a chunk unusable. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("failed to read chunk file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("chunk file {path} is not a JSON array of cameras: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("chunk file {0} lists no cameras")]
    Empty(PathBuf),

    #[error("chunk file {path} has a camera without cam_id at index {index}")]
    MissingCamId { path: PathBuf, index: usize },

    #[error("chunk file {path} has cam_id '{cam_id}', which is not a single path component")]
    InvalidCamId { path: PathBuf, cam_id: String },

    #[error("chunk file {path} lists camera '{cam_id}' more than once")]
    DuplicateCamId { path: PathBuf, cam_id: String },
}

/// One camera, immutable for the life of the process.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CameraDescriptor {
    #[serde(default)]
    pub cam_id: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    /// Page or image URL the capture starts from
    #[serde(default, alias = "expand_url")]
    pub source_endpoint: Option<String>,
}

impl CameraDescriptor {
    /// Filesystem-safe label, from `code` or else `title`.
    pub fn code_slug(&self) -> String {
        let label = self
            .code
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .or(self.title.as_deref())
            .unwrap_or_default();
        slugify(label)
    }

    /// Endpoint, if present and non-blank.
    pub fn endpoint(&self) -> Option<&str> {
        self.source_endpoint
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// A loaded chunk: its cameras plus the file name recorded with each frame.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub file_name: String,
    pub cameras: Vec<CameraDescriptor>,
}

/// Load and check a chunk file.
pub fn load_chunk(path: &Path) -> Result<Chunk, ChunkError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ChunkError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    parse_chunk(&raw, path).map(|cameras| Chunk { file_name, cameras })
}

fn parse_chunk(raw: &str, path: &Path) -> Result<Vec<CameraDescriptor>, ChunkError> {
    let mut cameras: Vec<CameraDescriptor> =
        serde_json::from_str(raw).map_err(|source| ChunkError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    if cameras.is_empty() {
        return Err(ChunkError::Empty(path.to_path_buf()));
    }

    let mut seen = HashSet::new();
    for (index, camera) in cameras.iter_mut().enumerate() {
        camera.cam_id = camera.cam_id.trim().to_string();
        if camera.cam_id.is_empty() {
            return Err(ChunkError::MissingCamId {
                path: path.to_path_buf(),
                index,
            });
        }
        // cam_id names the camera's storage and export directories.
        if matches!(camera.cam_id.as_str(), "." | "..") || camera.cam_id.contains(['/', '\\']) {
            return Err(ChunkError::InvalidCamId {
                path: path.to_path_buf(),
                cam_id: camera.cam_id.clone(),
            });
        }
        if !seen.insert(camera.cam_id.clone()) {
            return Err(ChunkError::DuplicateCamId {
                path: path.to_path_buf(),
                cam_id: camera.cam_id.clone(),
            });
        }
    }

    Ok(cameras)
}

/// Filesystem-safe slug: NFKD with combining marks stripped, lowercase,
/// alphanumerics and `.-` kept, everything else collapsed into single
/// underscores, `._-` trimmed from both ends.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    for c in text
        .trim()
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
    {
        if c.is_alphanumeric() || matches!(c, '.' | '-') {
            slug.push(c);
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }

    let slug = slug.trim_matches(|c| matches!(c, '_' | '.' | '-'));
    if slug.is_empty() {
        "nocode".to_string()
    } else {
        slug.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Ngã tư Hàng Xanh"), "nga_tu_hang_xanh");
        assert_eq!(slugify("Đường  Điện Biên Phủ / 2"), "đuong_đien_bien_phu_2");
        assert_eq!(slugify("TTH-29.3"), "tth-29.3");
        assert_eq!(slugify("  ***  "), "nocode");
        assert_eq!(slugify(""), "nocode");
    }

    #[test]
    fn test_code_falls_back_to_title() {
        let camera = CameraDescriptor {
            cam_id: "c1".into(),
            code: Some("  ".into()),
            title: Some("Cầu Sài Gòn".into()),
            source_endpoint: None,
        };
        assert_eq!(camera.code_slug(), "cau_sai_gon");
        assert_eq!(camera.endpoint(), None);
    }

    #[test]
    fn test_parse_accepts_legacy_endpoint_key() {
        let raw = r#"[
            {"cam_id": "a", "code": "A1", "title": "x", "source_endpoint": "http://h/a"},
            {"cam_id": "b", "title": "y", "expand_url": "http://h/b", "extra": 1}
        ]"#;
        let cameras = parse_chunk(raw, Path::new("chunk_01.json")).unwrap();
        assert_eq!(cameras.len(), 2);
        assert_eq!(cameras[1].endpoint(), Some("http://h/b"));
        assert_eq!(cameras[1].code, None);
    }

    #[test]
    fn test_parse_rejects_bad_chunks() {
        let path = Path::new("chunk.json");
        assert!(matches!(parse_chunk("[]", path), Err(ChunkError::Empty(_))));
        assert!(matches!(
            parse_chunk("{\"cam_id\": \"a\"}", path),
            Err(ChunkError::Parse { .. })
        ));
        assert!(matches!(
            parse_chunk(r#"[{"cam_id": "a"}, {"cam_id": " a "}]"#, path),
            Err(ChunkError::DuplicateCamId { .. })
        ));
        assert!(matches!(
            parse_chunk(r#"[{"title": "no id"}]"#, path),
            Err(ChunkError::MissingCamId { index: 0, .. })
        ));
    }

    #[test]
    fn test_parse_rejects_cam_ids_that_escape_the_root() {
        let path = Path::new("chunk.json");
        // JSON-escaped, so the last one decodes to a single backslash.
        for cam_id in ["..", ".", "a/b", r"a\\b"] {
            let raw = format!(r#"[{{"cam_id": "{cam_id}"}}]"#);
            assert!(
                matches!(parse_chunk(&raw, path), Err(ChunkError::InvalidCamId { .. })),
                "{cam_id} accepted"
            );
        }
        assert!(parse_chunk(r#"[{"cam_id": "cam.01-a"}]"#, path).is_ok());
    }

    #[test]
    fn test_load_chunk_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunk_07.json");
        std::fs::write(&path, r#"[{"cam_id": "a", "source_endpoint": "http://h/a"}]"#).unwrap();

        let chunk = load_chunk(&path).unwrap();
        assert_eq!(chunk.file_name, "chunk_07.json");
        assert_eq!(chunk.cameras[0].cam_id, "a");

        assert!(matches!(
            load_chunk(&dir.path().join("missing.json")),
            Err(ChunkError::Read { .. })
        ));
    }
}

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use image::{ImageFormat, RgbImage};
use regex::Regex;
use uuid::Uuid;

fn extension_regex() -> &'static Regex {
    static EXTENSION_RE: OnceLock<Regex> = OnceLock::new();
    EXTENSION_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9]{1,10}$").expect("valid extension regex"))
}

/// Original upload written to disk; the uuid names its annotated sibling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredUpload {
    pub id: Uuid,
    pub path: PathBuf,
}

/// Flat directory holding uploaded originals and annotated results.
#[derive(Clone, Debug)]
pub struct UploadStore {
    root: PathBuf,
}

impl UploadStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `bytes` as `{uuid}{.ext}`, keeping the extension of `filename`
    /// only when it is short and alphanumeric.
    pub fn save_original(&self, bytes: &[u8], filename: &str) -> io::Result<StoredUpload> {
        let id = Uuid::new_v4();
        let name = match safe_extension(filename) {
            Some(ext) => format!("{}.{}", id, ext),
            None => id.to_string(),
        };
        let path = self.root.join(name);
        let mut file = BufWriter::new(File::create(&path)?);
        file.write_all(bytes)?;
        file.flush()?;
        Ok(StoredUpload { id, path })
    }

    pub fn annotated_path(&self, upload: &StoredUpload) -> PathBuf {
        self.root.join(format!("result_{}.jpg", upload.id))
    }

    /// Read back a file previously written under the root.
    pub fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        let escapes = path
            .components()
            .any(|component| matches!(component, Component::ParentDir));
        if escapes || !path.starts_with(&self.root) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} is outside the upload directory", path.display()),
            ));
        }
        std::fs::read(path)
    }
}

fn safe_extension(filename: &str) -> Option<&str> {
    let ext = Path::new(filename).extension()?.to_str()?;
    extension_regex().is_match(ext).then_some(ext)
}

/// Encode `image` as JPEG at `path`.
pub fn write_jpeg(path: &Path, image: &RgbImage) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    image
        .write_to(&mut out, ImageFormat::Jpeg)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    out.flush()
}

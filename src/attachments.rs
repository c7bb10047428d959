use crate::errors::{AppError, AppResult};
use base64::Engine;
use chrono::Utc;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

static EXTENSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9]{1,10}$").expect("valid extension regex"));

/// An image picked for a task that has not been uploaded yet.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageAttachment {
    pub file_name: String,
    pub content_type: String,
    #[serde(skip)]
    pub bytes: Vec<u8>,
}

impl std::fmt::Debug for ImageAttachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageAttachment")
            .field("file_name", &self.file_name)
            .field("content_type", &self.content_type)
            .field("size", &self.bytes.len())
            .finish()
    }
}

impl ImageAttachment {
    pub fn new(file_name: impl Into<String>, content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: content_type.into(),
            bytes,
        }
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn validate(&self, max_bytes: u64) -> AppResult<()> {
        if !self.content_type.trim().to_ascii_lowercase().starts_with("image/") {
            return Err(AppError::Validation("Please select an image file".to_string()));
        }
        if self.size() > max_bytes {
            return Err(AppError::Validation(format!(
                "Image size should be less than {}",
                describe_size(max_bytes)
            )));
        }
        Ok(())
    }

    pub fn preview_data_url(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.content_type,
            base64::engine::general_purpose::STANDARD.encode(&self.bytes)
        )
    }

    pub fn extension(&self) -> Option<&str> {
        let (_, ext) = self.file_name.rsplit_once('.')?;
        EXTENSION_RE.is_match(ext).then_some(ext)
    }
}

/// `<owner>/<unix-millis>-<random base36>.<ext>`; the extension is dropped when unusable.
pub fn object_path(owner_id: &str, attachment: &ImageAttachment) -> String {
    let suffix = random_base36(11);
    let stem = format!("{}-{}", Utc::now().timestamp_millis(), suffix);
    match attachment.extension() {
        Some(ext) => format!("{}/{}.{}", owner_id, stem, ext.to_ascii_lowercase()),
        None => format!("{}/{}", owner_id, stem),
    }
}

/// Percent-encodes every `/`-separated segment of a storage key for a URL path.
pub fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Recovers the storage path from a public URL: the decoded segments after the bucket.
pub fn object_path_from_public_url(url: &str, bucket: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let segments = parsed
        .path_segments()?
        .map(|segment| urlencoding::decode(segment).map(|decoded| decoded.into_owned()))
        .collect::<Result<Vec<_>, _>>()
        .ok()?;
    let bucket_index = segments.iter().position(|segment| segment == bucket)?;
    let path = segments[bucket_index + 1..].join("/");
    if path.is_empty() {
        None
    } else {
        Some(path)
    }
}

fn describe_size(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * 1024;
    let (unit, label) = match bytes {
        b if b >= MIB => (MIB, "MB"),
        b if b >= KIB => (KIB, "KB"),
        _ => return format!("{}B", bytes),
    };
    if bytes % unit == 0 {
        format!("{}{}", bytes / unit, label)
    } else {
        format!("{:.1}{}", bytes as f64 / unit as f64, label)
    }
}

fn random_base36(len: usize) -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{describe_size, encode_path, object_path, object_path_from_public_url, ImageAttachment};

    fn png(size: usize) -> ImageAttachment {
        ImageAttachment::new("photo.PNG", "image/png", vec![0u8; size])
    }

    #[test]
    fn rejects_non_images_and_oversized_files() {
        let text = ImageAttachment::new("notes.txt", "text/plain", vec![1, 2, 3]);
        let err = text.validate(5 * 1024 * 1024).expect_err("text is not an image");
        assert!(err.to_string().contains("Please select an image file"));

        let big = png(5 * 1024 * 1024 + 1);
        let err = big.validate(5 * 1024 * 1024).expect_err("too large");
        assert!(err.to_string().contains("less than 5MB"));

        png(5 * 1024 * 1024).validate(5 * 1024 * 1024).expect("exactly at limit");
    }

    #[test]
    fn object_paths_are_namespaced_by_owner() {
        let first = object_path("user-1", &png(4));
        let second = object_path("user-1", &png(4));
        assert!(first.starts_with("user-1/"));
        assert!(first.ends_with(".png"));
        assert_ne!(first, second);

        let odd = ImageAttachment::new("no-extension", "image/jpeg", vec![1]);
        assert!(!object_path("user-1", &odd).contains('.'));
    }

    #[test]
    fn extracts_path_from_encoded_or_raw_bucket() {
        let encoded = "http://127.0.0.1:54321/storage/v1/object/public/todo%20list/u1/1-abc.png";
        assert_eq!(
            object_path_from_public_url(encoded, "todo list").as_deref(),
            Some("u1/1-abc.png")
        );
        let raw = "http://host/storage/v1/object/public/todo list/u1/2-def.jpg?v=1";
        assert_eq!(
            object_path_from_public_url(raw, "todo list").as_deref(),
            Some("u1/2-def.jpg")
        );
        assert_eq!(object_path_from_public_url("http://host/other/u1/x.png", "todo list"), None);
    }

    #[test]
    fn buckets_with_reserved_characters_map_back_to_their_paths() {
        for bucket in ["a+b", "bilder-ä", "50%off", "todo list"] {
            let url = format!(
                "http://127.0.0.1:54321/storage/v1/object/public/{}/{}",
                encode_path(bucket),
                encode_path("u1/3-ghi.webp")
            );
            assert!(!url.contains(' '));
            assert_eq!(
                object_path_from_public_url(&url, bucket).as_deref(),
                Some("u1/3-ghi.webp"),
                "bucket {}",
                bucket
            );
        }
        assert_eq!(encode_path("a+b"), "a%2Bb");
    }

    #[test]
    fn small_limits_are_described_in_smaller_units() {
        assert_eq!(describe_size(5 * 1024 * 1024), "5MB");
        assert_eq!(describe_size(1536 * 1024), "1.5MB");
        assert_eq!(describe_size(512 * 1024), "512KB");
        assert_eq!(describe_size(800), "800B");

        let err = png(600 * 1024).validate(512 * 1024).expect_err("too large");
        assert!(err.to_string().contains("less than 512KB"));
    }

    #[test]
    fn preview_is_a_base64_data_url() {
        let image = ImageAttachment::new("a.gif", "image/gif", b"GIF89a".to_vec());
        assert_eq!(image.preview_data_url(), "data:image/gif;base64,R0lGODlh");
    }
}

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use base64::{prelude::BASE64_STANDARD, Engine};
use reqwest::{multipart, Client};
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};

use crate::api::read_error_body;
use crate::api_key::ApiKey;
use crate::error::{Error, Result};

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// The three image sizes the image endpoints accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSize {
    Small,
    Medium,
    Large,
}

impl ImageSize {
    pub fn name(self) -> &'static str {
        match self {
            ImageSize::Small => "small",
            ImageSize::Medium => "medium",
            ImageSize::Large => "large",
        }
    }

    /// Pixel dimensions in the form the API expects.
    pub fn dimensions(self) -> &'static str {
        match self {
            ImageSize::Small => "256x256",
            ImageSize::Medium => "512x512",
            ImageSize::Large => "1024x1024",
        }
    }
}

impl FromStr for ImageSize {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "small" => Ok(ImageSize::Small),
            "medium" => Ok(ImageSize::Medium),
            "large" => Ok(ImageSize::Large),
            _ => Err(Error::UnknownImageSize(s.to_string())),
        }
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    Url,
    B64Json,
}

impl ResponseFormat {
    fn as_str(self) -> &'static str {
        match self {
            ResponseFormat::Url => "url",
            ResponseFormat::B64Json => "b64_json",
        }
    }
}

/// Parameters shared by image generation and variation requests.
#[derive(Debug, Clone)]
pub struct ImageOptions {
    pub size: ImageSize,
    pub n: u32,
    pub response_format: ResponseFormat,
    /// Directory the images are written to; the current directory if `None`.
    pub save_path: Option<PathBuf>,
}

impl Default for ImageOptions {
    fn default() -> Self {
        ImageOptions {
            size: ImageSize::Medium,
            n: 1,
            response_format: ResponseFormat::Url,
            save_path: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct GenerationRequest<'a> {
    prompt: &'a str,
    size: &'static str,
    n: u32,
    response_format: ResponseFormat,
}

#[derive(Debug, Deserialize)]
struct ImagesResponse {
    data: Vec<ImageData>,
}

#[derive(Debug, Deserialize)]
struct ImageData {
    url: Option<String>,
    b64_json: Option<String>,
}

/// Client for the image generation and variation endpoints. Results are
/// written to disk and the paths of the written files are returned.
pub struct ImageClient {
    client: Client,
    api_base: String,
    api_key: ApiKey,
}

impl ImageClient {
    pub fn new(api_base: impl Into<String>, api_key: ApiKey) -> Self {
        ImageClient {
            client: Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// Generates images for `prompt` and saves them as
    /// `gpt-generate-{index}-{timestamp}.png`. Failures are logged and yield
    /// an empty list.
    pub async fn generate_image(&self, prompt: &str, options: &ImageOptions) -> Vec<PathBuf> {
        match self.try_generate_image(prompt, options).await {
            Ok(paths) => paths,
            Err(e) => {
                error!("image generation failed: {}", e);
                Vec::new()
            }
        }
    }

    pub async fn try_generate_image(
        &self,
        prompt: &str,
        options: &ImageOptions,
    ) -> Result<Vec<PathBuf>> {
        let body = GenerationRequest {
            prompt,
            size: options.size.dimensions(),
            n: options.n,
            response_format: options.response_format,
        };
        debug!("image generation request: {:?}", body);

        let response = self
            .client
            .post(format!("{}/images/generations", self.api_base))
            .bearer_auth(self.api_key.expose())
            .json(&body)
            .send()
            .await?;

        let images = read_images(response).await?;
        self.save_all(images, "gpt-generate", options).await
    }

    /// Uploads `image_name` (relative to the current directory unless
    /// absolute) and saves the variations as
    /// `gpt-variation-{index}-{timestamp}.png`. Failures are logged and yield
    /// an empty list.
    pub async fn generate_variation(
        &self,
        image_name: &Path,
        options: &ImageOptions,
    ) -> Vec<PathBuf> {
        match self.try_generate_variation(image_name, options).await {
            Ok(paths) => paths,
            Err(e) => {
                error!("image variation failed: {}", e);
                Vec::new()
            }
        }
    }

    pub async fn try_generate_variation(
        &self,
        image_name: &Path,
        options: &ImageOptions,
    ) -> Result<Vec<PathBuf>> {
        let source = absolute(image_name)?;
        let bytes = tokio::fs::read(&source)
            .await
            .map_err(|e| Error::file_io(&source, e))?;
        let file_name = source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image.png".to_string());

        let part = multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("image/png")?;
        let form = multipart::Form::new()
            .part("image", part)
            .text("n", options.n.to_string())
            .text("size", options.size.dimensions())
            .text("response_format", options.response_format.as_str());

        let response = self
            .client
            .post(format!("{}/images/variations", self.api_base))
            .bearer_auth(self.api_key.expose())
            .multipart(form)
            .send()
            .await?;

        let images = read_images(response).await?;
        self.save_all(images, "gpt-variation", options).await
    }

    /// Saves at most `options.n` of `images`. An image that cannot be fetched,
    /// decoded or written is logged and skipped.
    async fn save_all(
        &self,
        images: Vec<ImageData>,
        prefix: &str,
        options: &ImageOptions,
    ) -> Result<Vec<PathBuf>> {
        let dir = match &options.save_path {
            Some(path) => absolute(path)?,
            None => current_dir()?,
        };
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::file_io(&dir, e))?;

        let wanted = options.n as usize;
        if images.len() > wanted {
            warn!("asked for {} images but got {}, ignoring the rest", wanted, images.len());
        }

        let timestamp = chrono::Local::now().format("%Y-%m-%d-%H-%M-%S").to_string();
        let mut saved = Vec::with_capacity(wanted.min(images.len()));
        for (index, image) in images.into_iter().take(wanted).enumerate() {
            let stem = format!("{prefix}-{index}-{timestamp}");
            match self.save_one(index, image, &dir, &stem).await {
                Ok(path) => saved.push(path),
                Err(e) => warn!("skipping image {}: {}", index, e),
            }
        }
        Ok(saved)
    }

    async fn save_one(
        &self,
        index: usize,
        image: ImageData,
        dir: &Path,
        stem: &str,
    ) -> Result<PathBuf> {
        let bytes = match (image.url, image.b64_json) {
            (_, Some(data)) => BASE64_STANDARD.decode(data.trim())?,
            (Some(url), None) => self
                .client
                .get(url)
                .timeout(DOWNLOAD_TIMEOUT)
                .send()
                .await?
                .error_for_status()?
                .bytes()
                .await?
                .to_vec(),
            (None, None) => return Err(Error::MissingImageData(index)),
        };
        if bytes.is_empty() {
            return Err(Error::MissingImageData(index));
        }

        let path = write_new_file(dir, stem, &bytes).await?;
        debug!("saved {} bytes to {}", bytes.len(), path.display());
        Ok(path)
    }
}

async fn read_images(response: reqwest::Response) -> Result<Vec<ImageData>> {
    if !response.status().is_success() {
        return Err(read_error_body(response).await);
    }
    let text = response.text().await?;
    let parsed: ImagesResponse = serde_json::from_str(&text)?;
    Ok(parsed.data)
}

fn current_dir() -> Result<PathBuf> {
    std::env::current_dir().map_err(|e| Error::file_io(".", e))
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(current_dir()?.join(path))
    }
}

/// Writes `bytes` to `{dir}/{stem}.png`, or to `{dir}/{stem}-{k}.png` for
/// the first free `k` when an earlier request in the same second already took
/// the name. Files are created exclusively, so an existing image is never
/// overwritten.
async fn write_new_file(dir: &Path, stem: &str, bytes: &[u8]) -> Result<PathBuf> {
    let mut attempt = 0u32;
    loop {
        let path = match attempt {
            0 => dir.join(format!("{stem}.png")),
            k => dir.join(format!("{stem}-{k}.png")),
        };
        attempt += 1;

        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(Error::file_io(&path, e)),
        };
        file.write_all(bytes)
            .await
            .map_err(|e| Error::file_io(&path, e))?;
        file.flush().await.map_err(|e| Error::file_io(&path, e))?;
        return Ok(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\nnot-really-a-png";

    fn client(server: &MockServer) -> ImageClient {
        ImageClient::new(format!("{}/v1", server.uri()), ApiKey::new("sk-test"))
    }

    fn options_in(dir: &Path, size: ImageSize, n: u32) -> ImageOptions {
        ImageOptions {
            size,
            n,
            response_format: ResponseFormat::Url,
            save_path: Some(dir.to_path_buf()),
        }
    }

    fn file_name(path: &Path) -> String {
        path.file_name().unwrap().to_string_lossy().into_owned()
    }

    #[test]
    fn size_tiers_map_to_fixed_dimensions() {
        assert_eq!(ImageSize::Small.dimensions(), "256x256");
        assert_eq!(ImageSize::Medium.dimensions(), "512x512");
        assert_eq!(ImageSize::Large.dimensions(), "1024x1024");

        for size in [ImageSize::Small, ImageSize::Medium, ImageSize::Large] {
            assert_eq!(size.name().parse::<ImageSize>().unwrap(), size);
        }
    }

    #[test]
    fn unknown_size_fails_fast() {
        assert!(matches!(
            "huge".parse::<ImageSize>(),
            Err(Error::UnknownImageSize(s)) if s == "huge"
        ));
        assert!("1024x1024".parse::<ImageSize>().is_err());
    }

    #[tokio::test]
    async fn taken_name_gets_a_suffix_and_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let first = write_new_file(dir.path(), "gpt-generate-0-ts", b"one")
            .await
            .unwrap();
        assert_eq!(file_name(&first), "gpt-generate-0-ts.png");

        let second = write_new_file(dir.path(), "gpt-generate-0-ts", b"two")
            .await
            .unwrap();
        let third = write_new_file(dir.path(), "gpt-generate-0-ts", b"three")
            .await
            .unwrap();
        assert_eq!(file_name(&second), "gpt-generate-0-ts-1.png");
        assert_eq!(file_name(&third), "gpt-generate-0-ts-2.png");
        assert_eq!(std::fs::read(&first).unwrap(), b"one");
        assert_eq!(std::fs::read(&second).unwrap(), b"two");
    }

    #[tokio::test]
    async fn generates_and_saves_two_images() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        Mock::given(method("POST"))
            .and(path("/v1/images/generations"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(serde_json::json!({
                "prompt": "sunset",
                "size": "256x256",
                "n": 2,
                "response_format": "url",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "created": 1,
                "data": [
                    {"url": format!("{}/files/a.png", server.uri())},
                    {"url": format!("{}/files/b.png", server.uri())},
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(PNG_BYTES))
            .expect(2)
            .mount(&server)
            .await;

        let paths = client(&server)
            .generate_image("sunset", &options_in(dir.path(), ImageSize::Small, 2))
            .await;

        assert_eq!(paths.len(), 2);
        for (index, path) in paths.iter().enumerate() {
            assert!(file_name(path).starts_with(&format!("gpt-generate-{index}-")));
            assert!(file_name(path).ends_with(".png"));
            assert!(std::fs::metadata(path).unwrap().len() > 0);
        }
    }

    #[tokio::test]
    async fn decodes_inline_image_data() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        Mock::given(method("POST"))
            .and(path("/v1/images/generations"))
            .and(body_partial_json(serde_json::json!({"response_format": "b64_json"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"b64_json": BASE64_STANDARD.encode(PNG_BYTES)}]
            })))
            .mount(&server)
            .await;

        let options = ImageOptions {
            response_format: ResponseFormat::B64Json,
            ..options_in(dir.path(), ImageSize::Medium, 1)
        };
        let paths = client(&server).generate_image("cat", &options).await;

        assert_eq!(paths.len(), 1);
        assert_eq!(std::fs::read(&paths[0]).unwrap(), PNG_BYTES);
    }

    #[tokio::test]
    async fn failed_download_is_skipped() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        Mock::given(method("POST"))
            .and(path("/v1/images/generations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [
                    {"url": format!("{}/files/ok.png", server.uri())},
                    {"url": format!("{}/files/gone.png", server.uri())},
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/ok.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(PNG_BYTES))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/gone.png"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let paths = client(&server)
            .generate_image("x", &options_in(dir.path(), ImageSize::Large, 2))
            .await;

        assert_eq!(paths.len(), 1);
        assert!(file_name(&paths[0]).starts_with("gpt-generate-0-"));
    }

    #[tokio::test]
    async fn error_status_yields_no_images() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": {"message": "bad prompt", "type": "invalid_request_error"}
            })))
            .mount(&server)
            .await;

        let client = client(&server);
        let options = options_in(dir.path(), ImageSize::Small, 1);
        match client.try_generate_image("x", &options).await {
            Err(Error::Request { status, body }) => {
                assert_eq!(status, 400);
                assert_eq!(body, "bad prompt");
            }
            other => panic!("expected a request error, got {other:?}"),
        }
        assert!(client.generate_image("x", &options).await.is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn uploads_source_image_for_variation() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.png");
        std::fs::write(&source, PNG_BYTES).unwrap();
        let out = dir.path().join("out");

        Mock::given(method("POST"))
            .and(path("/v1/images/variations"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"b64_json": BASE64_STANDARD.encode(PNG_BYTES)}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let paths = client(&server)
            .generate_variation(&source, &options_in(&out, ImageSize::Small, 1))
            .await;

        assert_eq!(paths.len(), 1);
        assert!(paths[0].starts_with(&out));
        assert!(file_name(&paths[0]).starts_with("gpt-variation-0-"));

        let requests = server.received_requests().await.unwrap();
        let body = String::from_utf8_lossy(&requests[0].body);
        assert!(body.contains("name=\"image\""));
        assert!(body.contains("256x256"));
    }

    #[tokio::test]
    async fn missing_source_image_yields_no_request() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let client = client(&server);
        let missing = dir.path().join("missing.png");
        let options = options_in(dir.path(), ImageSize::Small, 1);

        assert!(matches!(
            client.try_generate_variation(&missing, &options).await,
            Err(Error::FileIo { .. })
        ));
        assert!(client.generate_variation(&missing, &options).await.is_empty());
    }

    #[tokio::test]
    async fn empty_image_data_is_not_saved() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        Mock::given(method("POST"))
            .and(path("/v1/images/generations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [
                    {"b64_json": ""},
                    {"url": format!("{}/files/empty.png", server.uri())},
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/empty.png"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let paths = client(&server)
            .generate_image("x", &options_in(dir.path(), ImageSize::Small, 2))
            .await;

        assert!(paths.is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    fn three_images() -> serde_json::Value {
        let data = BASE64_STANDARD.encode(PNG_BYTES);
        serde_json::json!({
            "data": [{"b64_json": data}, {"b64_json": data}, {"b64_json": data}]
        })
    }

    #[tokio::test]
    async fn extra_generated_images_are_ignored() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        Mock::given(method("POST"))
            .and(path("/v1/images/generations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(three_images()))
            .mount(&server)
            .await;

        let paths = client(&server)
            .generate_image("x", &options_in(dir.path(), ImageSize::Small, 2))
            .await;

        assert_eq!(paths.len(), 2);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[tokio::test]
    async fn extra_variations_are_ignored() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.png");
        std::fs::write(&source, PNG_BYTES).unwrap();
        let out = dir.path().join("out");

        Mock::given(method("POST"))
            .and(path("/v1/images/variations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(three_images()))
            .mount(&server)
            .await;

        let paths = client(&server)
            .generate_variation(&source, &options_in(&out, ImageSize::Small, 1))
            .await;

        assert_eq!(paths.len(), 1);
        assert_eq!(std::fs::read_dir(&out).unwrap().count(), 1);
    }

    /// Switches the process working directory and restores it when dropped.
    struct WorkingDir {
        previous: PathBuf,
    }

    impl WorkingDir {
        fn enter(dir: &Path) -> Self {
            let previous = std::env::current_dir().unwrap();
            std::env::set_current_dir(dir).unwrap();
            WorkingDir { previous }
        }
    }

    impl Drop for WorkingDir {
        fn drop(&mut self) {
            let _ = std::env::set_current_dir(&self.previous);
        }
    }

    // The only test that changes the working directory; every other test
    // passes absolute paths.
    #[tokio::test]
    async fn relative_paths_resolve_against_working_directory() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::write(root.join("source.png"), PNG_BYTES).unwrap();

        Mock::given(method("POST"))
            .and(path("/v1/images/variations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"b64_json": BASE64_STANDARD.encode(PNG_BYTES)}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let _cwd = WorkingDir::enter(&root);
        assert_eq!(
            absolute(Path::new("source.png")).unwrap(),
            root.join("source.png")
        );

        let options = ImageOptions {
            save_path: None,
            ..options_in(&root, ImageSize::Small, 1)
        };
        let paths = client(&server)
            .generate_variation(Path::new("source.png"), &options)
            .await;

        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].parent(), Some(root.as_path()));
        assert!(file_name(&paths[0]).starts_with("gpt-variation-0-"));
    }
}

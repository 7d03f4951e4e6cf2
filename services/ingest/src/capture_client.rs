//! Capture client: finds and downloads the image a camera page displays.
//!
//! The scheduler only talks to the [`CaptureClient`] trait. The HTTP
//! implementation here keeps one [`PageSession`] per camera on top of a
//! single shared `reqwest` client, so cookies and pooled connections are
//! reused across every camera and cycle.

use crate::camera::CameraDescriptor;
use crate::config::ClientConfig;
use async_trait::async_trait;
use bytes::Bytes;
use regex::Regex;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client, Url};
use std::sync::LazyLock;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Minimum declared edge, in pixels, for an `<img>` to count as the feed.
const MIN_FEED_EDGE: u32 = 80;

static IMG_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<img\b[^>]*>").expect("valid regex"));
static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)\b(src|width|height)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>]+))"#)
        .expect("valid regex")
});

/// Errors that can occur while capturing.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} answered with HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("{url} returned an empty body")]
    EmptyBody { url: String },

    #[error("invalid url '{0}'")]
    InvalidUrl(String),

    #[error("capture session unavailable: {0}")]
    Session(String),
}

/// Bytes fetched for a located image.
#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub bytes: Bytes,
    pub content_type: Option<String>,
    /// URL the bytes actually came from
    pub url: String,
}

/// Source of camera images.
///
/// Implementations must be safe to retry: calling `locate_displayed_image`
/// or `fetch` again has no effect beyond producing a fresh result.
#[async_trait]
pub trait CaptureClient: Send + Sync + 'static {
    /// Per-camera state kept for the life of the process.
    type Session: Send + 'static;

    /// Open the long-lived session for one camera.
    async fn open_session(&self, camera: &CameraDescriptor) -> Result<Self::Session, CaptureError>;

    /// URL of the image the camera page currently shows, if any.
    async fn locate_displayed_image(
        &self,
        session: &mut Self::Session,
    ) -> Result<Option<String>, CaptureError>;

    /// Download the bytes behind `url`.
    async fn fetch(&self, session: &mut Self::Session, url: &str)
        -> Result<FetchedImage, CaptureError>;

    /// Release the session. Failures are logged, never returned.
    async fn close_session(&self, session: Self::Session);
}

/// Session state for one camera page.
#[derive(Debug)]
pub struct PageSession {
    cam_id: String,
    page_url: Url,
    /// Body of a page that was itself an image, reused by the next fetch.
    direct: Option<FetchedImage>,
}

impl PageSession {
    pub fn page_url(&self) -> &Url {
        &self.page_url
    }
}

/// Capture client over plain HTTP.
#[derive(Debug, Clone)]
pub struct HttpCaptureClient {
    http: Client,
    warm_up_url: Option<String>,
}

impl HttpCaptureClient {
    /// Build the shared HTTP context.
    pub fn new(config: &ClientConfig) -> Result<Self, CaptureError> {
        let mut headers = HeaderMap::new();
        let mut insert = |name: header::HeaderName, value: &str| -> Result<(), CaptureError> {
            let value = HeaderValue::from_str(value)
                .map_err(|e| CaptureError::Session(format!("invalid {name} header: {e}")))?;
            headers.insert(name, value);
            Ok(())
        };
        insert(header::ACCEPT_LANGUAGE, &config.accept_language)?;
        if let Some(referer) = &config.referer {
            insert(header::REFERER, referer)?;
        }
        if let Some(origin) = &config.origin {
            insert(header::ORIGIN, origin)?;
        }

        let http = Client::builder()
            .cookie_store(true)
            .user_agent(config.user_agent.as_str())
            .default_headers(headers)
            .timeout(config.page_timeout())
            .build()
            .map_err(|e| CaptureError::Session(format!("failed to build HTTP client: {e}")))?;

        if !config.headless {
            info!("Headful mode requested; the HTTP capture client has no window to show");
        }

        Ok(Self {
            http,
            warm_up_url: config.warm_up_url.clone(),
        })
    }

    /// Seed session cookies before the first cycle. Best effort.
    pub async fn warm_up(&self) {
        let Some(url) = &self.warm_up_url else {
            return;
        };

        match self.http.get(url).send().await {
            Ok(response) => info!(url = %url, status = response.status().as_u16(), "Warm-up request done"),
            Err(e) => warn!(url = %url, error = %e, "Warm-up request failed"),
        }
    }

    async fn get(&self, url: &str, referer: Option<&Url>) -> Result<FetchedImage, CaptureError> {
        let mut request = self.http.get(url);
        if let Some(referer) = referer {
            request = request.header(header::REFERER, referer.as_str());
        }

        let response = request.send().await.map_err(|source| CaptureError::Request {
            url: url.to_string(),
            source,
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(CaptureError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await.map_err(|source| CaptureError::Request {
            url: url.to_string(),
            source,
        })?;

        Ok(FetchedImage {
            bytes,
            content_type,
            url: final_url,
        })
    }
}

#[async_trait]
impl CaptureClient for HttpCaptureClient {
    type Session = PageSession;

    async fn open_session(&self, camera: &CameraDescriptor) -> Result<PageSession, CaptureError> {
        let endpoint = camera
            .endpoint()
            .ok_or_else(|| CaptureError::Session(format!("camera {} has no endpoint", camera.cam_id)))?;
        let page_url = Url::parse(endpoint).map_err(|_| CaptureError::InvalidUrl(endpoint.to_string()))?;

        Ok(PageSession {
            cam_id: camera.cam_id.clone(),
            page_url,
            direct: None,
        })
    }

    #[instrument(skip(self, session), fields(cam_id = %session.cam_id))]
    async fn locate_displayed_image(
        &self,
        session: &mut PageSession,
    ) -> Result<Option<String>, CaptureError> {
        session.direct = None;
        let page = self.get(session.page_url.as_str(), None).await?;

        let is_image = page
            .content_type
            .as_deref()
            .is_some_and(|ct| ct.to_ascii_lowercase().starts_with("image/"));
        if is_image {
            let url = page.url.clone();
            session.direct = Some(page);
            return Ok(Some(url));
        }

        let html = String::from_utf8_lossy(&page.bytes);
        let found = pick_displayed_image(&html, &session.page_url);
        debug!(found = ?found, "Located displayed image");
        Ok(found)
    }

    #[instrument(skip(self, session), fields(cam_id = %session.cam_id))]
    async fn fetch(&self, session: &mut PageSession, url: &str) -> Result<FetchedImage, CaptureError> {
        if let Some(direct) = session.direct.take() {
            if direct.url == url {
                if direct.bytes.is_empty() {
                    return Err(CaptureError::EmptyBody { url: direct.url });
                }
                return Ok(direct);
            }
        }

        let fetched = self.get(url, Some(&session.page_url)).await?;
        if fetched.bytes.is_empty() {
            return Err(CaptureError::EmptyBody { url: fetched.url });
        }
        Ok(fetched)
    }

    async fn close_session(&self, session: PageSession) {
        debug!(cam_id = %session.cam_id, "Capture session closed");
    }
}

/// One `<img>` candidate found in a page.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ImgCandidate {
    src: String,
    width: Option<u32>,
    height: Option<u32>,
}

impl ImgCandidate {
    fn feed_area(&self) -> Option<u64> {
        match (self.width, self.height) {
            (Some(w), Some(h)) if w >= MIN_FEED_EDGE && h >= MIN_FEED_EDGE => {
                Some(u64::from(w) * u64::from(h))
            }
            _ => None,
        }
    }
}

fn leading_number(value: &str) -> Option<u32> {
    let digits: String = value.trim().chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

fn img_candidates(html: &str) -> Vec<ImgCandidate> {
    IMG_TAG_RE
        .find_iter(html)
        .filter_map(|tag| {
            let mut candidate = ImgCandidate {
                src: String::new(),
                width: None,
                height: None,
            };
            for attr in ATTR_RE.captures_iter(tag.as_str()) {
                let value = attr
                    .get(2)
                    .or_else(|| attr.get(3))
                    .or_else(|| attr.get(4))
                    .map(|m| m.as_str())
                    .unwrap_or_default();
                match attr[1].to_ascii_lowercase().as_str() {
                    "src" => candidate.src = value.trim().replace("&amp;", "&"),
                    "width" => candidate.width = leading_number(value),
                    "height" => candidate.height = leading_number(value),
                    _ => {}
                }
            }
            let usable = !candidate.src.is_empty()
                && !candidate.src.to_ascii_lowercase().starts_with("data:");
            usable.then_some(candidate)
        })
        .collect()
}

/// Pick the feed image of a page: the largest `<img>` with both declared
/// edges of at least 80 pixels, otherwise the first usable one.
fn pick_displayed_image(html: &str, page_url: &Url) -> Option<String> {
    let candidates = img_candidates(html);

    let chosen = candidates
        .iter()
        .filter_map(|c| c.feed_area().map(|area| (area, c)))
        // max_by_key keeps the last maximum; reverse so ties go to the first.
        .rev()
        .max_by_key(|(area, _)| *area)
        .map(|(_, c)| c)
        .or_else(|| candidates.first())?;

    page_url.join(&chosen.src).ok().map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> Url {
        Url::parse("http://giaothong.example/expandcameraplayer/?camId=abc").unwrap()
    }

    #[test]
    fn test_picks_largest_feed_image() {
        let html = r#"
            <img src="/logo.png" width="40" height="40">
            <img src='data:image/png;base64,AAAA' width="900" height="600">
            <IMG SRC="/render/ImageHandler.ashx?id=abc&amp;t=1" WIDTH=640 HEIGHT=480>
            <img src="/small.jpg" width="320px" height="240px">
        "#;
        assert_eq!(
            pick_displayed_image(html, &page()).as_deref(),
            Some("http://giaothong.example/render/ImageHandler.ashx?id=abc&t=1")
        );
    }

    #[test]
    fn test_falls_back_to_first_usable_image() {
        let html = r#"<img src=""><img src="snap.jpg"><img src="other.jpg">"#;
        assert_eq!(
            pick_displayed_image(html, &page()).as_deref(),
            Some("http://giaothong.example/expandcameraplayer/snap.jpg")
        );
    }

    #[test]
    fn test_ties_keep_document_order() {
        let html = r#"<img src="a.jpg" width="100" height="100"><img src="b.jpg" width="100" height="100">"#;
        assert!(pick_displayed_image(html, &page()).unwrap().ends_with("/a.jpg"));
    }

    #[test]
    fn test_no_image() {
        assert_eq!(pick_displayed_image("<p>camera offline</p>", &page()), None);
        assert_eq!(
            pick_displayed_image(r#"<img src="data:image/gif;base64,R0lG">"#, &page()),
            None
        );
    }

    #[tokio::test]
    async fn test_session_requires_endpoint() {
        let client = HttpCaptureClient::new(&ClientConfig::default()).unwrap();
        let camera = CameraDescriptor {
            cam_id: "c1".into(),
            code: None,
            title: None,
            source_endpoint: None,
        };
        assert!(matches!(
            client.open_session(&camera).await,
            Err(CaptureError::Session(_))
        ));

        let camera = CameraDescriptor {
            source_endpoint: Some("not a url".into()),
            ..camera
        };
        assert!(matches!(
            client.open_session(&camera).await,
            Err(CaptureError::InvalidUrl(_))
        ));
    }
}

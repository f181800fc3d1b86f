use std::time::Duration;

use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::debug;

use super::{BoxFuture, PledgeOutcome, RecordStore, StoreError};
use crate::domain::{
    Fund, GalleryImage, GuestbookEntry, NewGalleryImage, NewGuestbookEntry, NewPledge, Pledge,
    RecordKind,
};

const BACKEND: &str = "remote";
pub const API_KEY_HEADER: &str = "x-api-key";

/// Durable backend reached over HTTP: another deployment of this service's
/// JSON API (`/funds`, `/pledge`, `/guestbook`, `/gallery`).
pub struct RemoteStore {
    base: String,
    /// Root-relative image URLs from the upstream (its signed blob links) are
    /// resolved against this so browsers fetch them from the upstream.
    origin: Option<Url>,
    api_key: Option<String>,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct PledgeBody<'a> {
    fund_id: &'a str,
    amount: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
}

#[derive(Deserialize)]
struct PledgeResponse {
    fund: Fund,
    #[serde(default)]
    pledge: Option<Pledge>,
}

#[derive(Serialize)]
struct GalleryBody<'a> {
    src: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    caption: Option<&'a str>,
    tags: &'a [String],
}

impl RemoteStore {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .user_agent(format!("housewarming/{}", crate::version::VERSION))
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::unavailable(BACKEND, format!("build http client: {e}")))?;
        let base = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            origin: Url::parse(&base).ok(),
            base,
            api_key: api_key.filter(|k| !k.is_empty()),
            client,
        })
    }

    fn absolutize(&self, raw: String) -> String {
        if !raw.starts_with('/') || raw.starts_with("//") {
            return raw;
        }
        match self.origin.as_ref().and_then(|o| o.join(&raw).ok()) {
            Some(url) => url.into(),
            None => raw,
        }
    }

    fn fix_fund(&self, mut fund: Fund) -> Fund {
        fund.image = fund.image.map(|i| self.absolutize(i));
        fund
    }

    fn fix_entry(&self, mut entry: GuestbookEntry) -> GuestbookEntry {
        entry.image_url = entry.image_url.map(|u| self.absolutize(u));
        entry
    }

    fn fix_image(&self, mut image: GalleryImage) -> GalleryImage {
        image.src = self.absolutize(image.src);
        image
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.header(API_KEY_HEADER, key),
            None => req,
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        kind: RecordKind,
    ) -> Result<T, StoreError> {
        let resp = self
            .authed(self.client.get(self.url(path)))
            .send()
            .await
            .map_err(|e| StoreError::unavailable(BACKEND, e))?;
        decode(resp, kind, path).await
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        kind: RecordKind,
        key: &str,
    ) -> Result<T, StoreError> {
        let resp = self
            .authed(self.client.post(self.url(path)))
            .json(body)
            .send()
            .await
            .map_err(|e| StoreError::unavailable(BACKEND, e))?;
        decode(resp, kind, key).await
    }
}

async fn decode<T: DeserializeOwned>(
    resp: reqwest::Response,
    kind: RecordKind,
    key: &str,
) -> Result<T, StoreError> {
    let status = resp.status();
    if status.is_success() {
        return resp
            .json::<T>()
            .await
            .map_err(|e| StoreError::unavailable(BACKEND, format!("decode response: {e}")));
    }

    let body = resp.text().await.unwrap_or_default();
    let reason = error_message(&body).unwrap_or_else(|| status.to_string());
    debug!(%status, %reason, "upstream record api returned an error");

    match status {
        StatusCode::NOT_FOUND => Err(StoreError::NotFound {
            kind,
            key: key.to_string(),
        }),
        s if s.is_client_error()
            && s != StatusCode::REQUEST_TIMEOUT
            && s != StatusCode::TOO_MANY_REQUESTS =>
        {
            Err(StoreError::Rejected {
                backend: BACKEND,
                status: s.as_u16(),
                reason,
            })
        }
        _ => Err(StoreError::unavailable(BACKEND, format!("{status}: {reason}"))),
    }
}

/// Understands both `{"error": "..."}` and `{"error": {"message": "..."}}` bodies.
fn error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    match value.get("error")? {
        Value::String(s) => Some(s.clone()),
        Value::Object(obj) => obj.get("message")?.as_str().map(str::to_string),
        _ => None,
    }
}

impl RecordStore for RemoteStore {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    fn stores_blob_keys(&self) -> bool {
        false
    }

    fn list_funds(&self) -> BoxFuture<'_, Result<Vec<Fund>, StoreError>> {
        Box::pin(async move {
            let funds: Vec<Fund> = self.get_json("/funds", RecordKind::Fund).await?;
            Ok(funds.into_iter().map(|f| self.fix_fund(f)).collect())
        })
    }

    fn get_fund(&self, fund_id: &str) -> BoxFuture<'_, Result<Option<Fund>, StoreError>> {
        let fund_id = fund_id.to_string();
        Box::pin(async move {
            let funds = self.list_funds().await?;
            Ok(funds.into_iter().find(|f| f.fund_id == fund_id))
        })
    }

    fn apply_pledge(
        &self,
        fund_id: &str,
        pledge: NewPledge,
    ) -> BoxFuture<'_, Result<PledgeOutcome, StoreError>> {
        let fund_id = fund_id.to_string();
        Box::pin(async move {
            let body = PledgeBody {
                fund_id: &fund_id,
                amount: pledge.amount,
                name: pledge.name.as_deref(),
                message: pledge.message.as_deref(),
            };
            let resp: PledgeResponse = self
                .post_json("/pledge", &body, RecordKind::Fund, &fund_id)
                .await?;

            // Older upstreams answer with the fund only; the pledge row id is then unknown.
            let pledge = resp.pledge.unwrap_or(Pledge {
                id: 0,
                fund_id,
                amount: pledge.amount,
                name: pledge.name,
                message: pledge.message,
                created_at: pledge.created_at,
            });
            Ok(PledgeOutcome {
                fund: self.fix_fund(resp.fund),
                pledge,
            })
        })
    }

    fn list_guestbook(&self) -> BoxFuture<'_, Result<Vec<GuestbookEntry>, StoreError>> {
        Box::pin(async move {
            let entries: Vec<GuestbookEntry> =
                self.get_json("/guestbook", RecordKind::GuestbookEntry).await?;
            Ok(entries.into_iter().map(|e| self.fix_entry(e)).collect())
        })
    }

    fn create_guestbook_entry(
        &self,
        entry: NewGuestbookEntry,
    ) -> BoxFuture<'_, Result<GuestbookEntry, StoreError>> {
        Box::pin(async move {
            let entries: Vec<GuestbookEntry> = self
                .post_json("/guestbook", &entry, RecordKind::GuestbookEntry, "")
                .await?;
            entries
                .into_iter()
                .find(|e| e.message == entry.message && e.created_at == entry.created_at)
                .map(|e| self.fix_entry(e))
                .ok_or_else(|| {
                    StoreError::unavailable(BACKEND, "response did not include the new entry")
                })
        })
    }

    fn list_gallery(&self) -> BoxFuture<'_, Result<Vec<GalleryImage>, StoreError>> {
        Box::pin(async move {
            let images: Vec<GalleryImage> =
                self.get_json("/gallery", RecordKind::GalleryImage).await?;
            Ok(images.into_iter().map(|i| self.fix_image(i)).collect())
        })
    }

    fn create_gallery_image(
        &self,
        image: NewGalleryImage,
    ) -> BoxFuture<'_, Result<GalleryImage, StoreError>> {
        Box::pin(async move {
            let body = GalleryBody {
                src: &image.src,
                caption: image.caption.as_deref(),
                tags: &image.tags,
            };
            let images: Vec<GalleryImage> = self
                .post_json("/gallery", &body, RecordKind::GalleryImage, "")
                .await?;
            // The upstream stamps its own time and may rewrite `src`, so match
            // on what it keeps verbatim. The list is newest first.
            images
                .into_iter()
                .find(|i| i.caption == image.caption && i.tags == image.tags)
                .map(|i| self.fix_image(i))
                .ok_or_else(|| {
                    StoreError::unavailable(BACKEND, "response did not include the new image")
                })
        })
    }
}

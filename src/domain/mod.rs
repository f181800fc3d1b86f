use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const ANONYMOUS_GUEST_NAME: &str = "A friendly ghost";
pub const DEFAULT_GUESTBOOK_IMAGE_ALT: &str = "Guestbook upload";
pub const GALLERY_FILTER_ALL: &str = "all";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    MissingField { field: &'static str },
    EmptyMessage,
    InvalidTags { reason: String },
    InvalidTimestamp { value: String },
    InvalidAmount { reason: String },
    FundNotFound { fund_id: String },
}

impl DomainError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::FundNotFound { .. } => "not_found",
            Self::MissingField { .. }
            | Self::EmptyMessage
            | Self::InvalidTags { .. }
            | Self::InvalidTimestamp { .. }
            | Self::InvalidAmount { .. } => "invalid_request",
        }
    }
}

impl std::fmt::Display for DomainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingField { field } => write!(f, "{field} is required"),
            Self::EmptyMessage => write!(f, "message is required"),
            Self::InvalidTags { reason } => write!(f, "invalid tags: {reason}"),
            Self::InvalidTimestamp { value } => write!(f, "invalid created_at: {value}"),
            Self::InvalidAmount { reason } => write!(f, "invalid pledge amount: {reason}"),
            Self::FundNotFound { fund_id } => write!(f, "fund not found: {fund_id}"),
        }
    }
}

impl std::error::Error for DomainError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Fund,
    Pledge,
    GuestbookEntry,
    GalleryImage,
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Fund => "fund",
            Self::Pledge => "pledge",
            Self::GuestbookEntry => "guestbook_entry",
            Self::GalleryImage => "gallery_image",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Fund {
    pub fund_id: String,
    pub name: String,
    pub description: String,
    pub current: i64,
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pledge {
    pub id: i64,
    pub fund_id: String,
    pub amount: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GuestbookEntry {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    pub message: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub image_alt: Option<String>,
    pub created_at: String,
}

impl GuestbookEntry {
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(ANONYMOUS_GUEST_NAME)
    }

    /// Alt text for the attached image; `None` when there is no image.
    pub fn display_alt(&self) -> Option<&str> {
        self.image_url.as_ref()?;
        Some(
            self.image_alt
                .as_deref()
                .filter(|a| !a.is_empty())
                .unwrap_or(DEFAULT_GUESTBOOK_IMAGE_ALT),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GalleryImage {
    pub id: i64,
    pub src: String,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: String,
}

impl GalleryImage {
    pub fn has_tag(&self, tag: &str) -> bool {
        tag == GALLERY_FILTER_ALL || self.tags.iter().any(|t| t == tag)
    }
}

/// A row of any kind, as returned by the kind-generic store calls.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Record {
    Fund(Fund),
    Pledge(Pledge),
    GuestbookEntry(GuestbookEntry),
    GalleryImage(GalleryImage),
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Fund(_) => RecordKind::Fund,
            Self::Pledge(_) => RecordKind::Pledge,
            Self::GuestbookEntry(_) => RecordKind::GuestbookEntry,
            Self::GalleryImage(_) => RecordKind::GalleryImage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPledge {
    pub amount: i64,
    pub name: Option<String>,
    pub message: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewGuestbookEntry {
    pub name: Option<String>,
    pub message: String,
    pub image_url: Option<String>,
    pub image_alt: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewGalleryImage {
    pub src: String,
    pub caption: Option<String>,
    pub tags: Vec<String>,
    pub created_at: String,
}

/// Loosely typed guestbook body as posted by the site's form script.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GuestbookInput {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub image_alt: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Loosely typed gallery body; `tags` stays a raw value so a non-array can be
/// rejected with a precise message instead of a generic decode failure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GalleryInput {
    #[serde(default)]
    pub src: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub tags: Option<Value>,
}

pub fn now_rfc3339() -> String {
    format_timestamp(Utc::now())
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Newest first. Unparseable timestamps sort as oldest.
pub fn sort_newest_first<T>(items: &mut [T], created_at: impl Fn(&T) -> &str) {
    items.sort_by_key(|item| std::cmp::Reverse(parse_timestamp(created_at(item))));
}

pub fn normalize_optional(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn validate_guestbook_input(
    input: GuestbookInput,
    now: &str,
) -> Result<NewGuestbookEntry, DomainError> {
    let message = input.message.unwrap_or_default().trim().to_string();
    if message.is_empty() {
        return Err(DomainError::EmptyMessage);
    }

    let created_at = match normalize_optional(input.created_at) {
        Some(value) => {
            let parsed =
                parse_timestamp(&value).ok_or(DomainError::InvalidTimestamp { value })?;
            format_timestamp(parsed)
        }
        None => now.to_string(),
    };

    Ok(NewGuestbookEntry {
        name: normalize_optional(input.name),
        message,
        image_url: normalize_optional(input.image_url),
        image_alt: normalize_optional(input.image_alt),
        created_at,
    })
}

pub fn validate_gallery_input(
    input: GalleryInput,
    now: &str,
) -> Result<NewGalleryImage, DomainError> {
    let src = normalize_optional(input.src).ok_or(DomainError::MissingField { field: "src" })?;
    let tags = parse_tags(input.tags)?;

    Ok(NewGalleryImage {
        src,
        caption: normalize_optional(input.caption),
        tags,
        created_at: now.to_string(),
    })
}

fn parse_tags(raw: Option<Value>) -> Result<Vec<String>, DomainError> {
    let items = match raw {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(items)) => items,
        Some(other) => {
            return Err(DomainError::InvalidTags {
                reason: format!("expected an array, got {}", json_type_name(&other)),
            });
        }
    };

    let mut tags = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::String(tag) => {
                let tag = tag.trim();
                if !tag.is_empty() && !tags.iter().any(|t: &String| t == tag) {
                    tags.push(tag.to_string());
                }
            }
            other => {
                return Err(DomainError::InvalidTags {
                    reason: format!("expected strings, got {}", json_type_name(&other)),
                });
            }
        }
    }
    Ok(tags)
}

const MAX_EXACT_FLOAT_AMOUNT: f64 = 9_007_199_254_740_992.0;

/// Accepts JSON numbers and numeric strings; the amount must be a positive whole number.
pub fn parse_pledge_amount(raw: &Value) -> Result<i64, DomainError> {
    let invalid = |reason: &str| DomainError::InvalidAmount {
        reason: reason.to_string(),
    };

    // Integers are taken exactly; only non-integer input goes through f64.
    let exact = match raw {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    if let Some(amount) = exact {
        if amount <= 0 {
            return Err(invalid("amount must be greater than zero"));
        }
        return Ok(amount);
    }

    let value = match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| invalid("amount must be a number"))?;

    if !value.is_finite() {
        return Err(invalid("amount must be finite"));
    }
    if value <= 0.0 {
        return Err(invalid("amount must be greater than zero"));
    }
    if value.fract() != 0.0 {
        return Err(invalid("amount must be a whole number"));
    }
    // Beyond 2^53 a float no longer names a single whole number.
    if value > MAX_EXACT_FLOAT_AMOUNT {
        return Err(invalid("amount is too large"));
    }
    Ok(value as i64)
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub fn default_funds() -> Vec<Fund> {
    [
        (
            "stairs",
            "Back Stairs",
            "Safe, sturdy steps for the patio entrance.",
            "src/media/images/gift_stair.png",
        ),
        (
            "snowblower",
            "Snow Blower",
            "Clear the driveway when the winter ghosts roll in.",
            "src/media/images/gift_snowblower.png",
        ),
        (
            "outlets",
            "Basement Outlets",
            "Extra outlets for cozy movie nights downstairs.",
            "src/media/images/gift_outlets.png",
        ),
        (
            "mower",
            "Lawn Mower",
            "Keep the yard tidy all season long.",
            "src/media/images/gift_lawnmower.png",
        ),
        (
            "pets",
            "General Pet Care",
            "Feeding, Cleaning, and Homing the little beasts.",
            "src/media/images/gift_pet.png",
        ),
    ]
    .into_iter()
    .map(|(fund_id, name, description, image)| Fund {
        fund_id: fund_id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        current: 0,
        image: Some(image.to_string()),
    })
    .collect()
}

/// Tag-filtered projection of a gallery listing.
#[derive(Debug, Clone, Default)]
pub struct GalleryView {
    images: Vec<GalleryImage>,
}

impl GalleryView {
    pub fn new(images: Vec<GalleryImage>) -> Self {
        Self { images }
    }

    pub fn filter(&self, tag: &str) -> Vec<&GalleryImage> {
        self.images.iter().filter(|img| img.has_tag(tag)).collect()
    }
}

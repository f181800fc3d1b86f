//! Pledge lifecycle: `Received -> Validated -> Persisted -> Acknowledged`, or
//! `Received -> Rejected`. Each stage is its own type so a pledge cannot be
//! acknowledged without having been persisted.

use reqwest::Url;
use serde_json::Value;
use tracing::{debug, info};

use crate::{
    domain::{self, DomainError, Fund, NewPledge, Pledge, RecordKind},
    store::{PledgeOutcome, RecordStore, StoreError},
};

pub const VENMO_BASE_URL: &str = "https://venmo.com/";

pub trait PaymentLinkBuilder: Send + Sync + 'static {
    fn payment_link(&self, fund: &Fund, amount: i64) -> String;
}

#[derive(Debug)]
pub struct InvalidPaymentAccount {
    pub account: String,
}

impl std::fmt::Display for InvalidPaymentAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid payment account: {:?}", self.account)
    }
}

impl std::error::Error for InvalidPaymentAccount {}

/// `https://venmo.com/<account>?txn=pay&amount=<n>&note=Housewarming - <FUND>`.
#[derive(Debug, Clone)]
pub struct VenmoLinkBuilder {
    account_url: Url,
}

impl VenmoLinkBuilder {
    pub fn new(username: &str) -> Result<Self, InvalidPaymentAccount> {
        let invalid = || InvalidPaymentAccount {
            account: username.to_string(),
        };
        let username = username.trim();
        if username.is_empty() || username.contains(['/', '?', '#']) {
            return Err(invalid());
        }
        let account_url = Url::parse(VENMO_BASE_URL)
            .and_then(|base| base.join(username))
            .map_err(|_| invalid())?;
        Ok(Self { account_url })
    }
}

impl PaymentLinkBuilder for VenmoLinkBuilder {
    fn payment_link(&self, fund: &Fund, amount: i64) -> String {
        let mut url = self.account_url.clone();
        url.query_pairs_mut()
            .append_pair("txn", "pay")
            .append_pair("amount", &amount.to_string())
            .append_pair(
                "note",
                &format!("Housewarming - {}", fund.name.to_uppercase()),
            );
        url.into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PledgeRejection {
    InvalidAmount(DomainError),
    FundNotFound { fund_id: String },
}

impl std::fmt::Display for PledgeRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidAmount(e) => write!(f, "{e}"),
            Self::FundNotFound { fund_id } => write!(f, "fund not found: {fund_id}"),
        }
    }
}

impl std::error::Error for PledgeRejection {}

#[derive(Debug)]
pub enum PledgeError {
    Rejected(PledgeRejection),
    Store(StoreError),
}

impl std::fmt::Display for PledgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected(e) => write!(f, "pledge rejected: {e}"),
            Self::Store(e) => write!(f, "pledge not recorded: {e}"),
        }
    }
}

impl std::error::Error for PledgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Rejected(e) => Some(e),
            Self::Store(e) => Some(e),
        }
    }
}

impl From<PledgeRejection> for PledgeError {
    fn from(value: PledgeRejection) -> Self {
        Self::Rejected(value)
    }
}

impl From<StoreError> for PledgeError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound {
                kind: RecordKind::Fund,
                key,
            } => Self::Rejected(PledgeRejection::FundNotFound { fund_id: key }),
            StoreError::Domain(DomainError::FundNotFound { fund_id }) => {
                Self::Rejected(PledgeRejection::FundNotFound { fund_id })
            }
            StoreError::Domain(e @ DomainError::InvalidAmount { .. }) => {
                Self::Rejected(PledgeRejection::InvalidAmount(e))
            }
            other => Self::Store(other),
        }
    }
}

/// A pledge as submitted. `amount` stays untyped until validation so form
/// strings like `"50"` are accepted.
#[derive(Debug, Clone)]
pub struct PledgeRequest {
    pub fund_id: String,
    pub amount: Value,
    pub name: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ValidatedPledge {
    fund: Fund,
    pledge: NewPledge,
}

#[derive(Debug, Clone)]
pub struct PersistedPledge {
    outcome: PledgeOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PledgeReceipt {
    pub fund: Fund,
    pub pledge: Pledge,
    pub redirect_url: String,
}

impl PledgeRequest {
    pub async fn validate(self, store: &dyn RecordStore) -> Result<ValidatedPledge, PledgeError> {
        let amount = domain::parse_pledge_amount(&self.amount).map_err(|e| {
            debug!(fund_id = %self.fund_id, error = %e, "pledge rejected");
            PledgeRejection::InvalidAmount(e)
        })?;

        let fund_id = self.fund_id.trim().to_string();
        let not_found = || PledgeRejection::FundNotFound {
            fund_id: fund_id.clone(),
        };
        if fund_id.is_empty() {
            return Err(not_found().into());
        }
        let Some(fund) = store.get_fund(&fund_id).await? else {
            debug!(%fund_id, "pledge rejected: unknown fund");
            return Err(not_found().into());
        };

        debug!(%fund_id, amount, "pledge validated");
        Ok(ValidatedPledge {
            fund,
            pledge: NewPledge {
                amount,
                name: domain::normalize_optional(self.name),
                message: domain::normalize_optional(self.message),
                created_at: domain::now_rfc3339(),
            },
        })
    }
}

impl ValidatedPledge {
    pub fn fund(&self) -> &Fund {
        &self.fund
    }

    pub fn amount(&self) -> i64 {
        self.pledge.amount
    }

    /// Increment and log insert happen as one unit in the store.
    pub async fn persist(self, store: &dyn RecordStore) -> Result<PersistedPledge, PledgeError> {
        let outcome = store.apply_pledge(&self.fund.fund_id, self.pledge).await?;
        info!(
            backend = store.backend(),
            fund_id = %outcome.fund.fund_id,
            amount = outcome.pledge.amount,
            current = outcome.fund.current,
            "pledge persisted"
        );
        Ok(PersistedPledge { outcome })
    }
}

impl PersistedPledge {
    pub fn acknowledge(self, links: &dyn PaymentLinkBuilder) -> PledgeReceipt {
        let PledgeOutcome { fund, pledge } = self.outcome;
        let redirect_url = links.payment_link(&fund, pledge.amount);
        debug!(fund_id = %fund.fund_id, "pledge acknowledged");
        PledgeReceipt {
            fund,
            pledge,
            redirect_url,
        }
    }
}

pub struct PledgeEngine {
    links: Box<dyn PaymentLinkBuilder>,
}

impl PledgeEngine {
    pub fn new(links: impl PaymentLinkBuilder) -> Self {
        Self {
            links: Box::new(links),
        }
    }

    /// No retries: a failed persist is reported as is.
    pub async fn submit(
        &self,
        store: &dyn RecordStore,
        request: PledgeRequest,
    ) -> Result<PledgeReceipt, PledgeError> {
        let validated = request.validate(store).await?;
        let persisted = validated.persist(store).await?;
        Ok(persisted.acknowledge(self.links.as_ref()))
    }
}

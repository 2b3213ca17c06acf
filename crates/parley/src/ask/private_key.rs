//! Three-question interrogation gating private key export.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use super::{AskUserError, answer_text};
use crate::error::{ParleyError, ParleyResult};
use crate::settings::SettingsStore;

/// Key of the export ask error, also the settings scope of its decisions.
pub const PRIVATE_KEY_EXPORT_KEY: &str = "AskUserPrivateKeyExport";
/// Settings key of the export lock.
pub const LOCKED_KEY: &str = "LockedAskUserPrivateKeyExport";

const FIRST_QUESTION: &str = "Before your private keys are exported, please answer 3 questions. \
Never share your private keys with anyone you do not know and trust.\n\
1. Why are you sharing your private key?";
const SECOND_QUESTION: &str =
    "2. Who specifically requested your private key, and how did they contact you?";
const THIRD_QUESTION: &str =
    "3. Were you promised any benefits, rewards, or solutions in return for your private key?";

const DECISION_TTL_SECS: i64 = 10;
const LOCK_TTL_DAYS: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionLevel {
    Low,
    Medium,
    High,
}

impl DecisionLevel {
    pub fn allows_export(&self) -> bool {
        matches!(self, Self::Low | Self::Medium)
    }
}

/// Outcome of classifying the answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub level: DecisionLevel,
    pub explain: String,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
}

impl DecisionRecord {
    pub fn is_current(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_none_or(|expires| expires > now)
    }
}

/// Judges how likely the user is being scammed.
#[async_trait]
pub trait DecisionClassifier: Send + Sync {
    /// `answers` are the numbered answers, in question order.
    async fn classify(&self, answers: &[String]) -> anyhow::Result<DecisionRecord>;
}

/// Scores answers against common scam phrasing.
pub struct KeywordClassifier {
    keywords: Vec<String>,
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::new([
            "support",
            "admin",
            "telegram",
            "whatsapp",
            "discord",
            "airdrop",
            "reward",
            "prize",
            "giveaway",
            "double",
            "refund",
            "recover",
            "verify",
            "urgent",
            "investment",
            "guaranteed",
        ])
    }
}

impl KeywordClassifier {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.into().to_lowercase())
                .collect(),
        }
    }

    fn score(&self, answers: &[String]) -> usize {
        let text = answers.join("\n").to_lowercase();
        self.keywords
            .iter()
            .filter(|keyword| text.contains(keyword.as_str()))
            .count()
    }
}

#[async_trait]
impl DecisionClassifier for KeywordClassifier {
    async fn classify(&self, answers: &[String]) -> anyhow::Result<DecisionRecord> {
        let (level, explain) = match self.score(answers) {
            0 => (
                DecisionLevel::Low,
                "Keep your private key offline and never paste it into websites or chats.",
            ),
            1 => (
                DecisionLevel::Medium,
                "Some answers look like a common scam. Only share keys with devices you control.",
            ),
            _ => (
                DecisionLevel::High,
                "This looks like a scam. Nobody legitimate needs your private key. Export is locked.",
            ),
        };
        Ok(DecisionRecord {
            level,
            explain: explain.to_string(),
            expires: None,
        })
    }
}

/// Delegates classification to a remote service.
///
/// POSTs `{"answers": [...]}` and expects a [`DecisionRecord`] back.
pub struct HttpClassifier {
    client: reqwest::Client,
    url: String,
}

impl HttpClassifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl DecisionClassifier for HttpClassifier {
    async fn classify(&self, answers: &[String]) -> anyhow::Result<DecisionRecord> {
        let response = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "answers": answers }))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

/// The interrogation for one key namespace.
pub struct PrivateKeyExport {
    classifier: Arc<dyn DecisionClassifier>,
    settings: Arc<dyn SettingsStore>,
    namespace: String,
}

impl PrivateKeyExport {
    pub fn new(
        classifier: Arc<dyn DecisionClassifier>,
        settings: Arc<dyn SettingsStore>,
        namespace: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            classifier,
            settings,
            namespace: namespace.into(),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The first question of the chain.
    pub fn start(self: &Arc<Self>) -> AskUserError {
        let this = Arc::clone(self);
        question(FIRST_QUESTION, move |first| async move {
            let answers = vec![numbered(1, &first)];
            Ok((false, Some(this.second(answers).into())))
        })
    }

    fn second(self: Arc<Self>, answers: Vec<String>) -> AskUserError {
        question(SECOND_QUESTION, move |second| async move {
            let mut answers = answers;
            answers.push(numbered(2, &second));
            Ok((false, Some(self.third(answers).into())))
        })
    }

    fn third(self: Arc<Self>, answers: Vec<String>) -> AskUserError {
        question(THIRD_QUESTION, move |third| async move {
            let mut answers = answers;
            answers.push(numbered(3, &third));
            self.decide(&answers).await?;
            Ok((true, None))
        })
    }

    async fn decide(&self, answers: &[String]) -> anyhow::Result<DecisionRecord> {
        let mut decision = self.classifier.classify(answers).await?;
        let now = Utc::now();
        if decision.expires.is_none() {
            decision.expires = Some(now + chrono::Duration::seconds(DECISION_TTL_SECS));
        }

        self.settings
            .set(
                PRIVATE_KEY_EXPORT_KEY,
                &self.namespace,
                serde_json::to_value(&decision)?,
            )
            .await?;

        if decision.level.allows_export() {
            info!(namespace = %self.namespace, level = ?decision.level, "private key export decision stored");
        } else {
            let until = now + chrono::Duration::days(LOCK_TTL_DAYS);
            self.settings
                .set(PRIVATE_KEY_EXPORT_KEY, LOCKED_KEY, serde_json::to_value(until)?)
                .await?;
            warn!(namespace = %self.namespace, until = %until, "private key export locked");
        }
        Ok(decision)
    }

    /// The stored decision for this namespace.
    pub async fn decision(&self) -> ParleyResult<Option<DecisionRecord>> {
        let value = self
            .settings
            .get(PRIVATE_KEY_EXPORT_KEY, &self.namespace)
            .await?;
        value
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| ParleyError::Settings(format!("decision for {}: {}", self.namespace, e)))
    }

    /// When export is locked, the time the lock lifts.
    pub async fn locked_until(&self) -> ParleyResult<Option<DateTime<Utc>>> {
        let Some(value) = self.settings.get(PRIVATE_KEY_EXPORT_KEY, LOCKED_KEY).await? else {
            return Ok(None);
        };
        let until: DateTime<Utc> = serde_json::from_value(value)
            .map_err(|e| ParleyError::Settings(format!("export lock: {e}")))?;
        Ok((until > Utc::now()).then_some(until))
    }

    pub async fn is_locked(&self) -> ParleyResult<bool> {
        Ok(self.locked_until().await?.is_some())
    }

    /// Check whether export may proceed.
    ///
    /// Fails with the interrogation when no current decision exists, and with
    /// a `PrivateKeyLocked` error when export is locked or was refused.
    pub async fn authorize(self: &Arc<Self>) -> ParleyResult<DecisionRecord> {
        if let Some(until) = self.locked_until().await? {
            return Err(ParleyError::runtime(
                format!("Private key export is locked until {until}"),
                "PrivateKeyLocked",
                403,
            ));
        }

        match self.decision().await? {
            Some(decision) if decision.is_current(Utc::now()) => {
                if decision.level.allows_export() {
                    Ok(decision)
                } else {
                    Err(ParleyError::runtime(
                        decision.explain,
                        "PrivateKeyLocked",
                        403,
                    ))
                }
            }
            _ => Err(self.start().into()),
        }
    }
}

fn question<F, Fut>(text: &str, callback: F) -> AskUserError
where
    F: FnOnce(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<super::Handled>> + Send + 'static,
{
    AskUserError::new(text, callback).with_key(PRIVATE_KEY_EXPORT_KEY)
}

fn numbered(n: usize, answers: &[Value]) -> String {
    format!("{}. {}", n, answer_text(answers))
}

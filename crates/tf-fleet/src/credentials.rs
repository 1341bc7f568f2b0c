//! Credential rotation pool
//!
//! Outbound calls draw a credential from this pool and report how the
//! call went. Rate-limited and invalid credentials are parked with a
//! reset timestamp and reactivated lazily the next time the pool is
//! evaluated; there is no background sweep. Acquire never blocks: when
//! every credential is parked it hands back the one that resets soonest
//! and leaves the wait decision to the caller.

use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use chrono::{DateTime, Utc};
use tf_common::{CallOutcome, Credential, CredentialStatus, RotationStrategy};

#[derive(Debug, Clone)]
pub struct CredentialPoolConfig {
    pub strategy: RotationStrategy,
    /// Applied when the upstream does not say when the rate limit resets.
    pub rate_limit_reset_default: Duration,
    /// Park duration for a credential the upstream rejected outright.
    pub cooldown: Duration,
}

impl Default for CredentialPoolConfig {
    fn default() -> Self {
        Self {
            strategy: RotationStrategy::LeastErrors,
            rate_limit_reset_default: Duration::from_secs(3600),
            cooldown: Duration::from_secs(900),
        }
    }
}

pub struct CredentialPool {
    config: CredentialPoolConfig,
    credentials: Mutex<Vec<Credential>>,
    round_robin_cursor: AtomicUsize,
}

impl CredentialPool {
    pub fn new(config: CredentialPoolConfig, credentials: Vec<Credential>) -> Self {
        Self {
            config,
            credentials: Mutex::new(credentials),
            round_robin_cursor: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.credentials.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.lock().is_empty()
    }

    /// Pick a credential for an outbound call.
    ///
    /// Parked credentials whose reset time has passed are reactivated
    /// first. Returns `None` only when the pool holds no credentials at
    /// all.
    pub fn acquire(&self) -> Option<Credential> {
        let now = Utc::now();
        let mut credentials = self.credentials.lock();
        for cred in credentials.iter_mut() {
            Self::reactivate_if_due(cred, now);
        }

        let active: Vec<usize> = credentials
            .iter()
            .enumerate()
            .filter(|(_, c)| c.status == CredentialStatus::Active)
            .map(|(i, _)| i)
            .collect();

        let index = if active.is_empty() {
            let fallback = Self::soonest_reset(&credentials)?;
            warn!(
                alias = %credentials[fallback].alias,
                "No active credentials, handing out soonest-to-reset"
            );
            fallback
        } else {
            match self.config.strategy {
                RotationStrategy::RoundRobin => {
                    let n = self.round_robin_cursor.fetch_add(1, Ordering::Relaxed);
                    active[n % active.len()]
                }
                RotationStrategy::LeastErrors => *active
                    .iter()
                    .min_by_key(|&&i| credentials[i].error_count)?,
                RotationStrategy::Random => {
                    active[rand::thread_rng().gen_range(0..active.len())]
                }
            }
        };

        credentials[index].request_count += 1;
        debug!(alias = %credentials[index].alias, status = ?credentials[index].status, "Credential acquired");
        Some(credentials[index].clone())
    }

    /// Fold the outcome of a call back into the pool's state.
    /// Unknown aliases are ignored.
    pub fn report_outcome(&self, alias: &str, outcome: CallOutcome) {
        let mut credentials = self.credentials.lock();
        let Some(cred) = credentials.iter_mut().find(|c| c.alias == alias) else {
            warn!(alias = alias, "Outcome reported for unknown credential");
            return;
        };

        match outcome {
            CallOutcome::Success => {}
            CallOutcome::RateLimited { reset_at } => {
                let reset_at = reset_at.unwrap_or_else(|| {
                    Utc::now()
                        + chrono::Duration::from_std(self.config.rate_limit_reset_default)
                            .unwrap_or_else(|_| chrono::Duration::seconds(3600))
                });
                cred.status = CredentialStatus::RateLimited;
                cred.rate_limit_reset_at = Some(reset_at);
                warn!(alias = alias, reset_at = %reset_at, "Credential rate limited");
            }
            CallOutcome::InvalidCredential => {
                cred.error_count += 1;
                cred.status = CredentialStatus::Cooldown;
                cred.cooldown_until = Some(
                    Utc::now()
                        + chrono::Duration::from_std(self.config.cooldown)
                            .unwrap_or_else(|_| chrono::Duration::seconds(900)),
                );
                warn!(alias = alias, "Credential rejected, parked in cooldown");
            }
            CallOutcome::TransientError => {
                cred.error_count += 1;
                cred.status = CredentialStatus::Error;
            }
        }
    }

    /// Snapshot for inspection and logs.
    pub fn snapshot(&self) -> Vec<Credential> {
        self.credentials.lock().clone()
    }

    fn reactivate_if_due(cred: &mut Credential, now: DateTime<Utc>) {
        match cred.status {
            CredentialStatus::RateLimited => {
                if cred.rate_limit_reset_at.map(|t| t <= now).unwrap_or(true) {
                    cred.status = CredentialStatus::Active;
                    cred.rate_limit_reset_at = None;
                    debug!(alias = %cred.alias, "Credential rate limit reset");
                }
            }
            CredentialStatus::Cooldown => {
                if cred.cooldown_until.map(|t| t <= now).unwrap_or(true) {
                    cred.status = CredentialStatus::Active;
                    cred.cooldown_until = None;
                    debug!(alias = %cred.alias, "Credential cooldown elapsed");
                }
            }
            // Plain errors do not park the credential.
            CredentialStatus::Error => cred.status = CredentialStatus::Active,
            CredentialStatus::Active => {}
        }
    }

    /// Index of the parked credential with the earliest reset timestamp.
    fn soonest_reset(credentials: &[Credential]) -> Option<usize> {
        credentials
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| {
                c.rate_limit_reset_at
                    .or(c.cooldown_until)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC)
            })
            .map(|(i, _)| i)
    }
}

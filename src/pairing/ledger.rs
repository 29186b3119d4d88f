use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::{
    clock::SharedClock,
    config::PairingConfig,
    db::{AccountRole, Db, ElderProfile, Relationship},
    error::{SignalError, SignalResult},
};

const RANDOM_ATTEMPTS: usize = 64;

/// Who asked for a code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Issuer {
    /// A family account; an elder redeems the code.
    Family(i64),
    /// An unauthenticated elder device; a family account redeems the code.
    Elder,
}

impl Issuer {
    pub fn family_id(&self) -> Option<i64> {
        match self {
            Issuer::Family(id) => Some(*id),
            Issuer::Elder => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PairingCode {
    pub code: String,
    pub issuer: Issuer,
    pub issued_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub used: bool,
    /// Elder account bound by the redemption.
    pub claimed_by: Option<i64>,
}

impl PairingCode {
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone)]
pub enum Claim {
    Elder { elder_id: i64 },
    Family { family_id: i64, elder: ElderProfile },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimStatus {
    Waiting,
    ClaimedBy { elder_id: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCode {
    pub code: String,
    pub ttl_seconds: u64,
}

/// Issues and redeems one-time pairing codes.
///
/// The in-memory map is authoritative for matching; every mutation is written
/// to the store first and only applied in memory once the write succeeded, all
/// under the same lock, so memory never runs ahead of the durable record.
pub struct PairingLedger {
    codes: Mutex<HashMap<String, PairingCode>>,
    db: Db,
    clock: SharedClock,
    digits: u32,
    ttl: time::Duration,
}

impl PairingLedger {
    /// Restores unexpired codes from the store.
    pub async fn load(db: Db, clock: SharedClock, config: &PairingConfig) -> SignalResult<Self> {
        let restored = db.load_codes(clock.now()).await?;
        tracing::info!(count = restored.len(), "restored pairing codes");

        let codes = restored
            .into_iter()
            .map(|code| (code.code.clone(), code))
            .collect();

        Ok(Self {
            codes: Mutex::new(codes),
            db,
            clock,
            digits: config.digits(),
            ttl: time::Duration::seconds(config.code_ttl_seconds as i64),
        })
    }

    fn format_code(&self, n: u32) -> String {
        format!("{n:0width$}", width = self.digits as usize)
    }

    /// Picks a code no live entry holds. Expired entries may be reused, live
    /// ones (used or not) may not. `None` when the whole space is live.
    fn free_code(&self, codes: &HashMap<String, PairingCode>, now: OffsetDateTime) -> Option<String> {
        let upper = 10u32.pow(self.digits);
        let taken = |code: &str| codes.get(code).is_some_and(|c| !c.is_expired(now));

        for _ in 0..RANDOM_ATTEMPTS {
            let candidate = self.format_code(rand::rng().random_range(0..upper));
            if !taken(&candidate) {
                return Some(candidate);
            }
            tracing::debug!("pairing code collision, retrying");
        }

        // crowded space: choose among what is left instead of guessing
        let free: Vec<u32> = (0..upper).filter(|&n| !taken(&self.format_code(n))).collect();
        if free.is_empty() {
            return None;
        }
        let n = free[rand::rng().random_range(0..free.len())];
        Some(self.format_code(n))
    }

    pub async fn issue_code(&self, issuer: Issuer) -> SignalResult<IssuedCode> {
        if let Issuer::Family(family_id) = issuer {
            let user = self.db.find_user(family_id).await?;
            if user.and_then(|u| u.role) != Some(AccountRole::Family) {
                return Err(SignalError::IdentityInvalid);
            }
        }

        let mut codes = self.codes.lock().await;
        let now = self.clock.now();

        let Some(code) = self.free_code(&codes, now) else {
            tracing::warn!(live = codes.len(), "every pairing code is in use");
            return Err(SignalError::Conflict("pairing code space exhausted".into()));
        };

        let record = PairingCode {
            code: code.clone(),
            issuer,
            issued_at: now,
            expires_at: now + self.ttl,
            used: false,
            claimed_by: None,
        };
        self.db.insert_code(&record).await?;
        codes.insert(code.clone(), record);

        tracing::info!(?issuer, code_tail = tail(&code), "issued pairing code");
        Ok(IssuedCode {
            code,
            ttl_seconds: self.ttl.whole_seconds() as u64,
        })
    }

    /// The single linearization point for a code: at most one caller ever
    /// gets `Ok` for a given code.
    pub async fn consume_code(&self, code: &str, claim: Claim) -> SignalResult<Relationship> {
        let mut codes = self.codes.lock().await;
        let now = self.clock.now();

        let Some((issuer, expired)) = codes
            .get(code)
            .filter(|c| !c.used)
            .map(|c| (c.issuer, c.is_expired(now)))
        else {
            return Err(SignalError::NotFound("pairing code".into()));
        };

        if expired {
            // burn it so repeated guesses stop hitting the expiry path
            self.db.mark_code_used(code).await?;
            if let Some(record) = codes.get_mut(code) {
                record.used = true;
            }
            tracing::info!(code_tail = tail(code), "rejected expired pairing code");
            return Err(SignalError::Expired);
        }

        let relationship = match (issuer, &claim) {
            (Issuer::Family(family_id), Claim::Elder { elder_id }) => {
                let elder = self.db.find_user(*elder_id).await?;
                if elder.and_then(|u| u.role) != Some(AccountRole::Elder) {
                    return Err(SignalError::NotFound("elder account".into()));
                }
                self.db.claim_family_code(code, family_id, *elder_id, now).await?
            }
            (Issuer::Elder, Claim::Family { family_id, elder }) => {
                let family = self.db.find_user(*family_id).await?;
                if family.and_then(|u| u.role) != Some(AccountRole::Family) {
                    return Err(SignalError::IdentityInvalid);
                }
                self.db.claim_elder_code(code, *family_id, elder, now).await?
            }
            _ => {
                return Err(SignalError::Validation(
                    "code was issued for the other side of the pairing".into(),
                ));
            }
        };

        if let Some(record) = codes.get_mut(code) {
            record.used = true;
            record.claimed_by = Some(relationship.elder_id);
        }

        tracing::info!(
            elder_id = relationship.elder_id,
            family_id = relationship.family_id,
            "pairing code redeemed"
        );
        Ok(relationship)
    }

    pub async fn poll_claim(&self, code: &str) -> SignalResult<ClaimStatus> {
        let codes = self.codes.lock().await;
        let Some(record) = codes.get(code) else {
            return Err(SignalError::NotFound("pairing code".into()));
        };

        if let Some(elder_id) = record.claimed_by {
            return Ok(ClaimStatus::ClaimedBy { elder_id });
        }
        if record.used {
            return Err(SignalError::NotFound("pairing code".into()));
        }
        if record.is_expired(self.clock.now()) {
            return Err(SignalError::Expired);
        }
        Ok(ClaimStatus::Waiting)
    }

    /// Drops expired codes from memory and the store.
    pub async fn sweep(&self) -> SignalResult<usize> {
        let mut codes = self.codes.lock().await;
        let now = self.clock.now();

        self.db.delete_expired_codes(now).await?;
        let before = codes.len();
        codes.retain(|_, c| !c.is_expired(now));
        Ok(before - codes.len())
    }

    pub async fn run_sweeper(&self, every: Duration) {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            match self.sweep().await {
                Ok(0) => {}
                Ok(dropped) => tracing::debug!(dropped, "swept expired pairing codes"),
                Err(e) => tracing::error!(error = %e, "pairing code sweep failed"),
            }
        }
    }
}

/// Last two digits, enough to correlate log lines without leaking the code.
fn tail(code: &str) -> &str {
    &code[code.len().saturating_sub(2)..]
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::{Clock, ManualClock};

    async fn ledger() -> (PairingLedger, Db, Arc<ManualClock>) {
        let db = Db::in_memory().await.unwrap();
        let clock = Arc::new(ManualClock::default());
        let ledger = PairingLedger::load(db.clone(), clock.clone(), &PairingConfig::default())
            .await
            .unwrap();
        (ledger, db, clock)
    }

    #[tokio::test]
    async fn codes_are_six_digits_with_ten_minute_ttl() {
        let (ledger, _, _) = ledger().await;
        let issued = ledger.issue_code(Issuer::Elder).await.unwrap();
        assert_eq!(issued.code.len(), 6);
        assert!(issued.code.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(issued.ttl_seconds, 600);
    }

    #[tokio::test]
    async fn unknown_family_cannot_issue() {
        let (ledger, db, clock) = ledger().await;
        let elder = db.create_user("grandma", AccountRole::Elder, clock.now()).await.unwrap();

        assert!(matches!(
            ledger.issue_code(Issuer::Family(999)).await,
            Err(SignalError::IdentityInvalid)
        ));
        assert!(matches!(
            ledger.issue_code(Issuer::Family(elder)).await,
            Err(SignalError::IdentityInvalid)
        ));
    }

    #[tokio::test]
    async fn poll_sees_the_claim() {
        let (ledger, db, clock) = ledger().await;
        let family = db.create_user("daughter", AccountRole::Family, clock.now()).await.unwrap();
        let issued = ledger.issue_code(Issuer::Elder).await.unwrap();

        assert_eq!(ledger.poll_claim(&issued.code).await.unwrap(), ClaimStatus::Waiting);

        let elder = ElderProfile { name: "阿公".into(), gender: Some("male".into()), age: Some(82) };
        let rel = ledger
            .consume_code(&issued.code, Claim::Family { family_id: family, elder })
            .await
            .unwrap();

        assert_eq!(
            ledger.poll_claim(&issued.code).await.unwrap(),
            ClaimStatus::ClaimedBy { elder_id: rel.elder_id }
        );
        let user = db.find_user(rel.elder_id).await.unwrap().unwrap();
        assert_eq!(user.username, "阿公");
    }

    #[tokio::test]
    async fn wrong_flow_leaves_code_usable() {
        let (ledger, db, clock) = ledger().await;
        let family = db.create_user("son", AccountRole::Family, clock.now()).await.unwrap();
        let elder = db.create_user("grandpa", AccountRole::Elder, clock.now()).await.unwrap();
        let issued = ledger.issue_code(Issuer::Family(family)).await.unwrap();

        let wrong = Claim::Family { family_id: family, elder: ElderProfile::default() };
        assert!(matches!(
            ledger.consume_code(&issued.code, wrong).await,
            Err(SignalError::Validation(_))
        ));

        let rel = ledger
            .consume_code(&issued.code, Claim::Elder { elder_id: elder })
            .await
            .unwrap();
        assert_eq!(rel, Relationship { elder_id: elder, family_id: family });
    }

    #[tokio::test]
    async fn failed_write_leaves_memory_untouched() {
        let (ledger, db, _) = ledger().await;
        db.pool().close().await;

        assert!(matches!(
            ledger.issue_code(Issuer::Elder).await,
            Err(SignalError::Store(_))
        ));
        assert!(ledger.codes.lock().await.is_empty());
    }

    #[tokio::test]
    async fn failed_claim_leaves_code_waiting() {
        let (ledger, db, clock) = ledger().await;
        let family = db.create_user("daughter", AccountRole::Family, clock.now()).await.unwrap();
        let issued = ledger.issue_code(Issuer::Elder).await.unwrap();

        // the claim transaction fails on its last statement
        sqlx::query("DROP TABLE relationships").execute(db.pool()).await.unwrap();

        let claim = Claim::Family { family_id: family, elder: ElderProfile { name: "阿嬤".into(), ..Default::default() } };
        assert!(matches!(
            ledger.consume_code(&issued.code, claim).await,
            Err(SignalError::Store(_))
        ));
        assert_eq!(ledger.poll_claim(&issued.code).await.unwrap(), ClaimStatus::Waiting);
        assert!(!ledger.codes.lock().await[&issued.code].used);
    }

    fn four_digits() -> PairingConfig {
        PairingConfig { code_digits: 4, ..PairingConfig::default() }
    }

    #[tokio::test]
    async fn small_code_space_stays_unique() {
        let db = Db::in_memory().await.unwrap();
        let clock = Arc::new(ManualClock::default());
        let ledger = PairingLedger::load(db, clock, &four_digits()).await.unwrap();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..500 {
            let issued = ledger.issue_code(Issuer::Elder).await.unwrap();
            assert_eq!(issued.code.len(), 4);
            assert!(seen.insert(issued.code), "code handed out twice");
        }
    }

    fn fill(codes: &mut HashMap<String, PairingCode>, ledger: &PairingLedger, now: OffsetDateTime, skip: Option<u32>) {
        for n in (0..10_000).filter(|&n| Some(n) != skip) {
            let code = ledger.format_code(n);
            codes.insert(
                code.clone(),
                PairingCode {
                    code,
                    issuer: Issuer::Elder,
                    issued_at: now,
                    expires_at: now + ledger.ttl,
                    used: false,
                    claimed_by: None,
                },
            );
        }
    }

    #[tokio::test]
    async fn exhausted_code_space_is_a_conflict() {
        let db = Db::in_memory().await.unwrap();
        let clock = Arc::new(ManualClock::default());
        let ledger = PairingLedger::load(db, clock.clone(), &four_digits()).await.unwrap();
        fill(&mut *ledger.codes.lock().await, &ledger, clock.now(), None);

        assert!(matches!(
            ledger.issue_code(Issuer::Elder).await,
            Err(SignalError::Conflict(_))
        ));

        // expiry frees the space again
        clock.advance(time::Duration::seconds(600));
        let issued = ledger.issue_code(Issuer::Elder).await.unwrap();
        assert_eq!(issued.code.len(), 4);
    }

    #[tokio::test]
    async fn last_free_code_is_found() {
        let db = Db::in_memory().await.unwrap();
        let clock = Arc::new(ManualClock::default());
        let ledger = PairingLedger::load(db, clock.clone(), &four_digits()).await.unwrap();
        fill(&mut *ledger.codes.lock().await, &ledger, clock.now(), Some(4321));

        let issued = ledger.issue_code(Issuer::Elder).await.unwrap();
        assert_eq!(issued.code, "4321");
    }

    #[tokio::test]
    async fn codes_survive_restart() {
        let (ledger, db, clock) = ledger().await;
        let issued = ledger.issue_code(Issuer::Elder).await.unwrap();
        drop(ledger);

        let reloaded = PairingLedger::load(db, clock, &PairingConfig::default()).await.unwrap();
        assert_eq!(reloaded.poll_claim(&issued.code).await.unwrap(), ClaimStatus::Waiting);
    }

    #[tokio::test]
    async fn sweep_drops_only_expired() {
        let (ledger, _, clock) = ledger().await;
        let old = ledger.issue_code(Issuer::Elder).await.unwrap();
        clock.advance(time::Duration::seconds(300));
        let fresh = ledger.issue_code(Issuer::Elder).await.unwrap();
        clock.advance(time::Duration::seconds(301));

        assert_eq!(ledger.sweep().await.unwrap(), 1);
        assert!(matches!(
            ledger.poll_claim(&old.code).await,
            Err(SignalError::NotFound(_))
        ));
        assert_eq!(ledger.poll_claim(&fresh.code).await.unwrap(), ClaimStatus::Waiting);
    }

    #[test]
    fn tail_never_panics() {
        assert_eq!(tail("123456"), "56");
        assert_eq!(tail("7"), "7");
    }
}

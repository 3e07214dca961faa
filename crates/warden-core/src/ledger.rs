//! Durable per-sender license ledger.
//!
//! Two documents live under the data dir: `warrants.json` (one-time activation
//! codes) and `licenses.json` (per-sender activation state and trial attempt
//! counters). All read-modify-write sequences run under one async mutex, and
//! every persist goes through a temp-file + rename, so the files have a single
//! writer and a concurrent reader never observes a half-written record.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{Local, NaiveDate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{config::Config, domain::SenderKey, errors::Error, Result};

const WARRANTS_FILE: &str = "warrants.json";
const LICENSES_FILE: &str = "licenses.json";

/// Warrant codes arrive as `#` + 15 alphanumerics; the prefix is stripped by
/// the dispatcher before the code reaches the ledger.
pub const WARRANT_PREFIX: char = '#';
pub const WARRANT_CODE_LEN: usize = 15;

fn code_shape() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("^[A-Za-z0-9]{15}$").expect("warrant code regex"))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum WarrantStatus {
    Unused,
    Used,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct WarrantRecord {
    status: WarrantStatus,
    /// Grace window in days. Historical ledgers carry negative values here;
    /// the absolute magnitude is what counts.
    quota_days: i32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LicenseRecord {
    pub sender: SenderKey,
    pub attempts: u32,
    pub code: Option<String>,
    pub quota_days: Option<i32>,
    pub activated_on: Option<NaiveDate>,
    #[serde(default)]
    pub expiry_notified: bool,
    #[serde(default)]
    pub block_warned: bool,
}

impl LicenseRecord {
    fn unactivated(sender: SenderKey) -> Self {
        Self {
            sender,
            attempts: 0,
            code: None,
            quota_days: None,
            activated_on: None,
            expiry_notified: false,
            block_warned: false,
        }
    }
}

/// Result of a redemption attempt. Rejections are ordinary outcomes the
/// dispatcher answers with a fixed message; only persistence faults surface
/// as errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RedeemOutcome {
    Granted { quota_days: u32 },
    Malformed,
    Unknown,
    AlreadyUsed,
}

/// Access decision for one inbound message.
///
/// `notify` flags are true exactly once per state transition: the ledger
/// records that the expiry notice / block warning went out, so later denials
/// stay silent instead of re-spamming the sender.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    GracePeriod { days_left: u32 },
    Expired { notify: bool },
    Unactivated { attempts: u32 },
    Blocked { notify: bool },
}

#[derive(Debug, Default)]
struct LedgerState {
    warrants: HashMap<String, WarrantRecord>,
    licenses: Vec<LicenseRecord>,
}

#[derive(Debug)]
pub struct LicenseLedger {
    warrants_path: PathBuf,
    licenses_path: PathBuf,
    max_tries: u32,
    state: Mutex<LedgerState>,
}

impl LicenseLedger {
    pub fn open(cfg: &Config) -> Result<Self> {
        Self::open_at(&cfg.data_dir, cfg.max_tries)
    }

    pub fn open_at(data_dir: &Path, max_tries: u32) -> Result<Self> {
        fs::create_dir_all(data_dir)?;
        let warrants_path = data_dir.join(WARRANTS_FILE);
        let licenses_path = data_dir.join(LICENSES_FILE);

        let warrants = load_json(&warrants_path)?.unwrap_or_default();
        let licenses = load_json(&licenses_path)?.unwrap_or_default();

        Ok(Self {
            warrants_path,
            licenses_path,
            max_tries,
            state: Mutex::new(LedgerState { warrants, licenses }),
        })
    }

    /// Register a fresh (unused) warrant code. Used by operators and tests;
    /// production ledgers are usually seeded out of band.
    pub async fn issue(&self, code: &str, quota_days: i32) -> Result<()> {
        if !code_shape().is_match(code) {
            return Err(Error::Ledger(format!("malformed warrant code: {code}")));
        }
        let mut st = self.state.lock().await;
        st.warrants.insert(
            code.to_string(),
            WarrantRecord {
                status: WarrantStatus::Unused,
                quota_days,
            },
        );
        persist(&self.warrants_path, &st.warrants)
    }

    /// Redeem a one-time code for `sender`. Exactly one of two concurrent
    /// redemptions of the same code wins; the loser observes `AlreadyUsed`.
    pub async fn redeem(&self, code: &str, sender: &SenderKey) -> Result<RedeemOutcome> {
        self.redeem_at(code, sender, Local::now().date_naive()).await
    }

    async fn redeem_at(
        &self,
        code: &str,
        sender: &SenderKey,
        today: NaiveDate,
    ) -> Result<RedeemOutcome> {
        if !code_shape().is_match(code) {
            return Ok(RedeemOutcome::Malformed);
        }

        let mut st = self.state.lock().await;
        let Some(warrant) = st.warrants.get_mut(code) else {
            return Ok(RedeemOutcome::Unknown);
        };
        if warrant.status == WarrantStatus::Used {
            return Ok(RedeemOutcome::AlreadyUsed);
        }
        warrant.status = WarrantStatus::Used;
        let quota_days = warrant.quota_days;

        let idx = match st.licenses.iter().position(|r| &r.sender == sender) {
            Some(i) => i,
            None => {
                st.licenses.push(LicenseRecord::unactivated(sender.clone()));
                st.licenses.len() - 1
            }
        };
        let record = &mut st.licenses[idx];
        record.code = Some(code.to_string());
        record.quota_days = Some(quota_days);
        record.activated_on = Some(today);
        record.expiry_notified = false;
        record.block_warned = false;

        // Licenses before warrants: a crash between the two writes leaves the
        // code unused on disk, so the sender can redeem again instead of
        // holding a burned code with no license.
        persist(&self.licenses_path, &st.licenses)?;
        persist(&self.warrants_path, &st.warrants)?;

        tracing::info!(code, nickname = %sender.nickname, "warrant code redeemed");
        Ok(RedeemOutcome::Granted {
            quota_days: quota_days.unsigned_abs(),
        })
    }

    /// Gate one inbound message from `sender`. Unactivated senders burn one
    /// trial attempt per call; activated senders are judged by day arithmetic
    /// against the activation date.
    pub async fn check_access(&self, sender: &SenderKey) -> Result<Decision> {
        self.check_access_at(sender, Local::now().date_naive()).await
    }

    async fn check_access_at(&self, sender: &SenderKey, today: NaiveDate) -> Result<Decision> {
        let mut st = self.state.lock().await;

        let idx = match st.licenses.iter().position(|r| &r.sender == sender) {
            Some(i) => i,
            None => {
                let mut record = LicenseRecord::unactivated(sender.clone());
                record.attempts = 1;
                st.licenses.push(record);
                persist(&self.licenses_path, &st.licenses)?;
                return Ok(Decision::Unactivated { attempts: 1 });
            }
        };

        let record = &mut st.licenses[idx];
        if let (Some(quota), Some(activated_on)) = (record.quota_days, record.activated_on) {
            let days_since = (today - activated_on).num_days();
            if days_since < 0 {
                // Activation date in the future: corrupt record. Leave the
                // stored bytes alone rather than guessing a repair.
                return Err(Error::Ledger(format!(
                    "license for {} activated in the future ({activated_on})",
                    record.sender.nickname
                )));
            }

            let grace = i64::from(quota.unsigned_abs());
            if days_since == 0 {
                return Ok(Decision::Allowed);
            }
            if days_since <= grace {
                return Ok(Decision::GracePeriod {
                    days_left: (grace - days_since) as u32,
                });
            }
            let notify = !record.expiry_notified;
            if notify {
                record.expiry_notified = true;
                persist(&self.licenses_path, &st.licenses)?;
            }
            return Ok(Decision::Expired { notify });
        }

        record.attempts += 1;
        if record.attempts > self.max_tries {
            let notify = !record.block_warned;
            record.block_warned = true;
            persist(&self.licenses_path, &st.licenses)?;
            return Ok(Decision::Blocked { notify });
        }
        let attempts = record.attempts;
        persist(&self.licenses_path, &st.licenses)?;
        Ok(Decision::Unactivated { attempts })
    }
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.is_file() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)?;
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| Error::Ledger(format!("corrupt ledger file {}: {e}", path.display())))
}

fn persist<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

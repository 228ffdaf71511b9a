//! Resolution engine.
//!
//! The decision core is a pure function: no clock reads, no randomness, no
//! database. Submissions go in, a final outcome and a canonical trace come
//! out, and two engine instances hashing the same input produce bit-identical
//! hashes. The database flows around it (submission intake, dispute filing)
//! live in the same module and hand the core its inputs.

use crate::config::DISPUTE_WINDOW_SECS;
use crate::engine::Engine;
use crate::error::TransactionError;
use crate::jobs;
use crate::runtime::with_retrying_tx;
use crate::store::{
    Ledger, MarketStatus, ResolutionMode, SubmissionRow, SubmissionWithUser,
};
use crate::updates::{MarketEvent, UpdateEnvelope};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Pure core
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MarketView {
    pub market_id: i64,
    pub creator_id: i64,
    pub mode: ResolutionMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionView {
    pub user_id: i64,
    pub outcome: String,
    pub submitted_ts: i64,
    pub is_admin: bool,
}

impl From<&SubmissionWithUser> for SubmissionView {
    fn from(row: &SubmissionWithUser) -> Self {
        Self {
            user_id: row.user_id,
            outcome: row.outcome.clone(),
            submitted_ts: row.submitted_ts,
            is_admin: row.is_admin,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Resolved {
    pub final_outcome: String,
    /// The submitter whose entry decided the outcome; None for plurality.
    pub decided_by: Option<i64>,
    pub trace: serde_json::Value,
    pub canonical_hash: String,
}

/// Canonical serialization: serde_json's map is BTreeMap-backed (the
/// preserve_order feature is off), so keys come out sorted; to_string emits
/// no whitespace. Both together make the hash input reproducible.
pub fn canonical_json(value: &serde_json::Value) -> String {
    serde_json::to_string(value).expect("trace serialization cannot fail")
}

pub fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest.iter().fold(String::with_capacity(64), |mut acc, b| {
        use std::fmt::Write;
        let _ = write!(acc, "{b:02x}");
        acc
    })
}

/// Deterministic per-mode resolution over a submission set.
pub fn resolve(market: &MarketView, submissions: &[SubmissionView]) -> Result<Resolved> {
    let mut ordered: Vec<SubmissionView> = submissions.to_vec();
    ordered.sort_by(|a, b| {
        (a.submitted_ts, a.user_id).cmp(&(b.submitted_ts, b.user_id))
    });

    let (final_outcome, decided_by, tally) = match market.mode {
        ResolutionMode::Oracle => {
            let winner = ordered.iter().find(|s| s.is_admin).ok_or_else(|| {
                anyhow::Error::new(TransactionError::Unauthorized(
                    "oracle resolution requires an admin submission".into(),
                ))
            })?;
            (winner.outcome.clone(), Some(winner.user_id), None)
        }
        ResolutionMode::Authority => {
            let winner = ordered
                .iter()
                .find(|s| s.is_admin || s.user_id == market.creator_id)
                .ok_or_else(|| {
                    anyhow::Error::new(TransactionError::Unauthorized(
                        "authority resolution requires the creator or an admin".into(),
                    ))
                })?;
            (winner.outcome.clone(), Some(winner.user_id), None)
        }
        ResolutionMode::Opinion => {
            if ordered.is_empty() {
                return Err(TransactionError::validation(
                    "opinion resolution requires at least one submission",
                ));
            }
            // (count, first_ts, first_user) per outcome; plurality wins, ties
            // break by earliest submission then user id then outcome text.
            let mut tally: BTreeMap<String, (i64, i64, i64)> = BTreeMap::new();
            for sub in &ordered {
                let entry = tally
                    .entry(sub.outcome.clone())
                    .or_insert((0, sub.submitted_ts, sub.user_id));
                entry.0 += 1;
            }
            let mut ranked: Vec<(String, i64, i64, i64)> = tally
                .iter()
                .map(|(outcome, stats)| (outcome.clone(), stats.0, stats.1, stats.2))
                .collect();
            ranked.sort_by(|a, b| {
                b.1.cmp(&a.1) // plurality
                    .then(a.2.cmp(&b.2)) // earliest first submission
                    .then(a.3.cmp(&b.3)) // lowest submitter id
                    .then(a.0.cmp(&b.0)) // outcome text, for total order
            });
            let winner = ranked[0].0.clone();
            let counts: BTreeMap<String, i64> =
                tally.into_iter().map(|(k, (c, _, _))| (k, c)).collect();
            (winner, None, Some(counts))
        }
    };

    let mut trace = serde_json::json!({
        "market_id": market.market_id,
        "mode": market.mode.as_str(),
        "final_outcome": final_outcome,
        "decided_by": decided_by,
        "submissions": ordered
            .iter()
            .map(|s| serde_json::json!({
                "user_id": s.user_id,
                "outcome": s.outcome,
                "submitted_ts": s.submitted_ts,
                "is_admin": s.is_admin,
            }))
            .collect::<Vec<_>>(),
    });
    if let Some(counts) = tally {
        trace["tally"] = serde_json::json!(counts);
    }

    let canonical_hash = sha256_hex(&canonical_json(&trace));
    Ok(Resolved {
        final_outcome,
        decided_by,
        trace,
        canonical_hash,
    })
}

/// Map a submitted outcome onto the binary side of an option.
pub fn outcome_to_side(outcome: &str, option_label: &str) -> Result<i16> {
    let trimmed = outcome.trim();
    if trimmed.eq_ignore_ascii_case(option_label) || trimmed.eq_ignore_ascii_case("yes") {
        Ok(1)
    } else if trimmed.eq_ignore_ascii_case("no") {
        Ok(2)
    } else {
        Err(TransactionError::validation(format!(
            "outcome '{trimmed}' must name the option label, 'yes', or 'no'"
        )))
    }
}

// ---------------------------------------------------------------------------
// Submission flow
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResolutionRequest {
    pub user_id: i64,
    pub market_id: i64,
    pub option_id: i64,
    pub outcome: String,
    /// Direct side override for authorized callers; not allowed in opinion
    /// mode.
    pub winning_side: Option<i16>,
    pub evidence: Option<String>,
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitOutcome {
    pub submission_id: i64,
    pub option_id: i64,
    pub winning_side: i16,
    pub resolved_ts: i64,
    pub dispute_deadline_ts: Option<i64>,
    pub market_resolved: bool,
    pub canonical_hash: Option<String>,
}

pub async fn submit_resolution(
    engine: &Engine,
    req: SubmitResolutionRequest,
) -> Result<SubmitOutcome> {
    if req.outcome.trim().is_empty() {
        return Err(TransactionError::validation("outcome must not be empty"));
    }
    if let Some(ws) = req.winning_side {
        if ws != 1 && ws != 2 {
            return Err(TransactionError::validation("winning_side must be 1 or 2"));
        }
    }
    let now = engine.now();

    let outcome = engine
        .queue
        .run((req.market_id, None), engine.queue_timeout(), async {
            with_retrying_tx!(&engine.pool, &engine.config.retry, tx, {
                let mut market = Ledger::lock_market(&mut tx, req.market_id).await?;
                match market.status()? {
                    MarketStatus::Open | MarketStatus::Resolving => {}
                    _ => return Err(anyhow::Error::new(TransactionError::MarketNotOpen)),
                }
                let option = Ledger::lock_option(&mut tx, req.option_id).await?;
                if option.market_id != market.id {
                    return Err(TransactionError::validation(
                        "option does not belong to this market",
                    ));
                }
                if option.is_resolved {
                    return Err(anyhow::Error::new(TransactionError::OptionAlreadyResolved));
                }

                let user = Ledger::get_user(&mut tx, req.user_id).await?;
                let mode = market.mode()?;
                let is_authority = user.is_admin || user.id == market.creator_id;
                match mode {
                    ResolutionMode::Oracle => {
                        if !user.is_admin {
                            return Err(anyhow::Error::new(TransactionError::Unauthorized(
                                "only platform admins may submit in oracle mode".into(),
                            )));
                        }
                    }
                    ResolutionMode::Authority => {
                        if !is_authority {
                            return Err(anyhow::Error::new(TransactionError::Unauthorized(
                                "only the creator or an admin may submit in authority mode".into(),
                            )));
                        }
                    }
                    ResolutionMode::Opinion => {
                        if now < market.expiration_ts {
                            return Err(anyhow::Error::new(TransactionError::Unauthorized(
                                format!(
                                    "opinion submissions open at expiration ({})",
                                    market.expiration_ts
                                ),
                            )));
                        }
                        if req.winning_side.is_some() {
                            return Err(TransactionError::validation(
                                "winning_side cannot be forced in opinion mode",
                            ));
                        }
                    }
                }
                // The submitted outcome must be expressible against this
                // option before it is recorded.
                outcome_to_side(&req.outcome, &option.label)?;

                let submission = Ledger::insert_submission(
                    &mut tx,
                    market.id,
                    option.id,
                    req.user_id,
                    req.outcome.trim(),
                    req.evidence.as_deref(),
                    now,
                    req.signature.as_deref(),
                )
                .await?;
                if market.status()? == MarketStatus::Open {
                    market.status = MarketStatus::Resolving.as_str().to_string();
                }

                // An authorized direct side wins outright; otherwise the pure
                // resolver decides from everything submitted so far.
                let (winning_side, canonical_hash) = match (req.winning_side, mode) {
                    (Some(side), ResolutionMode::Oracle | ResolutionMode::Authority)
                        if is_authority =>
                    {
                        (side, None)
                    }
                    _ => {
                        let views: Vec<SubmissionView> =
                            Ledger::submission_views_for_option(&mut tx, option.id)
                                .await?
                                .iter()
                                .map(SubmissionView::from)
                                .collect();
                        let market_view = MarketView {
                            market_id: market.id,
                            creator_id: market.creator_id,
                            mode,
                        };
                        let resolved = resolve(&market_view, &views)?;
                        (
                            outcome_to_side(&resolved.final_outcome, &option.label)?,
                            Some(resolved.canonical_hash),
                        )
                    }
                };

                let dispute_deadline_ts = match mode {
                    ResolutionMode::Opinion => None,
                    _ => Some(now + DISPUTE_WINDOW_SECS),
                };
                Ledger::resolve_option(
                    &mut tx,
                    option.id,
                    winning_side,
                    now,
                    req.user_id,
                    dispute_deadline_ts,
                )
                .await?;

                let market_resolved =
                    Ledger::unresolved_option_count(&mut tx, market.id).await? == 0;
                if market_resolved {
                    market.status = MarketStatus::Resolved.as_str().to_string();
                }
                Ledger::update_market(&mut tx, &market).await?;

                Ok(SubmitOutcome {
                    submission_id: submission.id,
                    option_id: option.id,
                    winning_side,
                    resolved_ts: now,
                    dispute_deadline_ts,
                    market_resolved,
                    canonical_hash,
                })
            })
        })
        .await?;

    engine.bus.emit(UpdateEnvelope::Market {
        market_id: req.market_id,
        event: if outcome.market_resolved {
            MarketEvent::Resolved
        } else {
            MarketEvent::Updated
        },
        payload: serde_json::json!({
            "option_id": outcome.option_id,
            "winning_side": outcome.winning_side,
        }),
        ts: now,
    });
    // settlement credits winners in its own transaction
    jobs::spawn_settlement(engine, req.market_id, req.option_id);

    Ok(outcome)
}

// ---------------------------------------------------------------------------
// Dispute flow
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct DisputeRequest {
    pub user_id: i64,
    pub market_id: i64,
    pub option_id: i64,
    pub reason: String,
    pub evidence: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DisputeOutcome {
    pub dispute_id: i64,
    pub fee_paid: i64,
}

pub async fn dispute_resolution(engine: &Engine, req: DisputeRequest) -> Result<DisputeOutcome> {
    if req.reason.trim().is_empty() {
        return Err(TransactionError::validation("a dispute needs a reason"));
    }
    let limits = engine.limits.get(&engine.pool).await?;
    let now = engine.now();

    let outcome = engine
        .queue
        .run((req.market_id, None), engine.queue_timeout(), async {
            with_retrying_tx!(&engine.pool, &engine.config.retry, tx, {
                let mut market = Ledger::lock_market(&mut tx, req.market_id).await?;
                let option = Ledger::lock_option(&mut tx, req.option_id).await?;
                if option.market_id != market.id {
                    return Err(TransactionError::validation(
                        "option does not belong to this market",
                    ));
                }
                if !option.is_resolved {
                    return Err(TransactionError::validation("option is not resolved"));
                }
                let deadline = match option.dispute_deadline_ts {
                    None => {
                        return Err(TransactionError::validation(
                            "opinion resolutions cannot be disputed",
                        ))
                    }
                    Some(deadline) => deadline,
                };
                if now >= deadline {
                    return Err(anyhow::Error::new(TransactionError::DisputeDeadlinePassed));
                }

                let fee = limits.dispute_fee;
                let wallet = Ledger::lock_wallet(&mut tx, req.user_id).await?;
                if wallet.balance < fee || !Ledger::debit_wallet(&mut tx, req.user_id, fee).await? {
                    return Err(anyhow::Error::new(TransactionError::InsufficientBalance {
                        required: fee,
                        available: wallet.balance,
                    }));
                }

                market.protocol_fees += fee;
                market.status = MarketStatus::Disputed.as_str().to_string();
                Ledger::update_market(&mut tx, &market).await?;

                let dispute_id = Ledger::insert_dispute(
                    &mut tx,
                    market.id,
                    option.id,
                    req.user_id,
                    req.reason.trim(),
                    req.evidence.as_deref(),
                    fee,
                    now,
                )
                .await?;

                Ok(DisputeOutcome {
                    dispute_id,
                    fee_paid: fee,
                })
            })
        })
        .await?;

    engine.bus.emit(UpdateEnvelope::Market {
        market_id: req.market_id,
        event: MarketEvent::Updated,
        payload: serde_json::json!({
            "disputed_option_id": req.option_id,
            "dispute_id": outcome.dispute_id,
        }),
        ts: now,
    });
    Ok(outcome)
}

// ---------------------------------------------------------------------------
// Read view
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ResolutionView {
    pub market: crate::engine::MarketSummary,
    pub submissions: Vec<SubmissionRow>,
}

pub async fn get_resolution(engine: &Engine, market_id: i64) -> Result<ResolutionView> {
    let market = crate::engine::get_market_state(engine, market_id).await?;
    let submissions = Ledger::submissions_for_market(&engine.pool, market_id).await?;
    Ok(ResolutionView {
        market,
        submissions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn market(mode: ResolutionMode) -> MarketView {
        MarketView {
            market_id: 42,
            creator_id: 10,
            mode,
        }
    }

    fn sub(user_id: i64, outcome: &str, ts: i64, is_admin: bool) -> SubmissionView {
        SubmissionView {
            user_id,
            outcome: outcome.into(),
            submitted_ts: ts,
            is_admin,
        }
    }

    #[test]
    fn oracle_takes_first_admin_submission() {
        let subs = vec![
            sub(1, "no", 100, false),
            sub(2, "yes", 200, true),
            sub(3, "no", 300, true),
        ];
        let resolved = resolve(&market(ResolutionMode::Oracle), &subs).unwrap();
        assert_eq!(resolved.final_outcome, "yes");
        assert_eq!(resolved.decided_by, Some(2));
    }

    #[test]
    fn oracle_rejects_without_admin() {
        let subs = vec![sub(1, "yes", 100, false)];
        let err = resolve(&market(ResolutionMode::Oracle), &subs).unwrap_err();
        let te = crate::error::as_transaction_error(&err).unwrap();
        assert_eq!(te.kind(), "Unauthorized");
    }

    #[test]
    fn authority_accepts_creator_or_admin() {
        let subs = vec![sub(99, "no", 50, false), sub(10, "yes", 100, false)];
        let resolved = resolve(&market(ResolutionMode::Authority), &subs).unwrap();
        assert_eq!(resolved.final_outcome, "yes");
        assert_eq!(resolved.decided_by, Some(10));

        let subs = vec![sub(5, "no", 10, true)];
        let resolved = resolve(&market(ResolutionMode::Authority), &subs).unwrap();
        assert_eq!(resolved.decided_by, Some(5));
    }

    #[test]
    fn opinion_takes_plurality() {
        let subs = vec![
            sub(1, "yes", 100, false),
            sub(2, "no", 110, false),
            sub(3, "yes", 120, false),
        ];
        let resolved = resolve(&market(ResolutionMode::Opinion), &subs).unwrap();
        assert_eq!(resolved.final_outcome, "yes");
        assert_eq!(resolved.decided_by, None);
        assert_eq!(resolved.trace["tally"]["yes"], 2);
    }

    #[test]
    fn opinion_tie_breaks_by_earliest_submission() {
        let subs = vec![
            sub(2, "no", 90, false),
            sub(1, "yes", 100, false),
            sub(3, "yes", 120, false),
            sub(4, "no", 130, false),
        ];
        // 2-2 tie; "no" was submitted first
        let resolved = resolve(&market(ResolutionMode::Opinion), &subs).unwrap();
        assert_eq!(resolved.final_outcome, "no");
    }

    #[test]
    fn opinion_rejects_empty_submissions() {
        let err = resolve(&market(ResolutionMode::Opinion), &[]).unwrap_err();
        assert_eq!(
            crate::error::as_transaction_error(&err).unwrap().kind(),
            "Validation"
        );
    }

    #[test]
    fn hash_is_invariant_to_input_order() {
        let subs = vec![
            sub(1, "yes", 100, false),
            sub(2, "no", 110, false),
            sub(3, "yes", 120, false),
        ];
        let mut shuffled = subs.clone();
        shuffled.reverse();
        let a = resolve(&market(ResolutionMode::Opinion), &subs).unwrap();
        let b = resolve(&market(ResolutionMode::Opinion), &shuffled).unwrap();
        assert_eq!(a.canonical_hash, b.canonical_hash);
    }

    #[test]
    fn hash_changes_with_content() {
        let a = resolve(
            &market(ResolutionMode::Opinion),
            &[sub(1, "yes", 100, false)],
        )
        .unwrap();
        let b = resolve(
            &market(ResolutionMode::Opinion),
            &[sub(1, "no", 100, false)],
        )
        .unwrap();
        assert_ne!(a.canonical_hash, b.canonical_hash);
    }

    #[test]
    fn canonical_json_sorts_keys_and_strips_whitespace() {
        let value = serde_json::json!({"zeta": 1, "alpha": {"nested": true, "a": 2}});
        let canonical = canonical_json(&value);
        assert_eq!(canonical, r#"{"alpha":{"a":2,"nested":true},"zeta":1}"#);
    }

    #[test]
    fn sha256_hex_known_vector() {
        // sha256("") is the well-known empty digest
        assert_eq!(
            sha256_hex(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn outcome_side_mapping() {
        assert_eq!(outcome_to_side("yes", "Team A wins").unwrap(), 1);
        assert_eq!(outcome_to_side("Team A wins", "Team A wins").unwrap(), 1);
        assert_eq!(outcome_to_side("NO", "Team A wins").unwrap(), 2);
        assert!(outcome_to_side("maybe", "Team A wins").is_err());
    }

    #[test]
    fn deterministic_across_runs() {
        let subs = vec![
            sub(7, "yes", 500, true),
            sub(8, "no", 400, false),
        ];
        let a = resolve(&market(ResolutionMode::Oracle), &subs).unwrap();
        let b = resolve(&market(ResolutionMode::Oracle), &subs).unwrap();
        assert_eq!(a.canonical_hash, b.canonical_hash);
        assert_eq!(a.trace, b.trace);
    }
}

use super::{append_event, from_millis, to_millis, PayoutStore};
use crate::{
    error::{PayoutError, PayoutResult},
    event::PayoutEvent,
    ledger::{ObligationStatus, PayoutObligation},
    types::Amount,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::collections::BTreeMap;

const COLUMNS: &str = "obligation_id, round_id, player_id, player_display_name, amount,
    source_combination, status, attempts, last_error, transport_reference,
    created_at, claimed_at, next_attempt_at, paid_at, admin_note";

fn map_row(row: &Row<'_>) -> rusqlite::Result<PayoutObligation> {
    Ok(PayoutObligation {
        obligation_id: row.get(0)?,
        round_id: row.get(1)?,
        player_id: row.get(2)?,
        player_display_name: row.get(3)?,
        amount: row.get::<_, i64>(4)? as Amount,
        source_combination: row.get(5)?,
        status: row.get(6)?,
        attempts: row.get::<_, i64>(7)? as u32,
        last_error: row.get(8)?,
        transport_reference: row.get(9)?,
        created_at: from_millis(row.get(10)?),
        claimed_at: row.get::<_, Option<i64>>(11)?.map(from_millis),
        next_attempt_at: row.get::<_, Option<i64>>(12)?.map(from_millis),
        paid_at: row.get::<_, Option<i64>>(13)?.map(from_millis),
        admin_note: row.get(14)?,
    })
}

fn select_one(conn: &Connection, obligation_id: &str) -> PayoutResult<Option<PayoutObligation>> {
    let row = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM payout_obligation WHERE obligation_id = ?1"),
            params![obligation_id],
            map_row,
        )
        .optional()?;
    Ok(row)
}

/// Persist the mutable columns of `next`, guarded on the row still being
/// in `expected`. Amount and player are never written after insert.
fn write_row(conn: &Connection, next: &PayoutObligation, expected: ObligationStatus) -> PayoutResult<()> {
    let changed = conn.execute(
        "UPDATE payout_obligation
         SET status = ?1, attempts = ?2, last_error = ?3, transport_reference = ?4,
             claimed_at = ?5, next_attempt_at = ?6, paid_at = ?7, admin_note = ?8
         WHERE obligation_id = ?9 AND status = ?10",
        params![
            next.status,
            next.attempts as i64,
            next.last_error,
            next.transport_reference,
            next.claimed_at.map(to_millis),
            next.next_attempt_at.map(to_millis),
            next.paid_at.map(to_millis),
            next.admin_note,
            next.obligation_id,
            expected,
        ],
    )?;
    if changed != 1 {
        let actual = select_one(conn, &next.obligation_id)?
            .map(|r| r.status)
            .ok_or_else(|| PayoutError::ObligationNotFound { id: next.obligation_id.clone() })?;
        return Err(PayoutError::StatusConflict {
            id: next.obligation_id.clone(),
            expected,
            actual,
        });
    }
    Ok(())
}

impl PayoutStore {
    // ── Payout obligations: writes ─────────────────────────────────

    /// Insert a new `pending` row with its enqueue event.
    /// Returns the stored row and whether it was newly created; a known
    /// `round_id` yields the existing row instead of a second one.
    pub fn insert_obligation(
        &mut self,
        ob: &PayoutObligation,
    ) -> PayoutResult<(PayoutObligation, bool)> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(round_id) = &ob.round_id {
            let existing = tx
                .query_row(
                    &format!("SELECT {COLUMNS} FROM payout_obligation WHERE round_id = ?1"),
                    params![round_id],
                    map_row,
                )
                .optional()?;
            if let Some(existing) = existing {
                if existing.player_id != ob.player_id
                    || existing.amount != ob.amount
                    || existing.source_combination != ob.source_combination
                {
                    return Err(PayoutError::RoundConflict { round_id: round_id.clone() });
                }
                return Ok((existing, false));
            }
        }

        tx.execute(
            "INSERT INTO payout_obligation (
                obligation_id, round_id, player_id, player_display_name, amount,
                source_combination, status, attempts, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8)",
            params![
                ob.obligation_id,
                ob.round_id,
                ob.player_id,
                ob.player_display_name,
                ob.amount as i64,
                ob.source_combination,
                ObligationStatus::Pending,
                to_millis(ob.created_at),
            ],
        )?;
        append_event(
            &tx,
            &PayoutEvent::ObligationEnqueued {
                obligation_id: ob.obligation_id.clone(),
                round_id: ob.round_id.clone(),
                player_id: ob.player_id.clone(),
                amount: ob.amount,
                combination: ob.source_combination.clone(),
            },
            ob.created_at,
        )?;
        tx.commit()?;
        Ok((ob.clone(), true))
    }

    /// Move up to `limit` payable rows to `processing` in one IMMEDIATE
    /// transaction. The write lock is taken before the select, so two
    /// claimers can never see the same candidate.
    pub fn claim_payable(
        &mut self,
        limit: usize,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> PayoutResult<Vec<PayoutObligation>> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let candidates: Vec<PayoutObligation> = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {COLUMNS} FROM payout_obligation
                 WHERE status = 'pending'
                    OR (status = 'failed' AND attempts < ?1
                        AND (next_attempt_at IS NULL OR next_attempt_at <= ?2))
                 ORDER BY created_at ASC, obligation_id ASC
                 LIMIT ?3"
            ))?;
            let rows = stmt
                .query_map(
                    params![max_attempts as i64, to_millis(now), limit as i64],
                    map_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut claimed = Vec::with_capacity(candidates.len());
        for row in candidates {
            let mut next = row.clone();
            next.status = ObligationStatus::Processing;
            next.claimed_at = Some(now);
            write_row(&tx, &next, row.status)?;
            append_event(
                &tx,
                &PayoutEvent::ObligationClaimed {
                    obligation_id: next.obligation_id.clone(),
                    attempts: next.attempts,
                },
                now,
            )?;
            claimed.push(next);
        }
        tx.commit()?;
        Ok(claimed)
    }

    /// Apply one transition to a single row. `apply` sees the current row
    /// (already checked to be in `expected`) and returns the new row plus
    /// its audit event. Both are written in one transaction.
    pub fn transition<F>(
        &mut self,
        obligation_id: &str,
        expected: ObligationStatus,
        now: DateTime<Utc>,
        apply: F,
    ) -> PayoutResult<PayoutObligation>
    where
        F: FnOnce(&PayoutObligation) -> (PayoutObligation, PayoutEvent),
    {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = select_one(&tx, obligation_id)?
            .ok_or_else(|| PayoutError::ObligationNotFound { id: obligation_id.to_string() })?;
        if current.status != expected {
            return Err(PayoutError::StatusConflict {
                id: obligation_id.to_string(),
                expected,
                actual: current.status,
            });
        }
        let (next, event) = apply(&current);
        write_row(&tx, &next, expected)?;
        append_event(&tx, &event, now)?;
        tx.commit()?;
        Ok(next)
    }

    /// Apply `apply` to every `processing` row claimed before `cutoff`.
    pub fn reclaim_stale<F>(
        &mut self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
        apply: F,
    ) -> PayoutResult<Vec<PayoutObligation>>
    where
        F: Fn(&PayoutObligation) -> (PayoutObligation, PayoutEvent),
    {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let stale: Vec<PayoutObligation> = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {COLUMNS} FROM payout_obligation
                 WHERE status = 'processing' AND (claimed_at IS NULL OR claimed_at < ?1)
                 ORDER BY claimed_at ASC"
            ))?;
            let rows = stmt
                .query_map(params![to_millis(cutoff)], map_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut reclaimed = Vec::with_capacity(stale.len());
        for row in stale {
            let (next, event) = apply(&row);
            write_row(&tx, &next, ObligationStatus::Processing)?;
            append_event(&tx, &event, now)?;
            reclaimed.push(next);
        }
        tx.commit()?;
        Ok(reclaimed)
    }

    // ── Payout obligations: reads ──────────────────────────────────

    pub fn get_obligation(&self, obligation_id: &str) -> PayoutResult<Option<PayoutObligation>> {
        select_one(&self.conn, obligation_id)
    }

    pub fn obligations_by_status(&self, status: ObligationStatus) -> PayoutResult<Vec<PayoutObligation>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {COLUMNS} FROM payout_obligation
             WHERE status = ?1
             ORDER BY created_at ASC, obligation_id ASC"
        ))?;
        let rows = stmt
            .query_map(params![status], map_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn obligations_by_player(&self, player_id: &str) -> PayoutResult<Vec<PayoutObligation>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {COLUMNS} FROM payout_obligation
             WHERE player_id = ?1
             ORDER BY created_at ASC, obligation_id ASC"
        ))?;
        let rows = stmt
            .query_map(params![player_id], map_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn status_counts(&self) -> PayoutResult<BTreeMap<ObligationStatus, u64>> {
        let mut stmt = self.conn.prepare(
            "SELECT status, COUNT(*) FROM payout_obligation GROUP BY status",
        )?;
        let counts = stmt
            .query_map([], |row| {
                Ok((row.get::<_, ObligationStatus>(0)?, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        Ok(counts)
    }
}

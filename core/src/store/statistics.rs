use super::{to_millis, PayoutStore};
use crate::{error::PayoutResult, types::OutcomeCode};
use chrono::{DateTime, Utc};
use rusqlite::{params, TransactionBehavior};
use std::collections::BTreeMap;

impl PayoutStore {
    // ── Outcome statistics ─────────────────────────────────────────

    /// Persist absolute counters. Counters only grow, so a stored value is
    /// never lowered by a stale snapshot.
    pub fn save_outcome_counts(
        &mut self,
        counts: &BTreeMap<OutcomeCode, u64>,
        at: DateTime<Utc>,
    ) -> PayoutResult<()> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO outcome_stat (outcome_code, occurrences, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (outcome_code) DO UPDATE
                 SET occurrences = MAX(occurrences, excluded.occurrences),
                     updated_at  = excluded.updated_at",
            )?;
            for (&code, &n) in counts {
                stmt.execute(params![code as i64, n as i64, to_millis(at)])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_outcome_counts(&self) -> PayoutResult<BTreeMap<OutcomeCode, u64>> {
        let mut stmt = self.conn.prepare(
            "SELECT outcome_code, occurrences FROM outcome_stat ORDER BY outcome_code",
        )?;
        let counts = stmt
            .query_map([], |row| {
                Ok((row.get::<_, i64>(0)? as OutcomeCode, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        Ok(counts)
    }
}

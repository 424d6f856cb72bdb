use std::time::{Duration, SystemTime};

use uuid::Uuid;

use crate::dao::models::PlayerTurnRecord;

/// Holder elected from a set of player records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectedHolder {
    /// Record of the holder.
    pub record_id: Uuid,
    /// Holder's name.
    pub name: String,
    /// Store time of the winning claim.
    pub turn_started_at: SystemTime,
    /// Claim time plus the turn duration.
    pub deadline: SystemTime,
}

/// Records waiting for a turn, oldest claim first.
///
/// Only eligible, unfailed claims with a claim time take part. Ties on the claim time
/// are broken by record id so every observer computes the same order.
pub fn queue_order(records: &[PlayerTurnRecord]) -> Vec<&PlayerTurnRecord> {
    let mut queued: Vec<&PlayerTurnRecord> = records
        .iter()
        .filter(|record| record.is_queued() && record.turn_started_at.is_some())
        .collect();
    queued.sort_by(|a, b| {
        a.turn_started_at
            .cmp(&b.turn_started_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    queued
}

/// Pick the current holder, if any, and derive its deadline from the claim time.
pub fn elect_holder(records: &[PlayerTurnRecord], turn_duration: Duration) -> Option<ElectedHolder> {
    let first = queue_order(records).into_iter().next()?;
    let turn_started_at = first.turn_started_at?;
    Some(ElectedHolder {
        record_id: first.id,
        name: first.name.clone(),
        turn_started_at,
        deadline: turn_started_at + turn_duration,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use std::time::UNIX_EPOCH;

    const TURN: Duration = Duration::from_secs(15);

    fn record(name: &str, claimed_at: Option<u64>) -> PlayerTurnRecord {
        let mut record = PlayerTurnRecord::registered(name, UNIX_EPOCH);
        if let Some(at) = claimed_at {
            let fields = record
                .turn_fields()
                .claimed(UNIX_EPOCH + Duration::from_secs(at));
            record.apply_turn_fields(fields, UNIX_EPOCH);
        }
        record
    }

    #[test]
    fn earliest_claim_wins_whatever_the_read_order() {
        let mut records = vec![
            record("carol", Some(30)),
            record("alice", Some(10)),
            record("bob", Some(20)),
            record("dave", None),
        ];
        let mut rng = rand::rng();
        for _ in 0..20 {
            records.shuffle(&mut rng);
            let holder = elect_holder(&records, TURN).unwrap();
            assert_eq!(holder.name, "alice");
            assert_eq!(holder.deadline, UNIX_EPOCH + Duration::from_secs(25));
        }
    }

    #[test]
    fn equal_claim_times_fall_back_to_record_id() {
        let first = record("zed", Some(10));
        let second = record("amy", Some(10));
        let expected = if first.id < second.id { "zed" } else { "amy" };

        let holder = elect_holder(&[second, first], TURN).unwrap();
        assert_eq!(holder.name, expected);
    }

    #[test]
    fn failed_and_ineligible_claims_are_skipped() {
        let mut failed = record("alice", Some(1));
        failed.has_failed = true;
        let mut benched = record("bob", Some(2));
        benched.is_eligible = false;
        let waiting = record("carol", Some(3));

        let records = vec![failed, benched, waiting];
        let order: Vec<_> = queue_order(&records).iter().map(|r| r.name.as_str()).collect();
        assert_eq!(order, ["carol"]);
    }

    #[test]
    fn no_claims_means_no_holder() {
        assert_eq!(elect_holder(&[record("alice", None)], TURN), None);
        assert_eq!(elect_holder(&[], TURN), None);
    }
}

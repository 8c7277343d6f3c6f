//! Commands sent to the replica on the outbound channel.
//!
//! The replica is the only place ledger chain membership changes. A
//! slot proposes changes with these commands and then watches the
//! [`crate::recovery::replica::ReplicaView`] to learn whether they
//! took effect. Field names are part of the wire contract.

use serde::Deserialize;
use serde::Serialize;

use super::slot::*;

/// Announce a freshly created ledger as the candidate tail of a
/// slot's chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AssignLedgerId {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub slot_id: SlotId,
    pub ledger_id: LedgerId,
}

/// Replace a prefix of a slot's chain with the compacted ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CompactLedgerIds {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub slot_id: SlotId,
    pub prev_ledger_ids: Vec<LedgerId>,
    pub new_ledger_ids: Vec<LedgerId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "fn", rename_all = "kebab-case")]
pub enum Command {
    AssignLedgerId(AssignLedgerId),
    CompactLedgerIds(CompactLedgerIds),
}

impl Command {
    pub fn assign(slot: &SlotKey, ledger_id: LedgerId) -> Self {
        Self::AssignLedgerId(AssignLedgerId {
            job_id: slot.job_id.clone(),
            task_id: slot.task_id.clone(),
            slot_id: slot.slot_id,
            ledger_id,
        })
    }

    pub fn compact(slot: &SlotKey, prev_ledger_ids: Vec<LedgerId>, compacted: LedgerId) -> Self {
        Self::CompactLedgerIds(CompactLedgerIds {
            job_id: slot.job_id.clone(),
            task_id: slot.task_id.clone(),
            slot_id: slot.slot_id,
            prev_ledger_ids,
            new_ledger_ids: vec![compacted],
        })
    }

    /// The slot whose chain this command changes.
    pub fn slot(&self) -> SlotKey {
        let (job_id, task_id, slot_id) = match self {
            Self::AssignLedgerId(cmd) => (&cmd.job_id, &cmd.task_id, cmd.slot_id),
            Self::CompactLedgerIds(cmd) => (&cmd.job_id, &cmd.task_id, cmd.slot_id),
        };
        SlotKey {
            job_id: job_id.clone(),
            task_id: task_id.clone(),
            slot_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_test::assert_ser_tokens;
    use serde_test::Token;

    use super::*;

    #[test]
    fn assign_wire_format() {
        let slot = SlotKey::new("job", "task", 2);
        let cmd = Command::assign(&slot, LedgerId(7));

        assert_ser_tokens(
            &cmd,
            &[
                Token::Struct {
                    name: "AssignLedgerId",
                    len: 5,
                },
                Token::Str("fn"),
                Token::Str("assign-ledger-id"),
                Token::Str("job-id"),
                Token::Str("job"),
                Token::Str("task-id"),
                Token::Str("task"),
                Token::Str("slot-id"),
                Token::U64(2),
                Token::Str("ledger-id"),
                Token::U64(7),
                Token::StructEnd,
            ],
        );
    }

    #[test]
    fn compact_wire_format() {
        let slot = SlotKey::new("job", "task", 0);
        let cmd = Command::compact(&slot, vec![LedgerId(1), LedgerId(3)], LedgerId(5));

        assert_ser_tokens(
            &cmd,
            &[
                Token::Struct {
                    name: "CompactLedgerIds",
                    len: 6,
                },
                Token::Str("fn"),
                Token::Str("compact-ledger-ids"),
                Token::Str("job-id"),
                Token::Str("job"),
                Token::Str("task-id"),
                Token::Str("task"),
                Token::Str("slot-id"),
                Token::U64(0),
                Token::Str("prev-ledger-ids"),
                Token::Seq { len: Some(2) },
                Token::U64(1),
                Token::U64(3),
                Token::SeqEnd,
                Token::Str("new-ledger-ids"),
                Token::Seq { len: Some(1) },
                Token::U64(5),
                Token::SeqEnd,
                Token::StructEnd,
            ],
        );
    }

    #[test]
    fn parses_from_json() {
        let found: Command = serde_json::from_str(
            r#"{"fn": "assign-ledger-id", "job-id": "job", "task-id": "task", "slot-id": 2, "ledger-id": 7}"#,
        )
        .unwrap();
        assert_eq!(found, Command::assign(&SlotKey::new("job", "task", 2), LedgerId(7)));
        assert_eq!(found.slot(), SlotKey::new("job", "task", 2));
    }
}

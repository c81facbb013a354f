use super::{Address, Transaction};

/// The change heuristic only applies to plain payments with exactly two outputs.
pub fn has_change_shape(tx: &Transaction) -> bool {
    tx.outputs.len() == 2
}

/// True when no transaction in `history` happened strictly before `before`.
///
/// The transaction being judged sits in the history with `time == before`,
/// so it never counts against the address.
pub fn is_first_seen(history: &[Transaction], before: i64) -> bool {
    history.iter().all(|tx| tx.time >= before)
}

/// Pick the change output of a two-output transaction.
///
/// `first_seen[i]` tells whether output `i` had no earlier history. Exactly one
/// first-seen output is the change; zero or two is ambiguous and yields `None`.
pub fn select_change_output(tx: &Transaction, first_seen: [bool; 2]) -> Option<&Address> {
    if !has_change_shape(tx) {
        return None;
    }
    match first_seen {
        [true, false] => Some(&tx.outputs[0]),
        [false, true] => Some(&tx.outputs[1]),
        _ => None,
    }
}

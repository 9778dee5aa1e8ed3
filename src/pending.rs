// SPDX-FileCopyrightText: 2022-2024 Smart Information Flow Technologies
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Correlating answers with the requests that are waiting for them.

use crate::{errors::ProtocolMismatch, protocol::Answer};
use nix::unistd::Pid;
use std::collections::{BTreeMap, HashMap};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestState {
    /// Sent, no answer yet.
    Pending,
    /// Answered, but the caller hasn't picked the answer up.
    Answered(Answer),
}

#[derive(Debug)]
struct Request<W> {
    code: i32,
    state: RequestState,
    waiter: W,
}

/// Outstanding requests, keyed by pid and sequence number. `W` is whatever wakes the caller up.
///
/// A request goes `Pending` -> `Answered` -> applied, at which point it is removed. Sequence
/// numbers are allocated per pid and wrap, never reusing one that is still outstanding.
#[derive(Debug)]
pub struct PendingTable<W> {
    requests: HashMap<Pid, BTreeMap<u16, Request<W>>>,
    next_seqnr: HashMap<Pid, u16>,
}

impl<W> Default for PendingTable<W> {
    fn default() -> Self {
        PendingTable {
            requests: HashMap::new(),
            next_seqnr: HashMap::new(),
        }
    }
}

impl<W> PendingTable<W> {
    pub fn new() -> PendingTable<W> {
        PendingTable::default()
    }

    /// Records a new pending request and returns its sequence number.
    pub fn insert(&mut self, pid: Pid, code: i32, waiter: W) -> Result<u16, ProtocolMismatch> {
        let requests = self.requests.entry(pid).or_default();
        if requests.len() > u16::MAX as usize {
            return Err(ProtocolMismatch(format!(
                "pid {} has no free sequence numbers",
                pid
            )));
        }

        let next = self.next_seqnr.entry(pid).or_insert(0);
        let mut seqnr = *next;
        while requests.contains_key(&seqnr) {
            seqnr = seqnr.wrapping_add(1);
        }
        *next = seqnr.wrapping_add(1);

        requests.insert(
            seqnr,
            Request {
                code,
                state: RequestState::Pending,
                waiter,
            },
        );
        Ok(seqnr)
    }

    /// Matches an answer to its pending request. On success, returns the request's waiter. An
    /// answer that matches nothing pending changes nothing.
    pub fn answer(&mut self, answer: Answer) -> Result<&W, ProtocolMismatch> {
        let request = self
            .requests
            .get_mut(&answer.pid)
            .and_then(|requests| requests.get_mut(&answer.seqnr))
            .ok_or_else(|| {
                ProtocolMismatch(format!(
                    "answer for pid {} seqnr {} matches no request",
                    answer.pid, answer.seqnr
                ))
            })?;
        if request.state != RequestState::Pending {
            return Err(ProtocolMismatch(format!(
                "pid {} seqnr {} was already answered",
                answer.pid, answer.seqnr
            )));
        }
        request.state = RequestState::Answered(answer);
        Ok(&request.waiter)
    }

    /// Removes an answered request, returning its answer. Requests without an answer stay.
    pub fn apply(&mut self, pid: Pid, seqnr: u16) -> Option<Answer> {
        let requests = self.requests.get_mut(&pid)?;
        let answer = match requests.get(&seqnr)?.state {
            RequestState::Answered(answer) => answer,
            RequestState::Pending => return None,
        };
        requests.remove(&seqnr);
        if requests.is_empty() {
            self.requests.remove(&pid);
        }
        Some(answer)
    }

    /// Removes one request, whatever its state.
    pub fn retract(&mut self, pid: Pid, seqnr: u16) -> Option<W> {
        let requests = self.requests.get_mut(&pid)?;
        let request = requests.remove(&seqnr)?;
        if requests.is_empty() {
            self.requests.remove(&pid);
        }
        Some(request.waiter)
    }

    /// Removes every request of a process, e.g. because it exited.
    pub fn retract_pid(&mut self, pid: Pid) -> Vec<(u16, W)> {
        self.next_seqnr.remove(&pid);
        self.requests
            .remove(&pid)
            .into_iter()
            .flatten()
            .map(|(seqnr, request)| (seqnr, request.waiter))
            .collect()
    }

    /// Removes every request.
    pub fn retract_all(&mut self) -> Vec<(Pid, u16, W)> {
        self.requests
            .drain()
            .flat_map(|(pid, requests)| {
                requests
                    .into_iter()
                    .map(move |(seqnr, request)| (pid, seqnr, request.waiter))
            })
            .collect()
    }

    pub fn state(&self, pid: Pid, seqnr: u16) -> Option<RequestState> {
        self.requests
            .get(&pid)
            .and_then(|requests| requests.get(&seqnr))
            .map(|request| request.state)
    }

    pub fn code(&self, pid: Pid, seqnr: u16) -> Option<i32> {
        self.requests
            .get(&pid)
            .and_then(|requests| requests.get(&seqnr))
            .map(|request| request.code)
    }

    pub fn len(&self) -> usize {
        self.requests.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    #[cfg(test)]
    fn set_next_seqnr(&mut self, pid: Pid, seqnr: u16) {
        self.next_seqnr.insert(pid, seqnr);
    }
}

#[cfg(test)]
mod tests {
    use super::{PendingTable, RequestState};
    use crate::protocol::Answer;
    use nix::unistd::Pid;

    #[test]
    fn unmatched_answer_has_no_effect() {
        let pid = Pid::from_raw(10);
        let mut table = PendingTable::new();
        table.set_next_seqnr(pid, 5);
        assert_eq!(table.insert(pid, 5, "waiter").unwrap(), 5);

        // An answer for seqnr 6 matches nothing
        assert!(table.answer(Answer::permit(pid, 6)).is_err());
        assert!(table.answer(Answer::permit(Pid::from_raw(11), 5)).is_err());
        assert_eq!(table.state(pid, 5), Some(RequestState::Pending));
        assert_eq!(table.len(), 1);
        assert_eq!(table.apply(pid, 5), None);

        // The right one goes through, once
        assert_eq!(*table.answer(Answer::permit(pid, 5)).unwrap(), "waiter");
        assert!(table.answer(Answer::deny(pid, 5, 1)).is_err());
        assert_eq!(
            table.state(pid, 5),
            Some(RequestState::Answered(Answer::permit(pid, 5)))
        );
        assert_eq!(table.apply(pid, 5), Some(Answer::permit(pid, 5)));
        assert!(table.is_empty());
        assert_eq!(table.state(pid, 5), None);
    }

    #[test]
    fn answers_only_reach_their_own_seqnr() {
        let pid = Pid::from_raw(14);
        let mut table = PendingTable::new();
        table.set_next_seqnr(pid, 5);
        assert_eq!(table.insert(pid, 3, "five").unwrap(), 5);
        assert_eq!(table.insert(pid, 4, "six").unwrap(), 6);

        assert_eq!(*table.answer(Answer::deny(pid, 5, 13)).unwrap(), "five");
        assert_eq!(table.state(pid, 6), Some(RequestState::Pending));
        assert_eq!(table.apply(pid, 6), None);
        assert_eq!(table.apply(pid, 5), Some(Answer::deny(pid, 5, 13)));
        assert_eq!(table.len(), 1);
        assert_eq!(table.code(pid, 6), Some(4));

        assert_eq!(*table.answer(Answer::permit(pid, 6)).unwrap(), "six");
        assert_eq!(table.apply(pid, 6), Some(Answer::permit(pid, 6)));
        assert!(table.is_empty());
    }

    #[test]
    fn seqnrs_wrap_and_skip_outstanding() {
        let pid = Pid::from_raw(12);
        let mut table = PendingTable::new();
        assert_eq!(table.insert(pid, 1, ()).unwrap(), 0);
        assert_eq!(table.insert(pid, 1, ()).unwrap(), 1);
        table.set_next_seqnr(pid, u16::MAX);
        assert_eq!(table.insert(pid, 1, ()).unwrap(), u16::MAX);
        // 0 and 1 are still outstanding
        assert_eq!(table.insert(pid, 1, ()).unwrap(), 2);
        assert_eq!(table.code(pid, 2), Some(1));

        // Other pids count on their own
        assert_eq!(table.insert(Pid::from_raw(13), 1, ()).unwrap(), 0);
    }

    #[test]
    fn retraction() {
        let mut table = PendingTable::new();
        let a = Pid::from_raw(20);
        let b = Pid::from_raw(21);
        let a0 = table.insert(a, 3, 'x').unwrap();
        let a1 = table.insert(a, 4, 'y').unwrap();
        let b0 = table.insert(b, 3, 'z').unwrap();

        assert_eq!(table.retract(b, b0), Some('z'));
        assert_eq!(table.retract(b, b0), None);

        let retracted = table.retract_pid(a);
        assert_eq!(retracted, vec![(a0, 'x'), (a1, 'y')]);
        assert!(table.is_empty());
        assert!(table.answer(Answer::permit(a, a0)).is_err());

        table.insert(a, 3, 'x').unwrap();
        table.insert(b, 3, 'z').unwrap();
        let all = table.retract_all();
        assert_eq!(all.len(), 2);
        assert!(all.contains(&(b, 1, 'z')));
        assert!(table.is_empty());
    }
}

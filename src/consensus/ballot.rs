use super::message::{Ballot, NodeId};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Role {
    Leader,
    Follower,
}

/// Promise bookkeeping for one node.
///
/// `highest` only ever grows. `promised` marks an outstanding promise and is
/// dropped when the round for that ballot concludes. The role is derived: a
/// node leads exactly while it holds a quorum for the ballot it has promised.
#[derive(Debug, Clone)]
pub struct BallotArbiter {
    id: NodeId,
    ballot_seq: u64,
    highest: Option<Ballot>,
    promised: bool,
    leading: Option<Ballot>,
}

impl BallotArbiter {
    pub fn new(id: NodeId) -> Self {
        BallotArbiter {
            id,
            ballot_seq: 0,
            highest: None,
            promised: false,
            leading: None,
        }
    }

    /// Resumes from a ballot floor saved before a restart. No round is in
    /// flight afterwards, so the node starts as a follower.
    pub fn restore(id: NodeId, floor: Option<Ballot>) -> Self {
        BallotArbiter {
            id,
            ballot_seq: floor.map_or(0, |ballot| ballot.seq),
            highest: floor,
            promised: false,
            leading: None,
        }
    }

    /// Issues a ballot above anything issued or seen so far and promises it
    /// to ourselves.
    pub fn next_ballot(&mut self) -> Ballot {
        let seen = self.highest.map_or(0, |ballot| ballot.seq);
        self.ballot_seq = self.ballot_seq.max(seen) + 1;
        let ballot = Ballot::new(self.ballot_seq, self.id);
        self.highest = Some(ballot);
        self.promised = true;
        self.leading = None;
        ballot
    }

    /// Prepare needs a strictly higher ballot than any promised before.
    pub fn on_prepare(&mut self, ballot: Ballot) -> Result<(), Ballot> {
        match self.highest {
            Some(highest) if ballot <= highest => Err(highest),
            _ => {
                self.promise(ballot);
                Ok(())
            }
        }
    }

    /// Accept is honoured for the promised ballot itself or anything above it:
    /// the equal case is the promised proposer's own Accept, which Paxos
    /// phase 2 must let through. Only strictly lower ballots are refused.
    pub fn on_accept(&mut self, ballot: Ballot) -> Result<(), Ballot> {
        match self.highest {
            Some(highest) if ballot < highest => Err(highest),
            Some(highest) if ballot == highest => Ok(()),
            _ => {
                self.promise(ballot);
                Ok(())
            }
        }
    }

    /// Records a competing ballot learned from a rejection so the next
    /// ballot we issue jumps past it.
    pub fn observe(&mut self, ballot: Ballot) {
        self.ballot_seq = self.ballot_seq.max(ballot.seq);
    }

    /// Becomes leader for `ballot` once a promise quorum is in, provided no
    /// higher ballot was promised meanwhile.
    pub fn elect(&mut self, ballot: Ballot) -> bool {
        if self.highest == Some(ballot) {
            self.leading = Some(ballot);
            true
        } else {
            false
        }
    }

    /// Ends the round for `ballot`; the ballot stays as the floor for later
    /// prepares.
    pub fn conclude(&mut self, ballot: Ballot) {
        if self.highest == Some(ballot) {
            self.promised = false;
        }
        if self.leading == Some(ballot) {
            self.leading = None;
        }
    }

    pub fn role(&self) -> Role {
        match self.leading {
            Some(ballot) if self.promised && self.highest == Some(ballot) => Role::Leader,
            _ => Role::Follower,
        }
    }

    pub fn is_promised(&self) -> bool {
        self.promised
    }

    pub fn highest(&self) -> Option<Ballot> {
        self.highest
    }

    pub fn holds(&self, ballot: Ballot) -> bool {
        self.highest == Some(ballot)
    }

    fn promise(&mut self, ballot: Ballot) {
        self.highest = Some(ballot);
        self.promised = true;
        if self.leading.is_some_and(|leading| leading < ballot) {
            self.leading = None;
        }
    }
}

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::identity::IdentityId;
use crate::rooms::RoomId;

pub const MIN_OPTIONS: usize = 2;
pub const MAX_OPTIONS: usize = 10;
pub const MAX_QUESTION_LEN: usize = 500;
pub const MAX_OPTION_LEN: usize = 200;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollStatus {
    Active,
    Closed,
}

impl PollStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Closed => "closed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollOption {
    pub id: Uuid,
    pub text: String,
    /// Always `voter_ids.len()`; recomputed after every change.
    pub votes: u32,
    pub voter_ids: BTreeSet<IdentityId>,
}

impl PollOption {
    fn new(text: String) -> Self {
        Self {
            id: Uuid::now_v7(),
            text,
            votes: 0,
            voter_ids: BTreeSet::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Poll {
    pub id: Uuid,
    pub room_id: RoomId,
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub options: Vec<PollOption>,
    pub created_by: IdentityId,
    pub allow_multiple_votes: bool,
    pub status: PollStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub closed_at: Option<OffsetDateTime>,
}

/// What a client asks for when creating a poll.
#[derive(Clone, Debug, Default)]
pub struct NewPoll {
    pub room_id: RoomId,
    pub question: String,
    pub description: Option<String>,
    pub options: Vec<String>,
    pub allow_multiple_votes: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionTally {
    pub id: Uuid,
    pub text: String,
    pub votes: u32,
    pub percentage: f64,
}

/// Vote counts as broadcast after every change.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollTally {
    pub poll_id: Uuid,
    pub options: Vec<OptionTally>,
    pub total_votes: u32,
}

impl Poll {
    pub(crate) fn from_request(request: NewPoll, creator: &str) -> CoreResult<Self> {
        let question = request.question.trim();
        if question.is_empty() {
            return Err(CoreError::invalid("poll question is empty"));
        }
        if question.chars().count() > MAX_QUESTION_LEN {
            return Err(CoreError::ContentTooLong {
                limit: MAX_QUESTION_LEN,
                actual: question.chars().count(),
            });
        }

        let options: Vec<String> = request
            .options
            .iter()
            .map(|o| o.trim())
            .filter(|o| !o.is_empty())
            .map(str::to_owned)
            .collect();
        if !(MIN_OPTIONS..=MAX_OPTIONS).contains(&options.len()) {
            return Err(CoreError::invalid(format!(
                "a poll needs {MIN_OPTIONS} to {MAX_OPTIONS} non-empty options, got {}",
                options.len()
            )));
        }
        if let Some(long) = options.iter().find(|o| o.chars().count() > MAX_OPTION_LEN) {
            return Err(CoreError::ContentTooLong {
                limit: MAX_OPTION_LEN,
                actual: long.chars().count(),
            });
        }

        let description = request
            .description
            .map(|d| d.trim().to_owned())
            .filter(|d| !d.is_empty());

        Ok(Self {
            id: Uuid::now_v7(),
            room_id: request.room_id,
            question: question.to_owned(),
            description,
            options: options.into_iter().map(PollOption::new).collect(),
            created_by: creator.to_owned(),
            allow_multiple_votes: request.allow_multiple_votes,
            status: PollStatus::Active,
            created_at: OffsetDateTime::now_utc(),
            closed_at: None,
        })
    }

    pub fn is_active(&self) -> bool {
        self.status == PollStatus::Active
    }

    /// Apply one vote toggle. Every check happens before the first mutation.
    pub(crate) fn apply_vote(&mut self, voter: &str, option_id: Uuid) -> CoreResult<()> {
        if !self.is_active() {
            return Err(CoreError::PollClosed);
        }
        let target = self
            .options
            .iter()
            .position(|o| o.id == option_id)
            .ok_or(CoreError::OptionNotFound(option_id))?;

        if self.allow_multiple_votes {
            let option = &mut self.options[target];
            if !option.voter_ids.remove(voter) {
                option.voter_ids.insert(voter.to_owned());
            }
        } else {
            let retracting = self.options[target].voter_ids.contains(voter);
            for option in &mut self.options {
                option.voter_ids.remove(voter);
            }
            if !retracting {
                self.options[target].voter_ids.insert(voter.to_owned());
            }
        }

        self.recount();
        Ok(())
    }

    pub(crate) fn close(&mut self, requester: &str) -> CoreResult<()> {
        if self.created_by != requester {
            return Err(CoreError::NotOwner("close"));
        }
        if !self.is_active() {
            return Err(CoreError::AlreadyClosed);
        }
        self.status = PollStatus::Closed;
        self.closed_at = Some(OffsetDateTime::now_utc());
        Ok(())
    }

    fn recount(&mut self) {
        for option in &mut self.options {
            option.votes = option.voter_ids.len() as u32;
        }
    }

    pub fn total_votes(&self) -> u32 {
        self.options.iter().map(|o| o.votes).sum()
    }

    pub fn tally(&self) -> PollTally {
        let total = self.total_votes();
        PollTally {
            poll_id: self.id,
            options: self
                .options
                .iter()
                .map(|o| OptionTally {
                    id: o.id,
                    text: o.text.clone(),
                    votes: o.votes,
                    percentage: percentage(o.votes, total),
                })
                .collect(),
            total_votes: total,
        }
    }
}

/// Share of `total`, in percent, rounded to one decimal. Zero when nobody voted.
pub fn percentage(votes: u32, total: u32) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (f64::from(votes) / f64::from(total) * 1000.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(options: &[&str], multiple: bool) -> NewPoll {
        NewPoll {
            room_id: "global".into(),
            question: "Pizza or Pasta?".into(),
            description: None,
            options: options.iter().map(|o| o.to_string()).collect(),
            allow_multiple_votes: multiple,
        }
    }

    fn option(poll: &Poll, text: &str) -> Uuid {
        poll.options.iter().find(|o| o.text == text).unwrap().id
    }

    fn votes(poll: &Poll) -> Vec<(String, u32, f64)> {
        poll.tally()
            .options
            .into_iter()
            .map(|o| (o.text, o.votes, o.percentage))
            .collect()
    }

    #[test]
    fn option_count_is_bounded() {
        assert!(Poll::from_request(request(&["only"], false), "a").is_err());
        assert!(Poll::from_request(request(&["a", "  ", ""], false), "a").is_err());
        let eleven: Vec<String> = (0..11).map(|i| i.to_string()).collect();
        let eleven: Vec<&str> = eleven.iter().map(String::as_str).collect();
        assert!(Poll::from_request(request(&eleven, false), "a").is_err());

        let poll = Poll::from_request(request(&[" a ", "", "b"], false), "a").unwrap();
        assert_eq!(poll.options.len(), 2);
        assert_eq!(poll.options[0].text, "a");
    }

    #[test]
    fn empty_question_is_rejected() {
        let mut req = request(&["a", "b"], false);
        req.question = "   ".into();
        assert!(matches!(
            Poll::from_request(req, "a"),
            Err(CoreError::Validation(_))
        ));
    }

    #[test]
    fn pizza_or_pasta() {
        let mut poll = Poll::from_request(request(&["Pizza", "Pasta"], false), "host").unwrap();
        let pizza = option(&poll, "Pizza");
        let pasta = option(&poll, "Pasta");

        poll.apply_vote("A", pizza).unwrap();
        assert_eq!(
            votes(&poll),
            vec![("Pizza".to_string(), 1u32, 100.0), ("Pasta".to_string(), 0u32, 0.0)]
        );

        poll.apply_vote("A", pasta).unwrap();
        assert_eq!(
            votes(&poll),
            vec![("Pizza".to_string(), 0u32, 0.0), ("Pasta".to_string(), 1u32, 100.0)]
        );

        poll.apply_vote("B", pizza).unwrap();
        assert_eq!(
            votes(&poll),
            vec![("Pizza".to_string(), 1u32, 50.0), ("Pasta".to_string(), 1u32, 50.0)]
        );
    }

    #[test]
    fn single_vote_reselect_retracts() {
        let mut poll = Poll::from_request(request(&["x", "y"], false), "host").unwrap();
        let x = option(&poll, "x");
        poll.apply_vote("A", x).unwrap();
        poll.apply_vote("A", x).unwrap();
        assert_eq!(poll.total_votes(), 0);
        assert!(poll.options.iter().all(|o| o.voter_ids.is_empty()));
    }

    #[test]
    fn multiple_votes_toggle_per_option() {
        let mut poll = Poll::from_request(request(&["x", "y", "z"], true), "host").unwrap();
        let x = option(&poll, "x");
        let y = option(&poll, "y");

        poll.apply_vote("A", x).unwrap();
        poll.apply_vote("A", y).unwrap();
        assert_eq!(poll.total_votes(), 2);

        let before = poll.clone();
        poll.apply_vote("A", y).unwrap();
        poll.apply_vote("A", y).unwrap();
        assert_eq!(poll, before);
    }

    #[test]
    fn rejected_votes_change_nothing() {
        let mut poll = Poll::from_request(request(&["x", "y"], false), "host").unwrap();
        let x = option(&poll, "x");
        poll.apply_vote("A", x).unwrap();

        let before = serde_json::to_vec(&poll).unwrap();
        assert_eq!(
            poll.apply_vote("B", Uuid::nil()),
            Err(CoreError::OptionNotFound(Uuid::nil()))
        );
        poll.close("host").unwrap();
        let closed = serde_json::to_vec(&poll).unwrap();
        assert_eq!(poll.apply_vote("B", x), Err(CoreError::PollClosed));
        assert_eq!(serde_json::to_vec(&poll).unwrap(), closed);
        assert_ne!(before, closed);
    }

    #[test]
    fn only_creator_closes_once() {
        let mut poll = Poll::from_request(request(&["x", "y"], false), "host").unwrap();
        assert_eq!(poll.close("guest"), Err(CoreError::NotOwner("close")));
        assert!(poll.is_active());
        poll.close("host").unwrap();
        assert!(poll.closed_at.is_some());
        assert_eq!(poll.close("host"), Err(CoreError::AlreadyClosed));
    }

    #[test]
    fn percentages_round_to_one_decimal() {
        assert_eq!(percentage(1, 3), 33.3);
        assert_eq!(percentage(2, 3), 66.7);
        assert_eq!(percentage(0, 0), 0.0);
        assert_eq!(percentage(5, 5), 100.0);
    }

    mod proptests {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn single_vote_invariant_holds(
                ops in proptest::collection::vec((0usize..6, 0usize..4), 0..200),
            ) {
                let mut poll = Poll::from_request(request(&["a", "b", "c", "d"], false), "host").unwrap();
                let ids: Vec<Uuid> = poll.options.iter().map(|o| o.id).collect();
                for (voter, opt) in ops {
                    poll.apply_vote(&format!("v{voter}"), ids[opt]).unwrap();
                }

                let mut standing = BTreeSet::new();
                for option in &poll.options {
                    prop_assert_eq!(option.votes as usize, option.voter_ids.len());
                    for voter in &option.voter_ids {
                        prop_assert!(standing.insert(voter.clone()), "{} voted twice", voter);
                    }
                }
                prop_assert_eq!(poll.total_votes() as usize, standing.len());
            }

            #[test]
            fn multiple_vote_double_toggle_is_identity(
                setup in proptest::collection::vec((0usize..4, 0usize..3), 0..50),
                voter in 0usize..4,
                opt in 0usize..3,
            ) {
                let mut poll = Poll::from_request(request(&["a", "b", "c"], true), "host").unwrap();
                let ids: Vec<Uuid> = poll.options.iter().map(|o| o.id).collect();
                for (v, o) in setup {
                    poll.apply_vote(&format!("v{v}"), ids[o]).unwrap();
                }

                let before = poll.tally();
                let voter = format!("v{voter}");
                poll.apply_vote(&voter, ids[opt]).unwrap();
                poll.apply_vote(&voter, ids[opt]).unwrap();
                prop_assert_eq!(poll.tally(), before);
                for option in &poll.options {
                    prop_assert_eq!(option.votes as usize, option.voter_ids.len());
                }
            }
        }
    }
}

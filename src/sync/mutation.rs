//! Mutations applied inside the coordinator's critical section.
//!
//! Each mutation checks its preconditions against the freshly loaded roster,
//! applies itself to a working copy, and states what must be observable on
//! that copy before it may be written back.

use std::collections::BTreeMap;

use crate::error::RosterError;
use crate::predictor::Predictor;
use crate::roster::{Prediction, ResponseBits, Roster};

pub(crate) trait Mutation: Sync {
    type Output: Send;

    fn name(&self) -> &'static str;

    fn validate(&self, loaded: &Roster) -> Result<(), RosterError>;

    fn apply(
        &self,
        working: &mut Roster,
        predictor: &dyn Predictor,
    ) -> Result<Self::Output, RosterError>;

    fn converged(&self, loaded: &Roster, working: &Roster) -> bool;
}

/// Trims ids, drops blanks and duplicates while keeping first-seen order.
pub(crate) fn normalize_ids<S: AsRef<str>>(ids: &[S]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    ids.iter()
        .map(|id| id.as_ref().trim())
        .filter(|id| !id.is_empty() && seen.insert(*id))
        .map(str::to_string)
        .collect()
}

/// Trimmed id of the single student an operation targets.
pub(crate) fn student_id(raw: &str) -> Result<String, RosterError> {
    match raw.trim() {
        "" => Err(RosterError::BlankStudentId),
        id => Ok(id.to_string()),
    }
}

pub(crate) struct Enroll {
    pub topic: String,
    pub students: Vec<String>,
}

impl Mutation for Enroll {
    type Output = usize;

    fn name(&self) -> &'static str {
        "enroll_students"
    }

    fn validate(&self, loaded: &Roster) -> Result<(), RosterError> {
        loaded.ensure_topic(&self.topic)
    }

    fn apply(&self, working: &mut Roster, _: &dyn Predictor) -> Result<usize, RosterError> {
        working.enroll(&self.topic, &self.students)
    }

    fn converged(&self, _: &Roster, working: &Roster) -> bool {
        self.students
            .iter()
            .all(|student| working.mastery_of(&self.topic, student).is_ok())
    }
}

pub(crate) struct Unenroll {
    pub topic: String,
    pub students: Vec<String>,
}

impl Mutation for Unenroll {
    type Output = usize;

    fn name(&self) -> &'static str {
        "unenroll_students"
    }

    fn validate(&self, loaded: &Roster) -> Result<(), RosterError> {
        loaded.ensure_topic(&self.topic)
    }

    fn apply(&self, working: &mut Roster, _: &dyn Predictor) -> Result<usize, RosterError> {
        working.unenroll(&self.topic, &self.students)
    }

    fn converged(&self, _: &Roster, working: &Roster) -> bool {
        self.students.iter().all(|student| {
            matches!(
                working.mastery_of(&self.topic, student),
                Err(RosterError::StudentNotEnrolled { .. })
            )
        })
    }
}

pub(crate) struct UnenrollEverywhere {
    pub student: String,
}

impl Mutation for UnenrollEverywhere {
    type Output = usize;

    fn name(&self) -> &'static str {
        "unenroll_student_everywhere"
    }

    fn validate(&self, _: &Roster) -> Result<(), RosterError> {
        Ok(())
    }

    fn apply(&self, working: &mut Roster, _: &dyn Predictor) -> Result<usize, RosterError> {
        Ok(working.unenroll_everywhere(&self.student))
    }

    fn converged(&self, _: &Roster, working: &Roster) -> bool {
        working
            .skills()
            .iter()
            .all(|topic| !working.is_enrolled(topic, &self.student))
    }
}

/// Single-student mastery read. Auto-enrolls, so it is a write.
pub(crate) struct MasteryOf {
    pub topic: String,
    pub student: String,
}

impl Mutation for MasteryOf {
    type Output = Prediction;

    fn name(&self) -> &'static str {
        "get_mastery"
    }

    fn validate(&self, loaded: &Roster) -> Result<(), RosterError> {
        loaded.ensure_topic(&self.topic)
    }

    fn apply(&self, working: &mut Roster, _: &dyn Predictor) -> Result<Prediction, RosterError> {
        working.enroll(&self.topic, [&self.student])?;
        working.mastery_of(&self.topic, &self.student)
    }

    fn converged(&self, _: &Roster, working: &Roster) -> bool {
        working.mastery_of(&self.topic, &self.student).is_ok()
    }
}

pub(crate) struct AllMasteries {
    pub student: String,
}

impl Mutation for AllMasteries {
    type Output = BTreeMap<String, Prediction>;

    fn name(&self) -> &'static str {
        "get_all_masteries"
    }

    fn validate(&self, _: &Roster) -> Result<(), RosterError> {
        Ok(())
    }

    fn apply(
        &self,
        working: &mut Roster,
        _: &dyn Predictor,
    ) -> Result<BTreeMap<String, Prediction>, RosterError> {
        Ok(working.mastery_of_all_topics(&self.student))
    }

    fn converged(&self, _: &Roster, working: &Roster) -> bool {
        working
            .skills()
            .iter()
            .all(|topic| working.is_enrolled(topic, &self.student))
    }
}

/// Responses for one student across one or more topics.
///
/// Convergence is count based: every touched history must have grown by
/// exactly the number of recorded bits. Comparing probabilities would never
/// converge when the model legitimately returns the same value twice.
pub(crate) struct RecordResponses {
    pub student: String,
    pub responses: BTreeMap<String, ResponseBits>,
}

impl Mutation for RecordResponses {
    type Output = BTreeMap<String, Prediction>;

    fn name(&self) -> &'static str {
        if self.responses.len() == 1 {
            "record_response"
        } else {
            "record_responses_multi_topic"
        }
    }

    fn validate(&self, loaded: &Roster) -> Result<(), RosterError> {
        self.responses
            .keys()
            .try_for_each(|topic| loaded.ensure_topic(topic))
    }

    fn apply(
        &self,
        working: &mut Roster,
        predictor: &dyn Predictor,
    ) -> Result<BTreeMap<String, Prediction>, RosterError> {
        self.responses
            .iter()
            .map(|(topic, bits)| {
                working
                    .record_responses(topic, &self.student, bits.as_slice(), predictor)
                    .map(|prediction| (topic.clone(), prediction))
            })
            .collect()
    }

    fn converged(&self, loaded: &Roster, working: &Roster) -> bool {
        self.responses.iter().all(|(topic, bits)| {
            let expected = loaded.history_len(topic, &self.student) + bits.len();
            working.history_len(topic, &self.student) == expected
                && working.mastery_of(topic, &self.student).is_ok()
        })
    }
}

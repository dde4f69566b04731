//! Per-topic enrollment and mastery state.
//!
//! Every method here assumes the caller already holds the roster lease. The
//! coordinator in [`crate::sync`] is the only code that mutates a roster
//! shared between workers.

mod response;

pub use response::ResponseBits;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::catalog::TopicCatalog;
use crate::error::RosterError;
use crate::predictor::{Predictor, PredictorError};

/// Mastery shown for a student the predictor has no estimate for yet.
pub const DEFAULT_MASTERY: f64 = 0.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum Prediction {
    Untrained,
    Mastery(f64),
}

impl Prediction {
    pub fn probability(self) -> Option<f64> {
        match self {
            Prediction::Mastery(p) => Some(p),
            Prediction::Untrained => None,
        }
    }

    pub fn is_trained(self) -> bool {
        matches!(self, Prediction::Mastery(_))
    }

    pub fn or_default(self) -> f64 {
        self.probability().unwrap_or(DEFAULT_MASTERY)
    }

    fn checked(self, topic: &str) -> Result<Self, PredictorError> {
        match self {
            Prediction::Mastery(value) if !(0.0..=1.0).contains(&value) => {
                Err(PredictorError::OutOfRange {
                    topic: topic.to_string(),
                    value,
                })
            }
            other => Ok(other),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SkillRoster {
    students: BTreeSet<String>,
    history: BTreeMap<String, Vec<bool>>,
    cached_probability: BTreeMap<String, Prediction>,
}

impl SkillRoster {
    pub fn students(&self) -> &BTreeSet<String> {
        &self.students
    }

    pub fn contains(&self, student: &str) -> bool {
        self.students.contains(student)
    }

    pub fn len(&self) -> usize {
        self.students.len()
    }

    pub fn is_empty(&self) -> bool {
        self.students.is_empty()
    }

    pub fn history(&self, student: &str) -> Option<&[bool]> {
        self.history.get(student).map(Vec::as_slice)
    }

    pub fn cached(&self, student: &str) -> Option<Prediction> {
        self.cached_probability.get(student).copied()
    }

    /// Returns true when the student was not enrolled before.
    fn insert(&mut self, student: &str) -> bool {
        if !self.students.insert(student.to_string()) {
            return false;
        }
        self.history.insert(student.to_string(), Vec::new());
        self.cached_probability
            .insert(student.to_string(), Prediction::Untrained);
        true
    }

    fn remove(&mut self, student: &str) -> bool {
        self.history.remove(student);
        self.cached_probability.remove(student);
        self.students.remove(student)
    }

    fn record(
        &mut self,
        topic: &str,
        student: &str,
        bits: &[bool],
        predictor: &dyn Predictor,
    ) -> Result<Prediction, RosterError> {
        let newly_enrolled = self.insert(student);
        let history = self.history.entry(student.to_string()).or_default();
        let before = history.len();
        history.extend_from_slice(bits);

        match predictor
            .predict(topic, history)
            .and_then(|prediction| prediction.checked(topic))
        {
            Ok(prediction) => {
                self.cached_probability
                    .insert(student.to_string(), prediction);
                Ok(prediction)
            }
            Err(err) => {
                history.truncate(before);
                if newly_enrolled {
                    self.remove(student);
                }
                Err(err.into())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Roster {
    skills: BTreeSet<String>,
    skill_rosters: BTreeMap<String, SkillRoster>,
}

impl Roster {
    /// Empty roster: every topic present, nobody enrolled.
    pub fn new<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let skills: BTreeSet<String> = topics.into_iter().map(Into::into).collect();
        let skill_rosters = skills
            .iter()
            .map(|topic| (topic.clone(), SkillRoster::default()))
            .collect();
        Self {
            skills,
            skill_rosters,
        }
    }

    pub fn from_catalog(catalog: &dyn TopicCatalog) -> Self {
        Self::new(catalog.all_topic_ids())
    }

    pub fn skills(&self) -> &BTreeSet<String> {
        &self.skills
    }

    pub fn skill_rosters(&self) -> &BTreeMap<String, SkillRoster> {
        &self.skill_rosters
    }

    pub fn skill_roster(&self, topic: &str) -> Result<&SkillRoster, RosterError> {
        self.skill_rosters
            .get(topic)
            .ok_or_else(|| RosterError::invalid_topic(topic))
    }

    fn skill_roster_mut(&mut self, topic: &str) -> Result<&mut SkillRoster, RosterError> {
        self.skill_rosters
            .get_mut(topic)
            .ok_or_else(|| RosterError::invalid_topic(topic))
    }

    pub fn ensure_topic(&self, topic: &str) -> Result<(), RosterError> {
        self.skill_roster(topic).map(|_| ())
    }

    pub fn is_enrolled(&self, topic: &str, student: &str) -> bool {
        self.skill_rosters
            .get(topic)
            .is_some_and(|roster| roster.contains(student))
    }

    pub fn history_len(&self, topic: &str, student: &str) -> usize {
        self.skill_rosters
            .get(topic)
            .and_then(|roster| roster.history(student))
            .map_or(0, <[bool]>::len)
    }

    /// Adds students not yet enrolled; returns how many were added.
    pub fn enroll<I, S>(&mut self, topic: &str, students: I) -> Result<usize, RosterError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let roster = self.skill_roster_mut(topic)?;
        Ok(students
            .into_iter()
            .filter(|student| roster.insert(student.as_ref()))
            .count())
    }

    /// Removes enrolled students with their history. Students that are not
    /// enrolled are skipped.
    pub fn unenroll<I, S>(&mut self, topic: &str, students: I) -> Result<usize, RosterError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let roster = self.skill_roster_mut(topic)?;
        Ok(students
            .into_iter()
            .filter(|student| roster.remove(student.as_ref()))
            .count())
    }

    /// Returns the number of topics the student was removed from.
    pub fn unenroll_everywhere(&mut self, student: &str) -> usize {
        let mut removed = 0;
        for roster in self.skill_rosters.values_mut() {
            if roster.remove(student) {
                removed += 1;
            }
        }
        removed
    }

    pub fn record_response(
        &mut self,
        topic: &str,
        student: &str,
        correct: bool,
        predictor: &dyn Predictor,
    ) -> Result<Prediction, RosterError> {
        self.record_responses(topic, student, &[correct], predictor)
    }

    /// Appends every bit, auto-enrolling the student, then asks the predictor
    /// once with the full history. On predictor failure the roster is left as
    /// it was before the call.
    pub fn record_responses(
        &mut self,
        topic: &str,
        student: &str,
        bits: &[bool],
        predictor: &dyn Predictor,
    ) -> Result<Prediction, RosterError> {
        self.skill_roster_mut(topic)?
            .record(topic, student, bits, predictor)
    }

    pub fn mastery_of(&self, topic: &str, student: &str) -> Result<Prediction, RosterError> {
        let roster = self.skill_roster(topic)?;
        if !roster.contains(student) {
            return Err(RosterError::not_enrolled(topic, student));
        }
        Ok(roster.cached(student).unwrap_or(Prediction::Untrained))
    }

    /// Auto-enrolls the student in every topic it is missing from.
    pub fn mastery_of_all_topics(&mut self, student: &str) -> BTreeMap<String, Prediction> {
        self.skill_rosters
            .iter_mut()
            .map(|(topic, roster)| {
                roster.insert(student);
                let prediction = roster.cached(student).unwrap_or(Prediction::Untrained);
                (topic.clone(), prediction)
            })
            .collect()
    }

    pub fn mastery_of_all_students(
        &self,
        topic: &str,
    ) -> Result<BTreeMap<String, Prediction>, RosterError> {
        let roster = self.skill_roster(topic)?;
        Ok(roster
            .students
            .iter()
            .map(|student| {
                let prediction = roster.cached(student).unwrap_or(Prediction::Untrained);
                (student.clone(), prediction)
            })
            .collect())
    }

    /// Recomputes every cached prediction from stored histories. Students the
    /// predictor fails on keep their previous value. Returns the failure count.
    pub fn refresh_predictions(&mut self, predictor: &dyn Predictor) -> usize {
        let mut failures = 0;
        for (topic, roster) in self.skill_rosters.iter_mut() {
            for (student, history) in roster.history.iter() {
                match predictor
                    .predict(topic, history)
                    .and_then(|prediction| prediction.checked(topic))
                {
                    Ok(prediction) => {
                        roster
                            .cached_probability
                            .insert(student.clone(), prediction);
                    }
                    Err(err) => {
                        tracing::warn!(
                            topic = %topic,
                            student = %student,
                            error = %err,
                            "prediction refresh failed, keeping stored value"
                        );
                        failures += 1;
                    }
                }
            }
        }
        failures
    }

    pub fn validate(&self) -> Result<(), RosterError> {
        if !self.skills.iter().eq(self.skill_rosters.keys()) {
            return Err(RosterError::CorruptSnapshot(
                "skill rosters do not match skills".to_string(),
            ));
        }

        for (topic, roster) in &self.skill_rosters {
            let stray = roster
                .history
                .keys()
                .chain(roster.cached_probability.keys())
                .find(|student| !roster.students.contains(*student));
            if let Some(student) = stray {
                return Err(RosterError::CorruptSnapshot(format!(
                    "topic {topic} has state for unenrolled student {student}"
                )));
            }

            if let Some((student, value)) = roster
                .cached_probability
                .iter()
                .find_map(|(s, p)| match p {
                    Prediction::Mastery(v) if !(0.0..=1.0).contains(v) => Some((s, *v)),
                    _ => None,
                })
            {
                return Err(RosterError::CorruptSnapshot(format!(
                    "topic {topic} has out-of-range mastery {value} for {student}"
                )));
            }
        }
        Ok(())
    }
}

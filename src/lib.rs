pub mod cache;
pub mod catalog;
pub mod config;
pub mod error;
pub mod logging;
pub mod predictor;
pub mod roster;
pub mod store;
pub mod sync;

pub use crate::error::RosterError;
pub use crate::roster::{Prediction, Roster, SkillRoster};
pub use crate::sync::{RecoverySource, RosterCoordinator};

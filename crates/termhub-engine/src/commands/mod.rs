//! Command validation and per-session sequencing.

pub mod manager;
pub mod policy;

pub use manager::{CommandManager, CommandRequest, CommandStats};
pub use policy::{detect_side_effects, CommandPreprocessor, CommandValidator, Verdict};

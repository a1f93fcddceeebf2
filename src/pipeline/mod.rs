//! Pipeline message types shared by every stage.

pub mod messages;
